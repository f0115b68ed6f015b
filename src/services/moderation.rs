use serde_json::json;

use crate::error::{Issue, IssueCode};
use crate::models::{DuplicateCandidate, QualityReport, QualityTier, Verdict};

pub struct ModerationInput<'a> {
    pub validation_issues: &'a [Issue],
    pub quality: Option<&'a QualityReport>,
    pub duplicates: &'a [DuplicateCandidate],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModerationDecision {
    pub verdict: Verdict,
    pub reasons: Vec<Issue>,
}

/// Turns validation, quality and duplicate findings into a verdict.
/// Structural problems win over quality, quality over duplicates.
pub fn decide(input: ModerationInput<'_>) -> ModerationDecision {
    if !input.validation_issues.is_empty() {
        return ModerationDecision {
            verdict: Verdict::Rejected,
            reasons: input.validation_issues.to_vec(),
        };
    }

    let mut reasons = Vec::new();
    if let Some(report) = input.quality {
        let details = json!({ "overall": report.overall, "scores": report.scores });
        match report.tier {
            QualityTier::Reject => {
                return ModerationDecision {
                    verdict: Verdict::Rejected,
                    reasons: vec![
                        Issue::new(
                            IssueCode::LowQuality,
                            format!("quality score {:.1} is below the acceptance floor", report.overall),
                        )
                        .with_details(details),
                    ],
                };
            }
            QualityTier::NeedsReview => reasons.push(
                Issue::new(
                    IssueCode::QualityReview,
                    format!("quality score {:.1} needs a human look", report.overall),
                )
                .with_details(details),
            ),
            QualityTier::Accept => {}
        }
    }

    if let Some(best) = input.duplicates.first() {
        reasons.push(
            Issue::new(
                IssueCode::PossibleDuplicate,
                format!(
                    "resembles {} from session {}",
                    best.matched_file_id, best.matched_session_id
                ),
            )
            .with_details(json!({
                "candidates": input.duplicates.len(),
                "hamming_distance": best.hamming_distance,
                "similarity": best.similarity,
            })),
        );
    }

    let verdict = if reasons.is_empty() {
        Verdict::Accepted
    } else {
        Verdict::NeedsReview
    };
    ModerationDecision { verdict, reasons }
}
