use image::{DynamicImage, ImageFormat};
use serde_json::json;
use std::io::Cursor;

use crate::config::IntakeConfig;
use crate::error::{IntakeError, Issue, IssueCode};
use crate::models::FileDeclaration;
use crate::utils::validation::{ValidationRules, normalize_mime};

pub struct ValidatedImage {
    pub image: DynamicImage,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub warnings: Vec<Issue>,
}

pub enum ValidationOutcome {
    Validated(ValidatedImage),
    Rejected(Vec<Issue>),
}

fn image_format(mime: &str) -> Option<ImageFormat> {
    match mime {
        "image/jpeg" => Some(ImageFormat::Jpeg),
        "image/png" => Some(ImageFormat::Png),
        "image/gif" => Some(ImageFormat::Gif),
        "image/webp" => Some(ImageFormat::WebP),
        _ => None,
    }
}

fn decode_failure(message: String) -> Issue {
    Issue::new(IssueCode::DecodeFailure, message)
}

fn invalid_format(reason: impl Into<String>, details: serde_json::Value) -> Issue {
    Issue::new(IssueCode::InvalidFormat, reason).with_details(details)
}

/// Structural checks on an assembled page, cheapest first.
#[derive(Debug, Clone)]
pub struct ValidationPipeline {
    rules: ValidationRules,
}

impl ValidationPipeline {
    pub fn new(config: &IntakeConfig) -> Self {
        Self {
            rules: ValidationRules::from_config(config),
        }
    }

    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    /// Refuses a declaration that can never pass, before any bytes are stored.
    pub fn precheck(&self, file_id: &str, decl: &FileDeclaration) -> Result<(), IntakeError> {
        if let Some(mime) = decl.mime_type.as_deref() {
            self.rules.check_mime(file_id, mime)?;
        }
        if let Some(name) = decl.name.as_deref() {
            self.rules.check_extension(file_id, name)?;
        }
        if let Some(size) = decl.total_size {
            self.rules.check_size(file_id, size)?;
        }
        if let (Some(width), Some(height)) = (decl.width, decl.height) {
            self.rules.check_dimensions(file_id, width, height)?;
        }
        Ok(())
    }

    /// Runs every check on the assembled bytes. CPU-bound: call from a blocking task.
    pub fn validate(&self, file_id: &str, decl: &FileDeclaration, bytes: &[u8]) -> ValidationOutcome {
        match self.run(file_id, decl, bytes) {
            Ok(validated) => ValidationOutcome::Validated(validated),
            Err(issue) => ValidationOutcome::Rejected(vec![issue]),
        }
    }

    fn run(&self, file_id: &str, decl: &FileDeclaration, bytes: &[u8]) -> Result<ValidatedImage, Issue> {
        // 1. Content type, sniffed and declared
        let declared = decl.mime_type.as_deref().map(normalize_mime);
        let Some(sniffed) = infer::get(bytes).map(|t| normalize_mime(t.mime_type())) else {
            return Err(invalid_format(
                "content is not a recognised image format",
                json!({ "file_id": file_id, "declared_mime": declared }),
            ));
        };
        let mime_type = self
            .rules
            .check_mime(file_id, &sniffed)
            .map_err(|e| issue_of(&e))?;
        if let Some(declared) = declared.as_deref() {
            if declared != mime_type {
                return Err(invalid_format(
                    format!("declared type {} but content is {}", declared, mime_type),
                    json!({
                        "file_id": file_id,
                        "declared_mime": declared,
                        "detected_mime": mime_type,
                    }),
                ));
            }
        }

        // 2. Extension
        let Some(name) = decl.name.as_deref() else {
            return Err(invalid_format(
                "file name was never declared",
                json!({ "file_id": file_id }),
            ));
        };
        self.rules
            .check_extension(file_id, name)
            .map_err(|e| issue_of(&e))?;

        // 3. Size
        self.rules
            .check_size(file_id, bytes.len() as u64)
            .map_err(|e| issue_of(&e))?;

        // 4. Header
        let format = image_format(&mime_type).ok_or_else(|| {
            invalid_format(
                format!("no decoder for {}", mime_type),
                json!({ "file_id": file_id, "detected_mime": mime_type }),
            )
        })?;
        let (width, height) = image::io::Reader::with_format(Cursor::new(bytes), format)
            .into_dimensions()
            .map_err(|e| decode_failure(format!("unreadable image header: {}", e)))?;

        // 5. Dimensions
        if let Err(e) = self.rules.check_dimensions(file_id, width, height) {
            let mut issue = issue_of(&e);
            issue.details["declared"] = json!({ "width": decl.width, "height": decl.height });
            return Err(issue);
        }

        // 6. Full decode
        let image = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| decode_failure(format!("image data is corrupt: {}", e)))?;

        let mut warnings = Vec::new();
        if let Some(warning) = self.rules.aspect_warning(width, height) {
            warnings.push(warning);
        }
        let declared_dims = (decl.width, decl.height);
        if (declared_dims.0.is_some() && declared_dims.0 != Some(width))
            || (declared_dims.1.is_some() && declared_dims.1 != Some(height))
        {
            warnings.push(
                Issue::new(
                    IssueCode::DimensionMismatch,
                    format!("declared size differs from actual {}x{}", width, height),
                )
                .with_details(json!({
                    "declared": { "width": decl.width, "height": decl.height },
                    "actual": { "width": width, "height": height },
                })),
            );
        }

        Ok(ValidatedImage {
            image,
            width,
            height,
            mime_type,
            warnings,
        })
    }
}

fn issue_of(err: &IntakeError) -> Issue {
    err.to_issue()
        .unwrap_or_else(|| Issue::new(IssueCode::InvalidFormat, err.to_string()))
}
