use image::{DynamicImage, GrayImage};

use crate::models::{ComponentScores, QualityMeasurements, QualityReport, QualityTier};

const SHARPNESS_WEIGHT: f64 = 0.30;
const CONTRAST_WEIGHT: f64 = 0.20;
const BRIGHTNESS_WEIGHT: f64 = 0.15;
const ARTIFACT_WEIGHT: f64 = 0.20;
const RESOLUTION_WEIGHT: f64 = 0.15;

/// Mean luma range that scores full marks
const BRIGHTNESS_LOW: f64 = 40.0;
const BRIGHTNESS_HIGH: f64 = 220.0;
/// Luma standard deviation that scores full marks
const CONTRAST_FULL: f64 = 64.0;
/// Laplacian variance that scores full marks
const SHARPNESS_FULL: f64 = 1000.0;
/// Boundary/interior step ratio above 1 that scores zero
const BLOCKINESS_SPAN: f64 = 1.5;
const BLOCK: u32 = 8;

/// Tier cut-offs on the overall score
pub const REJECT_BELOW: f64 = 40.0;
pub const ACCEPT_ABOVE: f64 = 70.0;

/// Scores decoded pages. Pure: identical pixels always give an identical report.
#[derive(Debug, Clone, Copy)]
pub struct QualityAnalyzer {
    floor_pixels: u64,
}

/// Variance of a sample from integer sums, computed without cancellation error
fn variance(count: u64, sum: i128, sum_sq: u128) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let n = count as u128;
    let numerator = n * sum_sq - (sum * sum) as u128;
    numerator as f64 / (n * n) as f64
}

fn luma_stats(luma: &GrayImage) -> (f64, f64) {
    let mut sum: u64 = 0;
    let mut sum_sq: u64 = 0;
    for p in luma.as_raw() {
        let v = *p as u64;
        sum += v;
        sum_sq += v * v;
    }
    let count = luma.as_raw().len() as u64;
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = sum as f64 / count as f64;
    let var = variance(count, sum as i128, sum_sq as u128);
    (mean, var.max(0.0).sqrt())
}

/// Variance of the 4-neighbour Laplacian over interior pixels
fn laplacian_variance(luma: &GrayImage) -> f64 {
    let (w, h) = luma.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let raw = luma.as_raw();
    let at = |x: u32, y: u32| raw[(y * w + x) as usize] as i64;

    let mut count: u64 = 0;
    let mut sum: i64 = 0;
    let mut sum_sq: u64 = 0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let l = 4 * at(x, y) - at(x - 1, y) - at(x + 1, y) - at(x, y - 1) - at(x, y + 1);
            count += 1;
            sum += l;
            sum_sq += (l * l) as u64;
        }
    }
    variance(count, sum as i128, sum_sq as u128)
}

/// Mean neighbour step across 8x8 block boundaries over the mean step elsewhere
fn blockiness(luma: &GrayImage) -> f64 {
    let (w, h) = luma.dimensions();
    if w <= BLOCK || h <= BLOCK {
        return 1.0;
    }
    let raw = luma.as_raw();
    let at = |x: u32, y: u32| raw[(y * w + x) as usize] as i64;

    let (mut edge_sum, mut edge_count) = (0u64, 0u64);
    let (mut inner_sum, mut inner_count) = (0u64, 0u64);
    for y in 0..h {
        for x in 0..w {
            if x > 0 {
                let step = (at(x, y) - at(x - 1, y)).unsigned_abs();
                if x % BLOCK == 0 {
                    edge_sum += step;
                    edge_count += 1;
                } else {
                    inner_sum += step;
                    inner_count += 1;
                }
            }
            if y > 0 {
                let step = (at(x, y) - at(x, y - 1)).unsigned_abs();
                if y % BLOCK == 0 {
                    edge_sum += step;
                    edge_count += 1;
                } else {
                    inner_sum += step;
                    inner_count += 1;
                }
            }
        }
    }

    let edge_mean = edge_sum as f64 / edge_count.max(1) as f64;
    let inner_mean = inner_sum as f64 / inner_count.max(1) as f64;
    if edge_mean < 1.0 && inner_mean < 1.0 {
        return 1.0;
    }
    edge_mean / inner_mean.max(f64::EPSILON)
}

fn brightness_score(mean: f64) -> f64 {
    if mean < BRIGHTNESS_LOW {
        mean / BRIGHTNESS_LOW * 100.0
    } else if mean > BRIGHTNESS_HIGH {
        (255.0 - mean) / (255.0 - BRIGHTNESS_HIGH) * 100.0
    } else {
        100.0
    }
}

pub fn tier_for(overall: f64) -> QualityTier {
    if overall < REJECT_BELOW {
        QualityTier::Reject
    } else if overall <= ACCEPT_ABOVE {
        QualityTier::NeedsReview
    } else {
        QualityTier::Accept
    }
}

impl QualityAnalyzer {
    pub fn new(floor_pixels: u64) -> Self {
        Self {
            floor_pixels: floor_pixels.max(1),
        }
    }

    fn resolution_score(&self, pixels: u64) -> f64 {
        let floor = self.floor_pixels as f64;
        let px = pixels as f64;
        if pixels >= self.floor_pixels {
            // Full marks at four times the floor
            50.0 + 50.0 * ((px - floor) / (3.0 * floor)).clamp(0.0, 1.0)
        } else {
            50.0 * px / floor
        }
    }

    pub fn analyze(&self, file_id: &str, image: &DynamicImage) -> QualityReport {
        let luma = image.to_luma8();
        let (width, height) = luma.dimensions();
        let pixels = width as u64 * height as u64;

        let (mean, std_dev) = luma_stats(&luma);
        let edge_energy = laplacian_variance(&luma);
        let block_ratio = blockiness(&luma);

        let artifact_level = ((block_ratio - 1.0) / BLOCKINESS_SPAN).clamp(0.0, 1.0);
        let scores = ComponentScores {
            sharpness: 100.0 * (edge_energy / SHARPNESS_FULL).min(1.0),
            contrast: 100.0 * (std_dev / CONTRAST_FULL).min(1.0),
            brightness: brightness_score(mean).clamp(0.0, 100.0),
            compression_artifacts: 100.0 * (1.0 - artifact_level),
            resolution: self.resolution_score(pixels),
        };

        let overall = (scores.sharpness * SHARPNESS_WEIGHT
            + scores.contrast * CONTRAST_WEIGHT
            + scores.brightness * BRIGHTNESS_WEIGHT
            + scores.compression_artifacts * ARTIFACT_WEIGHT
            + scores.resolution * RESOLUTION_WEIGHT)
            .clamp(0.0, 100.0);

        QualityReport {
            file_id: file_id.to_string(),
            measurements: QualityMeasurements {
                width,
                height,
                mean_luminance: mean,
                luminance_std_dev: std_dev,
                edge_energy,
                blockiness: block_ratio,
                megapixels: pixels as f64 / 1_000_000.0,
            },
            scores,
            overall,
            tier: tier_for(overall),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{PagePattern, flat_image, page_image};
    use image::{Rgb, RgbImage};

    const FLOOR: u64 = 800 * 1200;

    #[test]
    fn test_flat_gray_page_needs_review() {
        let report = QualityAnalyzer::new(FLOOR).analyze("p", &flat_image(800, 1200, 128));
        assert_eq!(report.scores.sharpness, 0.0);
        assert_eq!(report.scores.contrast, 0.0);
        assert_eq!(report.scores.brightness, 100.0);
        assert_eq!(report.scores.compression_artifacts, 100.0);
        assert_eq!(report.scores.resolution, 50.0);
        assert!((report.overall - 42.5).abs() < 1e-9);
        assert_eq!(report.tier, QualityTier::NeedsReview);
    }

    #[test]
    fn test_black_page_is_rejected() {
        let report = QualityAnalyzer::new(FLOOR).analyze("p", &flat_image(800, 1200, 0));
        assert_eq!(report.scores.brightness, 0.0);
        assert!((report.overall - 27.5).abs() < 1e-9);
        assert_eq!(report.tier, QualityTier::Reject);
    }

    #[test]
    fn test_striped_page_is_accepted() {
        for pattern in [
            PagePattern::Checkerboard,
            PagePattern::LeftHalf,
            PagePattern::TopHalf,
        ] {
            let report = QualityAnalyzer::new(FLOOR).analyze("p", &page_image(800, 1200, pattern));
            assert_eq!(report.scores.sharpness, 100.0, "{:?}", pattern);
            assert_eq!(report.scores.contrast, 100.0, "{:?}", pattern);
            assert_eq!(report.tier, QualityTier::Accept, "{:?}", pattern);
            assert!(report.overall > 85.0, "{:?}: {}", pattern, report.overall);
        }
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let image = page_image(800, 1200, PagePattern::Checkerboard);
        let analyzer = QualityAnalyzer::new(FLOOR);
        assert_eq!(analyzer.analyze("p", &image), analyzer.analyze("p", &image));
    }

    #[test]
    fn test_block_grid_lowers_artifact_score() {
        // Flat 8x8 tiles: every step sits on a block boundary
        let img = RgbImage::from_fn(64, 64, |x, y| {
            let v = if ((x / 8) + (y / 8)) % 2 == 0 { 100 } else { 140 };
            Rgb([v, v, v])
        });
        let report = QualityAnalyzer::new(FLOOR).analyze("p", &DynamicImage::ImageRgb8(img));
        assert!(report.measurements.blockiness > 2.5);
        assert_eq!(report.scores.compression_artifacts, 0.0);
    }

    #[test]
    fn test_resolution_score_scales_to_target() {
        let analyzer = QualityAnalyzer::new(FLOOR);
        assert_eq!(analyzer.resolution_score(FLOOR / 2), 25.0);
        assert_eq!(analyzer.resolution_score(FLOOR), 50.0);
        assert_eq!(analyzer.resolution_score(FLOOR * 4), 100.0);
        assert_eq!(analyzer.resolution_score(FLOOR * 10), 100.0);
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(tier_for(39.99), QualityTier::Reject);
        assert_eq!(tier_for(40.0), QualityTier::NeedsReview);
        assert_eq!(tier_for(70.0), QualityTier::NeedsReview);
        assert_eq!(tier_for(70.01), QualityTier::Accept);
    }
}
