use image::DynamicImage;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::config::IntakeConfig;
use crate::models::{DuplicateCandidate, DuplicateMethod, FileKey};

const GRID: u32 = 8;
const BINS: usize = 16;

/// Perceptual signature of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    /// 8x8 average hash, bit `row * 8 + col` set when the cell is brighter than the mean
    pub average_hash: u64,
    /// 16 bins per RGB channel, each channel normalized to sum to 1
    pub histogram: Vec<f64>,
}

impl Fingerprint {
    pub fn of(image: &DynamicImage) -> Self {
        Self {
            average_hash: average_hash(image),
            histogram: color_histogram(image),
        }
    }
}

pub fn average_hash(image: &DynamicImage) -> u64 {
    let luma = image.to_luma8();
    let (w, h) = luma.dimensions();
    let raw = luma.as_raw();

    let mut cells = [0f64; (GRID * GRID) as usize];
    for row in 0..GRID {
        let y0 = (row * h / GRID).min(h.saturating_sub(1));
        let y1 = ((row + 1) * h / GRID).max(y0 + 1).min(h);
        for col in 0..GRID {
            let x0 = (col * w / GRID).min(w.saturating_sub(1));
            let x1 = ((col + 1) * w / GRID).max(x0 + 1).min(w);
            let mut sum: u64 = 0;
            for y in y0..y1 {
                let start = (y * w) as usize;
                sum += raw[start + x0 as usize..start + x1 as usize]
                    .iter()
                    .map(|p| *p as u64)
                    .sum::<u64>();
            }
            let count = ((y1 - y0) as u64 * (x1 - x0) as u64).max(1);
            cells[(row * GRID + col) as usize] = sum as f64 / count as f64;
        }
    }

    let mean = cells.iter().sum::<f64>() / cells.len() as f64;
    cells
        .iter()
        .enumerate()
        .filter(|(_, v)| **v > mean)
        .fold(0u64, |hash, (i, _)| hash | (1u64 << i))
}

pub fn color_histogram(image: &DynamicImage) -> Vec<f64> {
    let rgb = image.to_rgb8();
    let mut counts = vec![0u64; BINS * 3];
    for pixel in rgb.pixels() {
        for (channel, value) in pixel.0.iter().enumerate() {
            counts[channel * BINS + (*value as usize * BINS / 256)] += 1;
        }
    }
    let total = (rgb.width() as u64 * rgb.height() as u64).max(1) as f64;
    counts.into_iter().map(|c| c as f64 / total).collect()
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Pearson correlation. A constant vector only correlates with an identical one.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return if a[..n] == b[..n] { 1.0 } else { 0.0 };
    }
    (cov / (var_a * var_b).sqrt()).clamp(-1.0, 1.0)
}

#[derive(Debug, Clone)]
struct IndexedImage {
    key: FileKey,
    fingerprint: Fingerprint,
}

/// Collection-scoped index of accepted pages and the matching rules.
pub struct DuplicateDetector {
    hash_threshold: f64,
    histogram_threshold: f64,
    histogram_hash_floor: f64,
    index: RwLock<HashMap<String, Vec<IndexedImage>>>,
}

impl DuplicateDetector {
    pub fn new(config: &IntakeConfig) -> Self {
        Self::with_thresholds(
            config.duplicate_threshold,
            config.histogram_threshold,
            config.histogram_hash_floor,
        )
    }

    pub fn with_thresholds(hash_threshold: f64, histogram_threshold: f64, histogram_hash_floor: f64) -> Self {
        Self {
            hash_threshold,
            histogram_threshold,
            histogram_hash_floor,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Compares two fingerprints; `None` when they are not a likely duplicate.
    pub fn compare(
        &self,
        file_id: &str,
        probe: &Fingerprint,
        matched: &FileKey,
        prior: &Fingerprint,
    ) -> Option<DuplicateCandidate> {
        let distance = hamming_distance(probe.average_hash, prior.average_hash);
        let hash_similarity = 1.0 - distance as f64 / 64.0;
        let correlation = pearson(&probe.histogram, &prior.histogram);

        let (method, similarity) = if distance == 0 || hash_similarity >= self.hash_threshold {
            (DuplicateMethod::HashDistance, hash_similarity)
        } else if correlation >= self.histogram_threshold
            && hash_similarity >= self.histogram_hash_floor
        {
            (DuplicateMethod::HistogramCorrelation, correlation)
        } else {
            return None;
        };

        Some(DuplicateCandidate {
            file_id: file_id.to_string(),
            matched_session_id: matched.session_id,
            matched_file_id: matched.file_id.clone(),
            similarity,
            hamming_distance: distance,
            histogram_correlation: correlation,
            method,
        })
    }

    /// Candidates among the collection's accepted pages, best match first.
    pub async fn find_candidates(
        &self,
        collection_ref: &str,
        key: &FileKey,
        probe: &Fingerprint,
    ) -> Vec<DuplicateCandidate> {
        let index = self.index.read().await;
        let Some(entries) = index.get(collection_ref) else {
            return Vec::new();
        };
        let mut candidates: Vec<DuplicateCandidate> = entries
            .iter()
            .filter(|e| e.key != *key)
            .filter_map(|e| self.compare(&key.file_id, probe, &e.key, &e.fingerprint))
            .collect();
        candidates.sort_by(|a, b| {
            a.hamming_distance
                .cmp(&b.hamming_distance)
                .then_with(|| b.similarity.total_cmp(&a.similarity))
        });
        candidates
    }

    pub async fn insert(&self, collection_ref: &str, key: FileKey, fingerprint: Fingerprint) {
        let mut index = self.index.write().await;
        let entries = index.entry(collection_ref.to_string()).or_default();
        if entries.iter().any(|e| e.key == key) {
            return;
        }
        entries.push(IndexedImage { key, fingerprint });
    }

    pub async fn len(&self, collection_ref: &str) -> usize {
        self.index
            .read()
            .await
            .get(collection_ref)
            .map(|e| e.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{PagePattern, flat_image, page_image};
    use uuid::Uuid;

    fn page(pattern: PagePattern) -> Fingerprint {
        Fingerprint::of(&page_image(800, 1200, pattern))
    }

    #[test]
    fn test_average_hash_of_patterns() {
        let checker = page(PagePattern::Checkerboard);
        let left = page(PagePattern::LeftHalf);
        let top = page(PagePattern::TopHalf);
        assert_eq!(hamming_distance(checker.average_hash, left.average_hash), 32);
        assert_eq!(hamming_distance(checker.average_hash, top.average_hash), 32);
        assert_eq!(hamming_distance(left.average_hash, top.average_hash), 32);
        // Left half: the four leftmost cells of every row
        assert_eq!(left.average_hash, 0x0F0F_0F0F_0F0F_0F0F);
    }

    #[test]
    fn test_histogram_is_normalized() {
        let hist = color_histogram(&flat_image(10, 10, 200));
        assert_eq!(hist.len(), 48);
        assert_eq!(hist[200 * 16 / 256], 1.0);
        assert!((hist.iter().sum::<f64>() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_pearson_edge_cases() {
        assert!((pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-12);
        assert!((pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]) + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&[0.5, 0.5], &[0.5, 0.5]), 1.0);
        assert_eq!(pearson(&[0.5, 0.5], &[0.1, 0.9]), 0.0);
    }

    #[tokio::test]
    async fn test_identical_image_is_candidate() {
        let detector = DuplicateDetector::new(&IntakeConfig::default());
        let first = FileKey::new(Uuid::new_v4(), "p1");
        let fp = page(PagePattern::Checkerboard);
        detector.insert("book", first.clone(), fp.clone()).await;
        detector.insert("book", first.clone(), fp.clone()).await;
        assert_eq!(detector.len("book").await, 1);

        let probe = FileKey::new(Uuid::new_v4(), "p9");
        let candidates = detector.find_candidates("book", &probe, &fp).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].hamming_distance, 0);
        assert_eq!(candidates[0].method, DuplicateMethod::HashDistance);
        assert_eq!(candidates[0].matched_file_id, "p1");

        // Never a duplicate of itself, nor of another collection
        assert!(detector.find_candidates("book", &first, &fp).await.is_empty());
        assert!(detector.find_candidates("other", &probe, &fp).await.is_empty());
    }

    #[tokio::test]
    async fn test_different_layouts_are_not_candidates() {
        let detector = DuplicateDetector::new(&IntakeConfig::default());
        let checker = page(PagePattern::Checkerboard);
        detector
            .insert("book", FileKey::new(Uuid::new_v4(), "p1"), checker)
            .await;
        let probe = FileKey::new(Uuid::new_v4(), "p2");
        let candidates = detector
            .find_candidates("book", &probe, &page(PagePattern::LeftHalf))
            .await;
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_histogram_match_needs_hash_floor() {
        let detector = DuplicateDetector::with_thresholds(0.95, 0.98, 0.75);
        let prior_key = FileKey::new(Uuid::nil(), "prior");
        let histogram = vec![0.25; 48];
        let prior = Fingerprint {
            average_hash: 0,
            histogram: histogram.clone(),
        };
        // 8 bits apart: similarity 0.875, below the hash threshold but above the floor
        let near = Fingerprint {
            average_hash: 0xFF,
            histogram: histogram.clone(),
        };
        let candidate = detector.compare("p", &near, &prior_key, &prior).unwrap();
        assert_eq!(candidate.method, DuplicateMethod::HistogramCorrelation);

        // 32 bits apart: the histogram alone is not enough
        let far = Fingerprint {
            average_hash: 0xFFFF_FFFF,
            histogram,
        };
        assert!(detector.compare("p", &far, &prior_key, &prior).is_none());
    }

    #[test]
    fn test_lower_threshold_never_loses_candidates() {
        let prior_key = FileKey::new(Uuid::nil(), "prior");
        let prior = Fingerprint {
            average_hash: 0,
            histogram: (0..48).map(|i| i as f64).collect(),
        };
        for bits in [0u32, 2, 4, 6, 8, 12, 16, 24, 32] {
            let probe = Fingerprint {
                average_hash: if bits == 0 { 0 } else { u64::MAX >> (64 - bits) },
                histogram: (0..48).map(|i| (47 - i) as f64).collect(),
            };
            let mut previously_matched = false;
            for threshold in [0.99, 0.95, 0.9, 0.8, 0.7, 0.5] {
                let detector = DuplicateDetector::with_thresholds(threshold, 0.98, 0.75);
                let matched = detector.compare("p", &probe, &prior_key, &prior).is_some();
                assert!(matched || !previously_matched, "bits={} t={}", bits, threshold);
                previously_matched = matched;
            }
        }
    }
}
