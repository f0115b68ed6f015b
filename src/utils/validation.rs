use std::path::Path;

use crate::config::IntakeConfig;
use crate::error::{Issue, IssueCode, IntakeError};

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Format, size and dimension limits for uploaded pages
#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub allowed_mimes: Vec<String>,
    pub allowed_extensions: Vec<String>,
    pub max_file_size: u64,
    pub min_dimensions: (u32, u32),
    pub max_dimensions: (u32, u32),
    pub aspect_ratio_min: f64,
    pub aspect_ratio_max: f64,
}

impl ValidationRules {
    pub fn from_config(config: &IntakeConfig) -> Self {
        Self {
            allowed_mimes: config.allowed_mimes.clone(),
            allowed_extensions: config.allowed_extensions.clone(),
            max_file_size: config.max_file_size,
            min_dimensions: (config.min_width, config.min_height),
            max_dimensions: (config.max_width, config.max_height),
            aspect_ratio_min: config.aspect_ratio_min,
            aspect_ratio_max: config.aspect_ratio_max,
        }
    }

    /// Returns the normalized type if it is on the allow-list
    pub fn check_mime(&self, file_id: &str, content_type: &str) -> Result<String, IntakeError> {
        let normalized = normalize_mime(content_type);
        if self.allowed_mimes.iter().any(|m| *m == normalized) {
            return Ok(normalized);
        }
        Err(IntakeError::InvalidFormat {
            file_id: file_id.to_string(),
            reason: format!("MIME type '{}' is not allowed", content_type),
        })
    }

    /// Returns the sanitized file name if its extension is on the allow-list
    pub fn check_extension(&self, file_id: &str, filename: &str) -> Result<String, IntakeError> {
        let invalid = |reason: String| IntakeError::InvalidFormat {
            file_id: file_id.to_string(),
            reason,
        };
        let sanitized = sanitize_filename(filename).map_err(|e| invalid(e.message))?;
        let ext = extension_of(&sanitized)
            .ok_or_else(|| invalid(format!("File name '{}' has no extension", sanitized)))?;
        if !self.allowed_extensions.contains(&ext) {
            return Err(invalid(format!("File extension '.{}' is not allowed", ext)));
        }
        Ok(sanitized)
    }

    pub fn check_size(&self, file_id: &str, size: u64) -> Result<(), IntakeError> {
        if size > self.max_file_size {
            return Err(IntakeError::FileTooLarge {
                file_id: file_id.to_string(),
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }

    pub fn check_dimensions(&self, file_id: &str, width: u32, height: u32) -> Result<(), IntakeError> {
        let (min_w, min_h) = self.min_dimensions;
        let (max_w, max_h) = self.max_dimensions;
        if width < min_w || height < min_h || width > max_w || height > max_h {
            return Err(IntakeError::InvalidDimensions {
                file_id: file_id.to_string(),
                width,
                height,
                min: self.min_dimensions,
                max: self.max_dimensions,
            });
        }
        Ok(())
    }

    /// Height/width outside the expected page range is only a warning
    pub fn aspect_warning(&self, width: u32, height: u32) -> Option<Issue> {
        if width == 0 {
            return None;
        }
        let ratio = height as f64 / width as f64;
        if ratio >= self.aspect_ratio_min && ratio <= self.aspect_ratio_max {
            return None;
        }
        Some(
            Issue::new(
                IssueCode::AspectRatio,
                format!(
                    "Aspect ratio {:.2} is outside {:.2}-{:.2}",
                    ratio, self.aspect_ratio_min, self.aspect_ratio_max
                ),
            )
            .with_details(serde_json::json!({
                "ratio": ratio,
                "min": self.aspect_ratio_min,
                "max": self.aspect_ratio_max,
            })),
        )
    }
}

/// Lowercases, drops parameters and folds common aliases
pub fn normalize_mime(content_type: &str) -> String {
    let normalized = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    match normalized.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/x-png" => "image/png".to_string(),
        _ => normalized,
    }
}

pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .filter(|e| !e.is_empty())
}

/// Client-chosen file ids end up in blob keys
pub fn is_valid_file_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && file_id.len() <= 128
        && file_id != "."
        && file_id != ".."
        && file_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Sanitizes filename to prevent path traversal and injection attacks
pub fn sanitize_filename(filename: &str) -> Result<String, ValidationError> {
    // Only the final path component counts
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if name.is_empty() {
        return Err(ValidationError {
            code: "INVALID_FILENAME",
            message: "Filename cannot be empty".to_string(),
        });
    }

    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path components stripped from file name: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ';')
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let sanitized = if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    if sanitized.starts_with('.') {
        return Err(ValidationError {
            code: "HIDDEN_FILE",
            message: "Hidden files (starting with '.') are not allowed".to_string(),
        });
    }

    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ValidationRules {
        ValidationRules::from_config(&IntakeConfig::default())
    }

    #[test]
    fn test_check_mime() {
        let rules = rules();
        assert_eq!(rules.check_mime("p", "image/PNG").unwrap(), "image/png");
        assert_eq!(rules.check_mime("p", "image/jpg").unwrap(), "image/jpeg");
        assert_eq!(
            rules.check_mime("p", "image/webp; q=1").unwrap(),
            "image/webp"
        );
        let err = rules.check_mime("p", "application/pdf").unwrap_err();
        assert_eq!(err.code(), "INVALID_FORMAT");
    }

    #[test]
    fn test_check_extension() {
        let rules = rules();
        assert_eq!(
            rules.check_extension("p", "scans/page-1.JPG").unwrap(),
            "page-1.JPG"
        );
        assert!(rules.check_extension("p", "page.bmp").is_err());
        assert!(rules.check_extension("p", "page").is_err());
        assert!(rules.check_extension("p", ".png").is_err());
    }

    #[test]
    fn test_check_dimensions() {
        let rules = rules();
        assert!(rules.check_dimensions("p", 800, 1200).is_ok());
        assert!(rules.check_dimensions("p", 10_000, 10_000).is_ok());
        let err = rules.check_dimensions("p", 500, 500).unwrap_err();
        let details = err.details();
        assert_eq!(details["min"]["width"], 800);
        assert_eq!(details["width"], 500);
        assert!(rules.check_dimensions("p", 10_001, 12_000).is_err());
    }

    #[test]
    fn test_check_size() {
        let rules = rules();
        assert!(rules.check_size("p", rules.max_file_size).is_ok());
        assert!(rules.check_size("p", rules.max_file_size + 1).is_err());
    }

    #[test]
    fn test_aspect_warning() {
        let rules = rules();
        assert!(rules.aspect_warning(800, 1200).is_none());
        let warning = rules.aspect_warning(1200, 800).unwrap();
        assert_eq!(warning.code, IssueCode::AspectRatio);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("page.png").unwrap(), "page.png");
        assert_eq!(
            sanitize_filename("page<1>.png").unwrap(),
            "page_1_.png"
        );
        assert_eq!(sanitize_filename("../../etc/page.png").unwrap(), "page.png");
        assert!(sanitize_filename("").is_err());
    }

    #[test]
    fn test_file_id_rules() {
        assert!(is_valid_file_id("page-001.png"));
        assert!(is_valid_file_id("A_b.9"));
        assert!(!is_valid_file_id(""));
        assert!(!is_valid_file_id(".."));
        assert!(!is_valid_file_id("a/b"));
        assert!(!is_valid_file_id(&"x".repeat(129)));
    }
}
