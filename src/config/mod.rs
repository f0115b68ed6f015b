use std::env;
use std::str::FromStr;

/// Runtime configuration for the upload intake pipeline
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Maximum size of a single file in bytes (default: 20 MB)
    pub max_file_size: u64,

    /// Ceiling for a session's accepted bytes (default: 200 MB)
    pub max_session_bytes: u64,

    /// Ceiling for a session's admitted file count (default: 500)
    pub max_session_files: u32,

    /// Chunk size recommended to clients (default: 1 MiB)
    pub chunk_size: u64,

    /// Largest chunk payload accepted (default: 8 MiB)
    pub max_chunk_size: u64,

    /// Largest declared chunk count per file (default: 4096)
    pub max_chunks_per_file: u32,

    /// Idle time after which a session expires (default: 1 hour)
    pub session_idle_ttl_secs: u64,

    /// How long finished sessions stay queryable (default: 24 hours)
    pub session_retention_hours: u64,

    /// Interval between expiry sweeps (default: 60 seconds)
    pub expiry_sweep_interval_secs: u64,

    /// Files decoded and analyzed at the same time (default: 4)
    pub analysis_concurrency: usize,

    /// Perceptual-hash similarity that flags a duplicate (default: 0.90)
    pub duplicate_threshold: f64,

    /// Histogram correlation that flags a duplicate (default: 0.98)
    pub histogram_threshold: f64,

    /// Minimum hash similarity before histogram correlation is considered (default: 0.75)
    pub histogram_hash_floor: f64,

    pub allowed_mimes: Vec<String>,
    pub allowed_extensions: Vec<String>,

    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,

    /// Height/width range outside of which a warning is recorded
    pub aspect_ratio_min: f64,
    pub aspect_ratio_max: f64,

    /// Blob backend: "memory", "local" or "s3" (default: "memory")
    pub storage_backend: String,
    /// Root directory for the "local" backend
    pub local_storage_path: String,

    pub minio_endpoint: Option<String>,
    pub minio_access_key: Option<String>,
    pub minio_secret_key: Option<String>,
    pub minio_bucket: Option<String>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_file_size: 20 * 1024 * 1024,      // 20 MB
            max_session_bytes: 200 * 1024 * 1024, // 200 MB
            max_session_files: 500,
            chunk_size: 1024 * 1024,         // 1 MiB
            max_chunk_size: 8 * 1024 * 1024, // 8 MiB
            max_chunks_per_file: 4096,
            session_idle_ttl_secs: 3600,
            session_retention_hours: 24,
            expiry_sweep_interval_secs: 60,
            analysis_concurrency: 4,
            duplicate_threshold: 0.90,
            histogram_threshold: 0.98,
            histogram_hash_floor: 0.75,
            allowed_mimes: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
                "image/gif".to_string(),
            ],
            allowed_extensions: vec![
                "jpg".to_string(),
                "jpeg".to_string(),
                "png".to_string(),
                "webp".to_string(),
                "gif".to_string(),
            ],
            min_width: 800,
            min_height: 1200,
            max_width: 10_000,
            max_height: 10_000,
            aspect_ratio_min: 1.2,
            aspect_ratio_max: 1.8,
            storage_backend: "memory".to_string(),
            local_storage_path: "./data/intake".to_string(),
            minio_endpoint: None,
            minio_access_key: None,
            minio_secret_key: None,
            minio_bucket: None,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

fn parse_list(key: &str, fallback: Vec<String>) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or(fallback)
}

impl IntakeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_file_size: parse_env("MAX_FILE_SIZE", default.max_file_size),
            max_session_bytes: parse_env("MAX_SESSION_BYTES", default.max_session_bytes),
            max_session_files: parse_env("MAX_SESSION_FILES", default.max_session_files),
            chunk_size: parse_env("CHUNK_SIZE", default.chunk_size),
            max_chunk_size: parse_env("MAX_CHUNK_SIZE", default.max_chunk_size),
            max_chunks_per_file: parse_env("MAX_CHUNKS_PER_FILE", default.max_chunks_per_file),
            session_idle_ttl_secs: parse_env(
                "SESSION_IDLE_TTL_SECS",
                default.session_idle_ttl_secs,
            ),
            session_retention_hours: parse_env(
                "SESSION_RETENTION_HOURS",
                default.session_retention_hours,
            ),
            expiry_sweep_interval_secs: parse_env(
                "EXPIRY_SWEEP_INTERVAL_SECS",
                default.expiry_sweep_interval_secs,
            ),
            analysis_concurrency: parse_env("ANALYSIS_CONCURRENCY", default.analysis_concurrency)
                .max(1),
            duplicate_threshold: parse_env("DUPLICATE_THRESHOLD", default.duplicate_threshold)
                .clamp(0.0, 1.0),
            histogram_threshold: parse_env("HISTOGRAM_THRESHOLD", default.histogram_threshold)
                .clamp(0.0, 1.0),
            histogram_hash_floor: parse_env("HISTOGRAM_HASH_FLOOR", default.histogram_hash_floor)
                .clamp(0.0, 1.0),
            allowed_mimes: parse_list("ALLOWED_MIMES", default.allowed_mimes),
            allowed_extensions: parse_list("ALLOWED_EXTENSIONS", default.allowed_extensions),
            min_width: parse_env("MIN_WIDTH", default.min_width),
            min_height: parse_env("MIN_HEIGHT", default.min_height),
            max_width: parse_env("MAX_WIDTH", default.max_width),
            max_height: parse_env("MAX_HEIGHT", default.max_height),
            aspect_ratio_min: parse_env("ASPECT_RATIO_MIN", default.aspect_ratio_min),
            aspect_ratio_max: parse_env("ASPECT_RATIO_MAX", default.aspect_ratio_max),
            storage_backend: env::var("STORAGE_BACKEND")
                .map(|v| v.to_lowercase())
                .unwrap_or(default.storage_backend),
            local_storage_path: env::var("LOCAL_STORAGE_PATH")
                .unwrap_or(default.local_storage_path),
            minio_endpoint: env::var("MINIO_ENDPOINT").ok(),
            minio_access_key: env::var("MINIO_ACCESS_KEY").ok(),
            minio_secret_key: env::var("MINIO_SECRET_KEY").ok(),
            minio_bucket: env::var("MINIO_BUCKET").ok(),
        }
    }

    /// Create config for development (in-memory blobs, fast sweeps)
    pub fn development() -> Self {
        Self {
            expiry_sweep_interval_secs: 5,
            session_retention_hours: 1,
            storage_backend: "memory".to_string(),
            ..Self::default()
        }
    }

    pub fn idle_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_idle_ttl_secs.min(i64::MAX as u64) as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_retention_hours.min(i32::MAX as u64) as i64)
    }

    /// Pixel count of the smallest acceptable page
    pub fn floor_pixels(&self) -> u64 {
        self.min_width as u64 * self.min_height as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IntakeConfig::default();
        assert_eq!(config.max_file_size, 20 * 1024 * 1024);
        assert_eq!(config.max_session_bytes, 200 * 1024 * 1024);
        assert_eq!(config.max_session_files, 500);
        assert_eq!((config.min_width, config.min_height), (800, 1200));
        assert_eq!((config.max_width, config.max_height), (10_000, 10_000));
        assert_eq!(config.storage_backend, "memory");
    }

    #[test]
    fn test_development_config() {
        let config = IntakeConfig::development();
        assert_eq!(config.expiry_sweep_interval_secs, 5);
        assert_eq!(config.max_file_size, IntakeConfig::default().max_file_size);
    }

    #[test]
    fn test_from_env_overrides() {
        unsafe {
            env::set_var("MAX_SESSION_FILES", "12");
            env::set_var("ALLOWED_EXTENSIONS", "PNG, jpg");
            env::set_var("DUPLICATE_THRESHOLD", "1.7");
        }
        let config = IntakeConfig::from_env();
        unsafe {
            env::remove_var("MAX_SESSION_FILES");
            env::remove_var("ALLOWED_EXTENSIONS");
            env::remove_var("DUPLICATE_THRESHOLD");
        }
        assert_eq!(config.max_session_files, 12);
        assert_eq!(config.allowed_extensions, vec!["png", "jpg"]);
        assert_eq!(config.duplicate_threshold, 1.0);
    }

    #[test]
    fn test_floor_pixels() {
        assert_eq!(IntakeConfig::default().floor_pixels(), 960_000);
    }
}
