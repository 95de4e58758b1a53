use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rollcall_embed::{ClientConfig, RetryPolicy};

/// Embedding calls are retried at most once.
const MAX_EMBED_ATTEMPTS: u32 = 2;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on (default: 127.0.0.1:5000).
    pub bind_addr: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Base URL of the embedding service.
    pub face_api_url: String,
    /// Timeout for one embedding request.
    pub face_api_timeout_ms: u64,
    /// Timeout for the health probe.
    pub health_timeout_ms: u64,
    /// How long a successful health probe is trusted.
    pub health_ttl_secs: u64,
    /// Attempts per embedding request, including the first. At most 2.
    pub retry_attempts: u32,
    /// Delay before a retry.
    pub retry_backoff_ms: u64,
    /// Use deterministic synthetic embeddings instead of the service.
    pub test_mode: bool,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Minimum grayscale variance for a scan image.
    pub min_image_variance: f64,
    /// Edge length scan images are resized to before assessment.
    pub canonical_size: u32,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let bind_addr = std::env::var("ROLLCALL_BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 5000)));

        Self {
            bind_addr,
            db_path,
            face_api_url: std::env::var("ROLLCALL_FACE_API_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:7860".to_string()),
            face_api_timeout_ms: env_u64("ROLLCALL_FACE_API_TIMEOUT_MS", 60_000),
            health_timeout_ms: env_u64("ROLLCALL_HEALTH_TIMEOUT_MS", 5_000),
            health_ttl_secs: env_u64("ROLLCALL_HEALTH_TTL_SECS", 30),
            retry_attempts: env_u64("ROLLCALL_RETRY_ATTEMPTS", 2) as u32,
            retry_backoff_ms: env_u64("ROLLCALL_RETRY_BACKOFF_MS", 500),
            test_mode: std::env::var("ROLLCALL_TEST_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            similarity_threshold: env_f32(
                "ROLLCALL_SIMILARITY_THRESHOLD",
                rollcall_core::DEFAULT_SIMILARITY_THRESHOLD,
            ),
            min_image_variance: env_f32(
                "ROLLCALL_MIN_IMAGE_VARIANCE",
                rollcall_core::quality::MIN_VARIANCE as f32,
            ) as f64,
            canonical_size: env_usize(
                "ROLLCALL_CANONICAL_SIZE",
                rollcall_core::quality::CANONICAL_SIZE as usize,
            ) as u32,
        }
    }

    /// Settings for the embedding service client.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.face_api_url.clone(),
            timeout: Duration::from_millis(self.face_api_timeout_ms),
            health_timeout: Duration::from_millis(self.health_timeout_ms),
            health_ttl: Duration::from_secs(self.health_ttl_secs),
            retry: RetryPolicy::new(
                self.retry_attempts.clamp(1, MAX_EMBED_ATTEMPTS),
                vec![Duration::from_millis(self.retry_backoff_ms)],
            ),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
