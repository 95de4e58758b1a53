//! rollcall-embed — Client for the external face-embedding service.
//!
//! The service turns an image into a fixed-length vector (or fails). This
//! crate classifies its failures, retries transient ones under an explicit
//! [`RetryPolicy`], normalizes every returned vector, and offers a
//! deterministic synthetic mode for tests and offline runs.

pub mod client;
pub mod retry;
pub mod synthetic;

use async_trait::async_trait;
use rollcall_core::Embedding;
use thiserror::Error;

pub use client::{ClientConfig, EmbeddingClient};
pub use retry::RetryPolicy;
pub use synthetic::SyntheticEmbedder;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbedError {
    #[error("embedding service timed out: {0}")]
    Timeout(String),
    #[error("embedding service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("embedding service rejected the input: {0}")]
    BadInput(String),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),
}

/// Source of face embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Extract a unit-normalized embedding from raw image bytes.
    ///
    /// `subject` is the identifier sent alongside the image (a regNo at
    /// registration, `"scan"` for probes).
    async fn extract_embedding(&self, image: &[u8], subject: &str)
        -> Result<Embedding, EmbedError>;

    /// Best-effort readiness probe. Never gates extraction.
    async fn is_healthy(&self) -> bool;
}
