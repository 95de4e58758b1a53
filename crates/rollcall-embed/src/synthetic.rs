//! Deterministic stand-in for the embedding service.
//!
//! The vector is derived from a SHA-256 seed of the image bytes and expanded
//! with a fixed linear congruential generator, so the same bytes always give
//! bit-identical output. Identical images therefore match each other with
//! similarity 1.

use async_trait::async_trait;
use rollcall_core::Embedding;
use sha2::{Digest, Sha256};

use crate::{EmbedError, Embedder};

/// Dimension of synthetic embeddings.
pub const SYNTHETIC_DIM: usize = 384;

const LCG_MULTIPLIER: u64 = 9301;
const LCG_INCREMENT: u64 = 49297;
const LCG_MODULUS: u64 = 233_280;

pub struct SyntheticEmbedder {
    dim: usize,
}

impl Default for SyntheticEmbedder {
    fn default() -> Self {
        Self::new(SYNTHETIC_DIM)
    }
}

impl SyntheticEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

/// Seed derived from the input bytes.
pub fn seed_for(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// Raw (unnormalized) pseudo-random vector in [-1, 1) for `seed`.
pub fn synthesize(seed: u64, dim: usize) -> Vec<f32> {
    let mut state = seed % LCG_MODULUS;
    (0..dim)
        .map(|_| {
            state = (state * LCG_MULTIPLIER + LCG_INCREMENT) % LCG_MODULUS;
            (state as f64 / LCG_MODULUS as f64 * 2.0 - 1.0) as f32
        })
        .collect()
}

#[async_trait]
impl Embedder for SyntheticEmbedder {
    async fn extract_embedding(
        &self,
        image: &[u8],
        subject: &str,
    ) -> Result<Embedding, EmbedError> {
        if image.is_empty() {
            return Err(EmbedError::BadInput("empty image".into()));
        }
        let seed = seed_for(image);
        tracing::debug!(subject, seed, dim = self.dim, "synthesizing embedding");
        Embedding::from_raw(synthesize(seed, self.dim)).ok_or(EmbedError::NoFaceDetected)
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}
