//! Text embedding contract and a deterministic local implementation.

use async_trait::async_trait;

use crate::AiResult;

pub const EMBEDDING_DIM: usize = 256;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one unit-length vector per input.
    async fn embed(&self, texts: &[String]) -> AiResult<Vec<Vec<f32>>>;
}

/// Feature-hash embedding: each token lands in a signed bucket picked by
/// its blake3 hash. No semantics, but deterministic, order-insensitive and
/// overlap-sensitive, which is enough for local runs and for exercising
/// the related search end to end.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dim: EMBEDDING_DIM }
    }
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        assert!(0 < dim, "embedding dimension must be positive");
        Self { dim }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dim];
        for token in tokens(text) {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let bucket = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"))
                as usize
                % self.dim;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if 0.0 < norm {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> AiResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}
