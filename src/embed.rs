//! Embedding collaborator.
//!
//! The cache consumes a pure `embed(text) -> unit vector` function behind
//! a trait so an external model can be injected. The built-in
//! implementation is a deterministic feature-hashing embedder, which keeps
//! the proxy self-contained and the tests hermetic.

use anyhow::Result;

pub const EMBEDDING_DIM: usize = 384;

pub trait Embedder: Send + Sync {
    /// Must complete before the orchestrator starts accepting traffic.
    fn ready(&self) -> Result<()>;

    /// Unit vector of dimension [`EMBEDDING_DIM`].
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Token + bigram feature hashing onto the fixed dimension, signed by a
/// second hash bit, L2-normalized.
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn new() -> Self {
        HashEmbedder
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

impl Embedder for HashEmbedder {
    fn ready(&self) -> Result<()> {
        Ok(())
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0f32; EMBEDDING_DIM];
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let mut bump = |feature: &str| {
            let h = fnv1a(feature.as_bytes());
            let idx = (h % EMBEDDING_DIM as u64) as usize;
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        };

        for token in &tokens {
            bump(token);
        }
        for pair in tokens.windows(2) {
            bump(&format!("{} {}", pair[0], pair[1]));
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            // Degenerate input still yields a unit vector.
            v[0] = 1.0;
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cosine distance between two unit vectors (1 - dot).
    fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        (1.0 - dot as f64).max(0.0)
    }

    #[test]
    fn test_unit_norm() {
        let e = HashEmbedder::new();
        let v = e.embed("summarize the quarterly report").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(v.len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_deterministic() {
        let e = HashEmbedder::new();
        assert_eq!(e.embed("same input").unwrap(), e.embed("same input").unwrap());
    }

    #[test]
    fn test_identical_text_is_zero_distance() {
        let e = HashEmbedder::new();
        let a = e.embed("list open incidents").unwrap();
        let b = e.embed("list open incidents").unwrap();
        assert!(cosine_distance(&a, &b) < 1e-6);
    }

    #[test]
    fn test_similar_texts_are_closer_than_unrelated() {
        let e = HashEmbedder::new();
        let base = e.embed("list all open incidents for the payments team").unwrap();
        let near = e.embed("list all open incidents for the billing team").unwrap();
        let far = e.embed("compose a haiku about autumn leaves").unwrap();
        assert!(cosine_distance(&base, &near) < cosine_distance(&base, &far));
    }

    #[test]
    fn test_empty_input_is_unit_vector() {
        let e = HashEmbedder::new();
        let v = e.embed("").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
