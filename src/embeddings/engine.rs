// engine.rs — Order-preserving batch encode with mandatory L2 normalization.
//
// The engine owns the loaded provider for the whole process lifetime. It never caches,
// never reorders, and fails the whole batch if any part of it fails.

use anyhow::{bail, Context};

use crate::config::{self, ServiceConfig};
use crate::embeddings::bert::BertEncoder;
use crate::embeddings::resolver::{ModelDescriptor, ResolvedModel};

/// Raw text → vector capability. One row per input, in input order, each `dimension()` long.
///
/// Implementations are synchronous; async callers go through `spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed_raw(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

pub struct EmbeddingEngine {
    model_id: String,
    provider: Box<dyn EmbeddingProvider>,
    dimension: usize,
    batch_size: usize,
}

impl EmbeddingEngine {
    pub fn new(model_id: impl Into<String>, provider: Box<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        let dimension = provider.dimension();
        Self {
            model_id: model_id.into(),
            provider,
            dimension,
            batch_size: batch_size.max(1),
        }
    }

    /// Load the BERT encoder from a resolved model directory.
    pub fn load(desc: &ModelDescriptor, resolved: &ResolvedModel, cfg: &ServiceConfig) -> anyhow::Result<Self> {
        let encoder = BertEncoder::load(resolved, cfg.max_tokens, desc.expected_dimension)
            .with_context(|| format!("failed to load model {} from {}", desc.model_id, resolved.dir.display()))?;
        Ok(Self::from_descriptor(desc, Box::new(encoder), cfg.batch_size))
    }

    /// The engine reports the descriptor's model id, whichever source the files came from.
    pub fn from_descriptor(desc: &ModelDescriptor, provider: Box<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self::new(desc.model_id.clone(), provider, batch_size)
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Encode `texts` into unit-length vectors, one per input, same order.
    pub fn encode(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());

        for (chunk_no, chunk) in texts.chunks(self.batch_size).enumerate() {
            let offset = chunk_no * self.batch_size;
            let raw = self
                .provider
                .embed_raw(chunk)
                .with_context(|| format!("encode failed for inputs {}..{}", offset, offset + chunk.len()))?;

            if raw.len() != chunk.len() {
                bail!(
                    "provider returned {} vectors for {} inputs (offset {})",
                    raw.len(),
                    chunk.len(),
                    offset
                );
            }

            for (i, mut row) in raw.into_iter().enumerate() {
                if row.len() != self.dimension {
                    bail!(
                        "vector {} has dimension {}, expected {}",
                        offset + i,
                        row.len(),
                        self.dimension
                    );
                }
                l2_normalize(&mut row).with_context(|| format!("vector {}", offset + i))?;
                out.push(row);
            }
        }

        Ok(out)
    }
}

/// Rescale `v` in place to unit Euclidean norm.
pub fn l2_normalize(v: &mut [f32]) -> anyhow::Result<()> {
    let norm = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if !norm.is_finite() {
        bail!("non-finite values in embedding");
    }
    if norm < config::encode::MIN_NORM as f64 {
        bail!("zero-norm embedding cannot be normalized");
    }
    v.iter_mut().for_each(|x| *x = (*x as f64 / norm) as f32);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::fake::FakeProvider;

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_encode_preserves_order_and_normalizes() {
        let engine = EmbeddingEngine::new("m", Box::new(FakeProvider::new(4)), 32);
        let texts: Vec<String> = ["alpha", "b", "gamma ray", ""].iter().map(|s| s.to_string()).collect();

        let out = engine.encode(&texts).unwrap();

        assert_eq!(out.len(), texts.len());
        for (text, v) in texts.iter().zip(&out) {
            assert_eq!(v.len(), 4);
            assert!((norm(v) - 1.0).abs() <= 1e-4, "norm of {text:?} is {}", norm(v));
            // Same direction as the raw vector for this text.
            let mut expected = FakeProvider::raw_vector(text, 4);
            l2_normalize(&mut expected).unwrap();
            assert_eq!(v, &expected);
        }
    }

    #[test]
    fn test_empty_batch_does_not_touch_provider() {
        let provider = FakeProvider::new(4);
        let calls = provider.calls();
        let engine = EmbeddingEngine::new("m", Box::new(provider), 32);

        assert!(engine.encode(&[]).unwrap().is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_large_batch_is_split_in_order() {
        let provider = FakeProvider::new(3);
        let calls = provider.calls();
        let engine = EmbeddingEngine::new("m", Box::new(provider), 2);
        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();

        let out = engine.encode(&texts).unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![2, 2, 1]);
        for (text, v) in texts.iter().zip(&out) {
            let mut expected = FakeProvider::raw_vector(text, 3);
            l2_normalize(&mut expected).unwrap();
            assert_eq!(v, &expected);
        }
    }

    #[test]
    fn test_repeated_encode_is_identical() {
        let engine = EmbeddingEngine::new("m", Box::new(FakeProvider::new(8)), 32);
        let texts = vec!["x".to_string()];
        assert_eq!(engine.encode(&texts).unwrap(), engine.encode(&texts).unwrap());
    }

    #[test]
    fn test_provider_failure_fails_whole_batch() {
        let engine = EmbeddingEngine::new("m", Box::new(FakeProvider::new(4).fail_on("boom")), 1);
        let texts: Vec<String> = ["ok", "boom", "ok too"].iter().map(|s| s.to_string()).collect();

        let err = engine.encode(&texts).unwrap_err();
        assert!(format!("{err:#}").contains("inputs 1..2"));
    }

    #[test]
    fn test_wrong_row_count_is_error() {
        let engine = EmbeddingEngine::new("m", Box::new(FakeProvider::new(4).drop_last_row()), 32);
        let texts = vec!["a".to_string(), "b".to_string()];
        assert!(engine.encode(&texts).is_err());
    }

    #[test]
    fn test_wrong_dimension_is_error() {
        let engine = EmbeddingEngine::new("m", Box::new(FakeProvider::new(4).with_row_len(3)), 32);
        let err = engine.encode(&["a".to_string()]).unwrap_err();
        assert!(err.to_string().contains("expected 4"));
    }

    #[test]
    fn test_l2_normalize_rejects_degenerate_vectors() {
        assert!(l2_normalize(&mut [0.0, 0.0]).is_err());
        assert!(l2_normalize(&mut [f32::NAN, 1.0]).is_err());

        let mut v = [3.0f32, 4.0];
        l2_normalize(&mut v).unwrap();
        assert_eq!(v, [0.6, 0.8]);
    }

    #[test]
    fn test_model_id_and_dimension() {
        let engine = EmbeddingEngine::new("BAAI/bge-small-zh-v1.5", Box::new(FakeProvider::new(512)), 32);
        assert_eq!(engine.model_id(), "BAAI/bge-small-zh-v1.5");
        assert_eq!(engine.dimension(), 512);
    }
}
