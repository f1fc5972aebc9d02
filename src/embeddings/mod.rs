// embeddings/ — Model resolution and sentence embedding using candle (pure Rust).
//
// Provides:
// - Local/remote model resolution with completeness check
// - Hub download with SHA256 verification
// - BERT inference with CLS or mean pooling
// - Order-preserving, L2-normalized batch encode

pub mod bert;
pub mod download;
pub mod engine;
pub mod resolver;

#[cfg(test)]
pub mod fake;
