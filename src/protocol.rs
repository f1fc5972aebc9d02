// protocol.rs — JSON wire types for /health and /embeddings.

use serde::{Deserialize, Serialize};

/// `POST /embeddings` body. Order of `input` is the order of the returned `data`.
#[derive(Debug, Deserialize)]
pub struct EncodeRequest {
    pub input: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EncodeItem {
    pub index: usize,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EncodeResponse {
    pub data: Vec<EncodeItem>,
    pub model: String,
}

impl EncodeResponse {
    /// Pair each vector with its input position.
    pub fn from_vectors(vectors: Vec<Vec<f32>>, model: &str) -> Self {
        Self {
            data: vectors
                .into_iter()
                .enumerate()
                .map(|(index, embedding)| EncodeItem { index, embedding })
                .collect(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}
