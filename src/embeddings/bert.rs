// bert.rs — Candle BERT encoder with attention-mask-aware pooling.
//
// Loads config.json, tokenizer.json and the resolved weight artifact (safetensors via mmap,
// or a PyTorch .bin). Pooling follows the sentence-transformers 1_Pooling/config.json when
// present (CLS for the BGE family), mean pooling otherwise.
//
// Returns raw pooled vectors; normalization is the engine's job.

use std::path::Path;

use anyhow::{anyhow, bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::Deserialize;
use tokenizers::{PostProcessor, Tokenizer, TruncationParams};

use crate::config;
use crate::embeddings::engine::EmbeddingProvider;
use crate::embeddings::resolver::ResolvedModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    Cls,
    Mean,
}

#[derive(Debug, Deserialize)]
struct PoolingConfig {
    #[serde(default)]
    pooling_mode_cls_token: bool,
    #[serde(default)]
    pooling_mode_mean_tokens: bool,
}

/// Pooling mode declared by the model directory. Missing config means mean pooling.
pub fn read_pooling(model_dir: &Path) -> anyhow::Result<Pooling> {
    let path = model_dir.join(config::model::POOLING_CONFIG_FILE);
    if !path.is_file() {
        return Ok(Pooling::Mean);
    }
    let raw = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PoolingConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;

    match (cfg.pooling_mode_cls_token, cfg.pooling_mode_mean_tokens) {
        (true, false) => Ok(Pooling::Cls),
        (false, true) => Ok(Pooling::Mean),
        (cls, mean) => bail!(
            "unsupported pooling in {} (cls={cls}, mean={mean}); exactly one of CLS or mean is supported",
            path.display()
        ),
    }
}

pub struct BertEncoder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    pooling: Pooling,
    dimension: usize,
    pad_id: u32,
}

impl BertEncoder {
    pub fn load(
        resolved: &ResolvedModel,
        max_tokens: usize,
        expected_dimension: Option<usize>,
    ) -> anyhow::Result<Self> {
        let device = Device::Cpu;
        let model_dir = &resolved.dir;

        let config_path = model_dir.join(config::model::CONFIG_FILE);
        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("read {}", config_path.display()))?;
        let bert_config: BertConfig = serde_json::from_str(&config_str)
            .with_context(|| format!("parse {}", config_path.display()))?;

        let dimension = bert_config.hidden_size;
        if let Some(expected) = expected_dimension {
            if expected != dimension {
                bail!(
                    "model dimension mismatch: configured {}, model has {}",
                    expected,
                    dimension
                );
            }
        }

        let pooling = read_pooling(model_dir)?;

        log::info!(
            "Loading BERT encoder: hidden_size={}, layers={}, heads={}, pooling={:?}",
            bert_config.hidden_size,
            bert_config.num_hidden_layers,
            bert_config.num_attention_heads,
            pooling,
        );

        let weights = &resolved.weights;
        let vb = if weights.extension().is_some_and(|ext| ext == "safetensors") {
            // SAFETY: the file is not modified while mapped; downloads replace files by rename.
            unsafe {
                VarBuilder::from_mmaped_safetensors(&[weights.clone()], DType::F32, &device)
                    .with_context(|| format!("load weights from {}", weights.display()))?
            }
        } else {
            VarBuilder::from_pth(weights, DType::F32, &device)
                .with_context(|| format!("load weights from {}", weights.display()))?
        };

        let model = BertModel::load(vb, &bert_config).context("load BERT model")?;

        let tokenizer_path = model_dir.join(config::model::TOKENIZER_FILE);
        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("load tokenizer {}: {e}", tokenizer_path.display()))?;

        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("[PAD]"))
            .unwrap_or(0);

        // Padding is done per sub-batch below; truncation keeps [SEP] intact.
        let max_length = max_tokens.min(bert_config.max_position_embeddings);
        tokenizer.with_padding(None);
        configure_truncation(&mut tokenizer, max_length)?;

        log::info!(
            "Encoder loaded (dims={}, max_tokens={}, pad_id={})",
            dimension,
            max_length,
            pad_id
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            pooling,
            dimension,
            pad_id,
        })
    }
}

impl EmbeddingProvider for BertEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_raw(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| anyhow!("tokenize: {e}"))?;

        let batch = encodings.len();
        let seq_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);

        // Right-pad every sequence to the longest one; padding is masked out.
        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for enc in &encodings {
            let pad = seq_len - enc.get_ids().len();
            ids.extend(enc.get_ids().iter().map(|&id| id as i64));
            ids.extend(std::iter::repeat(self.pad_id as i64).take(pad));
            mask.extend(enc.get_attention_mask().iter().map(|&m| m as i64));
            mask.extend(std::iter::repeat(0i64).take(pad));
        }

        let ids_t = Tensor::from_vec(ids, (batch, seq_len), &self.device)?;
        let mask_t = Tensor::from_vec(mask, (batch, seq_len), &self.device)?;
        let token_type_ids = ids_t.zeros_like()?;

        // [batch, seq_len, hidden_size]
        let output = self.model.forward(&ids_t, &token_type_ids, Some(&mask_t))?;

        let pooled = match self.pooling {
            Pooling::Cls => output.narrow(1, 0, 1)?.squeeze(1)?,
            Pooling::Mean => mean_pooling(&output, &mask_t)?,
        };

        Ok(pooled.to_vec2::<f32>()?)
    }
}

/// Truncate to `max_length` tokens including the special tokens the post-processor adds.
/// A limit that leaves no room for content is an error.
fn configure_truncation(tokenizer: &mut Tokenizer, max_length: usize) -> anyhow::Result<()> {
    let added = tokenizer
        .get_post_processor()
        .map(|pp| pp.added_tokens(false))
        .unwrap_or(0);
    if max_length <= added {
        bail!(
            "EMBED_MAX_TOKENS={} leaves no room for text: the tokenizer adds {} special tokens",
            max_length,
            added
        );
    }
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(|e| anyhow!("configure truncation: {e}"))?;
    Ok(())
}

/// Attention-mask-aware mean pooling.
///
/// input_embeds: [batch, seq_len, hidden_size]
/// attention_mask: [batch, seq_len] (1 for real tokens, 0 for padding)
/// output: [batch, hidden_size]
fn mean_pooling(input_embeds: &Tensor, attention_mask: &Tensor) -> anyhow::Result<Tensor> {
    let mask_expanded = attention_mask
        .to_dtype(DType::F32)?
        .unsqueeze(2)?
        .broadcast_as(input_embeds.shape())?;

    let sum_embeddings = (input_embeds * &mask_expanded)?.sum(1)?;

    // Clamp to avoid div by zero.
    let sum_mask = mask_expanded.sum(1)?.clamp(1e-9, f64::MAX)?;

    Ok((sum_embeddings / sum_mask)?)
}
