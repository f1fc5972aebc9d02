// IMPORTANT:
// Keep ALL numeric defaults centralized here (no hardcoded numeric values scattered around).
// Runtime overrides come from the environment, see `ServiceConfig::from_env`.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

// NOTE: SERVICE_VERSION must stay in sync with the `version` field in Cargo.toml.
pub const SERVICE_VERSION: &str = "0.1.0";

pub mod logging {
    pub const DEFAULT_LEVEL: &str = "info";
    pub const LOG_FILE_NAME: &str = "embedding_service";

    pub const LOG_ROTATE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
    pub const LOG_ROTATE_KEEP_FILES: usize = 5;
}

pub mod model {
    pub const DEFAULT_MODEL_ID: &str = "BAAI/bge-small-zh-v1.5";
    pub const DEFAULT_MODEL_DIR: &str = "./model/bge-small-zh-v1.5";
    pub const DEFAULT_REVISION: &str = "main";

    // Recognized weight artifacts, in load preference order.
    // Either one makes a local model directory complete.
    pub const WEIGHT_FILES: &[&str] = &["model.safetensors", "pytorch_model.bin"];

    pub const CONFIG_FILE: &str = "config.json";
    pub const TOKENIZER_FILE: &str = "tokenizer.json";
    // sentence-transformers pooling module config (optional).
    pub const POOLING_CONFIG_FILE: &str = "1_Pooling/config.json";
}

pub mod hub {
    pub const DEFAULT_BASE_URL: &str = "https://huggingface.co";

    pub const CONNECT_TIMEOUT_SECS: u64 = 15;
    // Weights for small BERT models are ~100 MB; keep generous.
    pub const READ_TIMEOUT_SECS: u64 = 300;
}

pub mod encode {
    // Same default as sentence-transformers `encode(batch_size=32)`.
    pub const DEFAULT_BATCH_SIZE: usize = 32;
    // BERT position embedding limit.
    pub const DEFAULT_MAX_TOKENS: usize = 512;
    // Rows whose norm is below this cannot be normalized meaningfully.
    pub const MIN_NORM: f32 = 1e-12;
}

pub mod server {
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 9000;

    pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
    pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
    pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
}

/// Runtime configuration for the whole service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub model_id: String,
    pub model_dir: PathBuf,
    pub revision: String,
    pub expected_dimension: Option<usize>,
    /// Pinned digests per weight file name. When non-empty, only pinned files are fetched.
    pub weights_sha256: BTreeMap<String, String>,
    pub hub_base_url: String,
    pub hub_token: Option<String>,
    pub host: IpAddr,
    pub port: u16,
    pub batch_size: usize,
    pub max_tokens: usize,
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup (env in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset.
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host_str = get("EMBED_HOST").unwrap_or_else(|| server::DEFAULT_HOST.to_string());
        let host: IpAddr = host_str
            .parse()
            .with_context(|| format!("invalid EMBED_HOST: {host_str}"))?;

        let weights_sha256 = match get("EMBED_WEIGHTS_SHA256") {
            Some(raw) => parse_weight_pins(&raw).context("invalid EMBED_WEIGHTS_SHA256")?,
            None => BTreeMap::new(),
        };

        let cfg = Self {
            model_id: get("EMBED_MODEL_ID").unwrap_or_else(|| model::DEFAULT_MODEL_ID.to_string()),
            model_dir: PathBuf::from(get("EMBED_MODEL_DIR").unwrap_or_else(|| model::DEFAULT_MODEL_DIR.to_string())),
            revision: get("EMBED_MODEL_REVISION").unwrap_or_else(|| model::DEFAULT_REVISION.to_string()),
            expected_dimension: parse_opt(&get, "EMBED_MODEL_DIMENSION")?,
            weights_sha256,
            hub_base_url: get("EMBED_HUB_BASE_URL")
                .unwrap_or_else(|| hub::DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            hub_token: get("HF_TOKEN"),
            host,
            port: parse_opt(&get, "EMBED_PORT")?.unwrap_or(server::DEFAULT_PORT),
            batch_size: parse_opt(&get, "EMBED_BATCH_SIZE")?.unwrap_or(encode::DEFAULT_BATCH_SIZE),
            max_tokens: parse_opt(&get, "EMBED_MAX_TOKENS")?.unwrap_or(encode::DEFAULT_MAX_TOKENS),
            max_concurrency: parse_opt(&get, "EMBED_MAX_CONCURRENCY")?
                .unwrap_or(server::DEFAULT_MAX_CONCURRENCY),
            request_timeout: Duration::from_secs(
                parse_opt(&get, "EMBED_REQUEST_TIMEOUT_SECS")?
                    .unwrap_or(server::DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            max_body_bytes: parse_opt(&get, "EMBED_MAX_BODY_BYTES")?
                .unwrap_or(server::DEFAULT_MAX_BODY_BYTES),
            log_level: get("EMBED_LOG_LEVEL").unwrap_or_else(|| logging::DEFAULT_LEVEL.to_string()),
            log_dir: get("EMBED_LOG_DIR").map(PathBuf::from),
        };

        if cfg.batch_size == 0 {
            bail!("EMBED_BATCH_SIZE must be at least 1");
        }
        if cfg.max_tokens == 0 {
            bail!("EMBED_MAX_TOKENS must be at least 1");
        }
        if cfg.max_concurrency == 0 {
            bail!("EMBED_MAX_CONCURRENCY must be at least 1");
        }
        if cfg.request_timeout.is_zero() {
            bail!("EMBED_REQUEST_TIMEOUT_SECS must be at least 1");
        }
        if cfg.expected_dimension == Some(0) {
            bail!("EMBED_MODEL_DIMENSION must be at least 1");
        }

        Ok(cfg)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Parse `file=sha256hex[,file=sha256hex]`. File names must be recognized weight artifacts.
fn parse_weight_pins(raw: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let mut pins = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((file, sha)) = entry.split_once('=') else {
            bail!("expected file=sha256 pairs (e.g. model.safetensors=<hex>), got {entry:?}");
        };
        let file = file.trim();
        let sha = sha.trim().to_ascii_lowercase();
        if !model::WEIGHT_FILES.contains(&file) {
            bail!("{file:?} is not one of {:?}", model::WEIGHT_FILES);
        }
        if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("digest for {file} must be 64 hex characters");
        }
        if pins.insert(file.to_string(), sha).is_some() {
            bail!("{file} is pinned twice");
        }
    }
    Ok(pins)
}

fn parse_opt<T, G>(get: &G, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid {key}: {raw}")),
        None => Ok(None),
    }
}
