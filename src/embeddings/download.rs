// download.rs — Fetch model files from a Hugging Face compatible hub with SHA256 reporting.
//
// Files land in the configured model directory so the next start resolves locally.
// Every file is written atomically (.tmp + rename) and the weights go last: a weight
// artifact on disk is what marks the directory complete.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};

use crate::config::{self, ServiceConfig};
use crate::embeddings::resolver::ModelFetcher;

pub struct HubFetcher {
    base_url: String,
    revision: String,
    token: Option<String>,
    weights_sha256: BTreeMap<String, String>,
    agent: ureq::Agent,
}

impl HubFetcher {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config::hub::CONNECT_TIMEOUT_SECS))
            .timeout_read(Duration::from_secs(config::hub::READ_TIMEOUT_SECS))
            .build();
        Self {
            base_url: cfg.hub_base_url.clone(),
            revision: cfg.revision.clone(),
            token: cfg.hub_token.clone(),
            weights_sha256: cfg.weights_sha256.clone(),
            agent,
        }
    }

    fn file_url(&self, model_id: &str, file: &str) -> String {
        format!("{}/{}/resolve/{}/{}", self.base_url, model_id, self.revision, file)
    }

    /// Download one file. `Ok(None)` means the hub does not have it (HTTP 404).
    fn download(&self, url: &str, dest: &Path, expected_sha256: Option<&str>) -> anyhow::Result<Option<String>> {
        let filename = dest.file_name().unwrap_or_default().to_string_lossy().to_string();
        log::info!("Downloading {} from {}", filename, url);

        let mut req = self.agent.get(url);
        if let Some(token) = &self.token {
            req = req.set("Authorization", &format!("Bearer {token}"));
        }

        let resp = match req.call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(404, _)) => {
                log::info!("{} not found on hub", filename);
                return Ok(None);
            }
            Err(ureq::Error::Status(code, _)) => bail!("HTTP {code} downloading {url}"),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("failed to download {url}"))),
        };

        // Read body into memory (small BERT weights fit in RAM; safetensors validation needs the whole buffer).
        let mut body = Vec::new();
        resp.into_reader()
            .read_to_end(&mut body)
            .with_context(|| format!("failed to read response body for {url}"))?;

        let actual_hash = sha256_hex(&body);
        if let Some(expected) = expected_sha256 {
            if actual_hash != expected {
                bail!(
                    "SHA256 mismatch for {}: expected {}, got {}",
                    filename,
                    expected,
                    actual_hash
                );
            }
            log::info!("SHA256 verified for {} ({})", filename, &actual_hash[..12]);
        } else {
            log::info!("Downloaded {} ({} bytes, sha256 {})", filename, body.len(), actual_hash);
        }

        if filename.ends_with(".safetensors") {
            safetensors::SafeTensors::read_metadata(&body)
                .map_err(|e| anyhow::anyhow!("downloaded {filename} is not valid safetensors: {e:?}"))?;
        }

        write_atomic(dest, &body)?;
        Ok(Some(actual_hash))
    }
}

impl ModelFetcher for HubFetcher {
    fn fetch(&self, model_id: &str, dest: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(dest)
            .with_context(|| format!("failed to create model dir {}", dest.display()))?;

        for file in [config::model::CONFIG_FILE, config::model::TOKENIZER_FILE] {
            if self.download(&self.file_url(model_id, file), &dest.join(file), None)?.is_none() {
                bail!("{model_id} has no {file} on the hub");
            }
        }

        // Optional: without it the encoder falls back to mean pooling.
        let pooling = dest.join(config::model::POOLING_CONFIG_FILE);
        if let Some(parent) = pooling.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        self.download(
            &self.file_url(model_id, config::model::POOLING_CONFIG_FILE),
            &pooling,
            None,
        )?;

        // With pins configured, an unpinned artifact is never trusted.
        for weights in config::model::WEIGHT_FILES {
            let pin = self.weights_sha256.get(*weights).map(String::as_str);
            if pin.is_none() && !self.weights_sha256.is_empty() {
                log::info!("Skipping {} (no pinned SHA256)", weights);
                continue;
            }
            let found = self.download(&self.file_url(model_id, weights), &dest.join(weights), pin)?;
            if found.is_some() {
                log::info!("Model download complete");
                return Ok(dest.to_path_buf());
            }
        }

        bail!(
            "{model_id} has none of {:?} on the hub",
            config::model::WEIGHT_FILES
        )
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// Write to .tmp, then rename, so a crash never leaves a half-written file under the real name.
fn write_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut tmp_name = dest.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(bytes)?;
    file.flush()?;
    drop(file);

    fs::rename(&tmp_path, dest)
        .with_context(|| format!("failed to rename {} -> {}", tmp_path.display(), dest.display()))?;
    Ok(())
}
