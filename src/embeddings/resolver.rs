// resolver.rs — Startup decision: use the local model directory or fetch from the hub.
//
// A local directory is trusted only when it holds at least one recognized weight artifact.
// Anything else (missing dir, incomplete dir) selects the remote source, which is fetched
// exactly once. A failed fetch is fatal: there is no further fallback.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

use crate::config::{self, ServiceConfig};

/// What the service serves: one model, identified canonically, with its local home.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub local_dir: PathBuf,
    /// Recognized weight artifacts in load preference order.
    pub weight_files: Vec<String>,
    /// Dimension pin from configuration; the real value is fixed once the model loads.
    pub expected_dimension: Option<usize>,
}

impl ModelDescriptor {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self {
            model_id: cfg.model_id.clone(),
            local_dir: cfg.model_dir.clone(),
            weight_files: config::model::WEIGHT_FILES.iter().map(|s| s.to_string()).collect(),
            expected_dimension: cfg.expected_dimension,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Remote(String),
}

/// The result of a successful resolution: where the model came from and where its files are now.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub source: ModelSource,
    pub dir: PathBuf,
    pub weights: PathBuf,
}

/// Read-only view of the filesystem used by the completeness check.
pub trait ArtifactStore {
    fn is_dir(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
}

pub struct LocalFs;

impl ArtifactStore for LocalFs {
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Remote fetch capability. Implementations place the model files under `dest`
/// and return the directory that now holds them.
pub trait ModelFetcher {
    fn fetch(&self, model_id: &str, dest: &Path) -> anyhow::Result<PathBuf>;
}

/// First recognized weight artifact present in `dir`, in preference order.
pub fn find_weights(dir: &Path, weight_files: &[String], store: &dyn ArtifactStore) -> Option<PathBuf> {
    if !store.is_dir(dir) {
        return None;
    }
    weight_files
        .iter()
        .map(|name| dir.join(name))
        .find(|p| store.is_file(p))
}

/// Pure decision over filesystem state. Never touches the network.
pub fn select_source(desc: &ModelDescriptor, store: &dyn ArtifactStore) -> ModelSource {
    if !store.is_dir(&desc.local_dir) {
        log::info!("Model dir {} does not exist", desc.local_dir.display());
        return ModelSource::Remote(desc.model_id.clone());
    }
    match find_weights(&desc.local_dir, &desc.weight_files, store) {
        Some(_) => ModelSource::Local(desc.local_dir.clone()),
        None => {
            log::warn!(
                "Model dir {} is incomplete (none of {:?} present)",
                desc.local_dir.display(),
                desc.weight_files
            );
            ModelSource::Remote(desc.model_id.clone())
        }
    }
}

/// Select the source and, when remote, fetch it. Errors here are fatal at startup.
pub fn resolve(
    desc: &ModelDescriptor,
    store: &dyn ArtifactStore,
    fetcher: &dyn ModelFetcher,
) -> anyhow::Result<ResolvedModel> {
    let source = select_source(desc, store);

    let dir = match &source {
        ModelSource::Local(path) => {
            log::info!("Using local model at {}", path.display());
            path.clone()
        }
        ModelSource::Remote(model_id) => {
            log::info!("Fetching model {} into {}", model_id, desc.local_dir.display());
            fetcher
                .fetch(model_id, &desc.local_dir)
                .with_context(|| format!("failed to fetch model {model_id}"))?
        }
    };

    let Some(weights) = find_weights(&dir, &desc.weight_files, store) else {
        bail!(
            "model dir {} has no weight artifact after resolution (expected one of {:?})",
            dir.display(),
            desc.weight_files
        );
    };

    log::info!("Resolved model {} ({:?}), weights {}", desc.model_id, source, weights.display());

    Ok(ResolvedModel { source, dir, weights })
}
