// fake.rs — Deterministic in-memory provider, filesystem view and fetcher for tests.

use std::cell::Cell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;

use crate::embeddings::engine::EmbeddingProvider;
use crate::embeddings::resolver::{ArtifactStore, ModelFetcher};

pub struct FakeProvider {
    dimension: usize,
    row_len: usize,
    calls: Arc<Mutex<Vec<usize>>>,
    fail_on: Option<String>,
    drop_last_row: bool,
    delay: Option<Duration>,
}

impl FakeProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            row_len: dimension,
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_on: None,
            drop_last_row: false,
            delay: None,
        }
    }

    /// Fail any batch containing this exact text.
    pub fn fail_on(mut self, text: &str) -> Self {
        self.fail_on = Some(text.to_string());
        self
    }

    pub fn drop_last_row(mut self) -> Self {
        self.drop_last_row = true;
        self
    }

    pub fn with_row_len(mut self, len: usize) -> Self {
        self.row_len = len;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Batch sizes seen by `embed_raw`, in call order.
    pub fn calls(&self) -> Arc<Mutex<Vec<usize>>> {
        Arc::clone(&self.calls)
    }

    /// Unnormalized, strictly positive, text-dependent vector.
    pub fn raw_vector(text: &str, len: usize) -> Vec<f32> {
        let seed: usize = text.bytes().map(usize::from).sum::<usize>() + text.len();
        (0..len).map(|i| ((seed + i * 7) % 13) as f32 + 1.0).collect()
    }
}

impl EmbeddingProvider for FakeProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_raw(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.lock().unwrap().push(texts.len());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(bad) = &self.fail_on {
            if texts.iter().any(|t| t == bad) {
                bail!("simulated inference failure");
            }
        }
        let mut rows: Vec<Vec<f32>> = texts.iter().map(|t| Self::raw_vector(t, self.row_len)).collect();
        if self.drop_last_row {
            rows.pop();
        }
        Ok(rows)
    }
}

#[derive(Default)]
pub struct FakeFs {
    dirs: HashSet<PathBuf>,
    files: HashSet<PathBuf>,
}

impl FakeFs {
    pub fn with_dir(mut self, dir: &str) -> Self {
        self.dirs.insert(PathBuf::from(dir));
        self
    }

    pub fn with_file(mut self, file: &str) -> Self {
        self.files.insert(PathBuf::from(file));
        self
    }
}

impl ArtifactStore for FakeFs {
    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.contains(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.files.contains(path)
    }
}

/// Counts calls and reports a fixed directory, or fails like an unreachable hub.
pub struct StubFetcher {
    calls: Cell<usize>,
    result_dir: Option<PathBuf>,
}

impl StubFetcher {
    pub fn ok(dir: &str) -> Self {
        Self { calls: Cell::new(0), result_dir: Some(PathBuf::from(dir)) }
    }

    pub fn failing() -> Self {
        Self { calls: Cell::new(0), result_dir: None }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl ModelFetcher for StubFetcher {
    fn fetch(&self, _model_id: &str, _dest: &Path) -> anyhow::Result<PathBuf> {
        self.calls.set(self.calls.get() + 1);
        match &self.result_dir {
            Some(d) => Ok(d.clone()),
            None => bail!("network unreachable"),
        }
    }
}
