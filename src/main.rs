mod config;
mod embeddings;
mod logging;
mod protocol;
mod server;

use std::sync::Arc;

use anyhow::Context;

use crate::config::ServiceConfig;
use crate::embeddings::download::HubFetcher;
use crate::embeddings::engine::EmbeddingEngine;
use crate::embeddings::resolver::{self, LocalFs, ModelDescriptor, ModelSource};

const USAGE: &str = "\
Usage: embedding-service [--download | --help]

  (no flags)   resolve the model (fetching it if the local copy is incomplete), load it, serve HTTP
  --download   resolve/fetch the model into EMBED_MODEL_DIR and exit
  --help       print this message

Configuration is read from the environment (EMBED_MODEL_ID, EMBED_MODEL_DIR, EMBED_PORT, ...).";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    Download,
    Help,
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match parse_mode(&args) {
        Ok(m) => m,
        Err(arg) => {
            eprintln!("unknown argument: {arg}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    if let Err(e) = real_main(mode) {
        eprintln!("[embedding-service] fatal error: {e:?}");
        std::process::exit(1);
    }
}

fn parse_mode(args: &[String]) -> Result<Mode, String> {
    match args {
        [] => Ok(Mode::Serve),
        [flag] if flag == "--download" => Ok(Mode::Download),
        [flag] if flag == "--help" || flag == "-h" => Ok(Mode::Help),
        [other, ..] => Err(other.clone()),
    }
}

fn real_main(mode: Mode) -> anyhow::Result<()> {
    if mode == Mode::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let cfg = ServiceConfig::from_env().context("invalid configuration")?;
    let _logger = logging::init_logging(&cfg)?;

    let result = run(mode, &cfg);
    if let Err(e) = &result {
        log::error!("Fatal error: {:?}", e);
    }
    result
}

fn run(mode: Mode, cfg: &ServiceConfig) -> anyhow::Result<()> {
    log::info!("Model: {} (local dir {})", cfg.model_id, cfg.model_dir.display());

    // Blocking startup phase: nothing listens until the model is resolved and loaded.
    let desc = ModelDescriptor::from_config(cfg);
    let fetcher = HubFetcher::from_config(cfg);
    let resolved = resolver::resolve(&desc, &LocalFs, &fetcher)?;

    match &resolved.source {
        ModelSource::Local(path) => log::info!("Model source: local ({})", path.display()),
        ModelSource::Remote(model_id) => log::info!("Model source: {} fetched from {}", model_id, cfg.hub_base_url),
    }

    if mode == Mode::Download {
        log::info!("Model ready at {}", resolved.dir.display());
        return Ok(());
    }

    let engine = Arc::new(EmbeddingEngine::load(&desc, &resolved, cfg)?);
    log::info!("Engine ready: {} ({}D)", engine.model_id(), engine.dimension());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(server::serve(cfg, engine))?;

    log::info!("=== Embedding service stopped ===");
    Ok(())
}
