use anyhow::Context;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming, WriteMode};

use crate::config::{self, ServiceConfig};

/// Start the global logger. The returned handle must be kept alive for the process lifetime
/// (dropping it flushes and stops file logging).
pub fn init_logging(cfg: &ServiceConfig) -> anyhow::Result<LoggerHandle> {
    let logger = Logger::try_with_str(&cfg.log_level)
        .with_context(|| format!("invalid log level spec: {}", cfg.log_level))?
        .format(flexi_logger::detailed_format);

    // stderr always; file only when a log dir is configured (containers collect stderr).
    let handle = match &cfg.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed creating log dir {}", dir.display()))?;
            logger
                .log_to_file(FileSpec::default().directory(dir).basename(config::logging::LOG_FILE_NAME))
                .rotate(
                    Criterion::Size(config::logging::LOG_ROTATE_SIZE_BYTES),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(config::logging::LOG_ROTATE_KEEP_FILES),
                )
                .duplicate_to_stderr(Duplicate::All)
                .write_mode(WriteMode::BufferAndFlush)
                .start()
        }
        None => logger.log_to_stderr().start(),
    }
    .context("failed to start logger")?;

    log::info!("{}", "=".repeat(60));
    log::info!("Embedding service starting");
    log::info!("Version: {}", config::SERVICE_VERSION);
    log::info!("Platform: {}", std::env::consts::OS);
    log::info!("{}", "=".repeat(60));

    Ok(handle)
}
