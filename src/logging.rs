//! Logging initialization.
//!
//! All log output goes to stderr; stdout belongs to the MCP transport and
//! must stay clean. With `--log-file` the same records are mirrored into a
//! session log under `logs/` (next to the executable, overridable with
//! `KUSTOMUX_LOG_DIR`), prefixed with a one-line session banner.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Initialize the tracing subscriber from the resolved configuration.
///
/// Honors `RUST_LOG` directives on top of the `--log-level` default, the
/// same way the level would be tightened in development.
pub fn init(config: &Config) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(
        format!("kustomux={}", config.log_level)
            .parse()
            .context("invalid log level directive")?,
    );

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter).with(stderr_layer);

    if config.log_file {
        let file = open_session_log()?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        registry.init();
    }

    Ok(())
}

/// Resolve the log directory.
///
/// Priority: `KUSTOMUX_LOG_DIR` env var > `logs/` next to the executable >
/// `logs/` under the working directory.
pub fn log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KUSTOMUX_LOG_DIR") {
        return PathBuf::from(dir);
    }

    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Create the session log file and write the startup banner.
fn open_session_log() -> Result<std::fs::File> {
    let dir = log_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let path = dir.join(format!(
        "kustomux-{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file: {}", path.display()))?;

    writeln!(
        file,
        "=== kustomux v{} session started {} (pid {}) ===",
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().to_rfc3339(),
        std::process::id()
    )?;

    Ok(file)
}
