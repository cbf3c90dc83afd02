use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::InterwikiConfig;

/// Target of every committed create or update.
pub const ACTION_TARGET: &str = "interwiki::action";
/// Target of every conflict description.
pub const CONFLICT_TARGET: &str = "interwiki::conflict";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    /// Directory for the daily-rolling files; stderr only when absent.
    pub log_dir: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_config(config: &InterwikiConfig, log_dir: Option<PathBuf>) -> Self {
        Self {
            level: config.log_level().to_string(),
            log_dir,
        }
    }
}

/// Keeps the non-blocking file writers flushing until dropped.
#[must_use]
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Installs the global subscriber: stderr driven by `RUST_LOG` (falling back to
/// the configured level) plus common, action and conflict files when a log
/// directory is set.
pub fn init_logging(settings: &LogSettings) -> Result<LogGuards> {
    let level = parse_log_level(&settings.level)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guards = Vec::new();

    if let Some(dir) = settings.log_dir.as_deref() {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let (common, guard) = tracing_appender::non_blocking(rolling::daily(dir, "interwiki.log"));
        guards.push(guard);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(common)
                .with_ansi(false)
                .with_target(true)
                .with_filter(Targets::new().with_default(LevelFilter::from_level(level)))
                .boxed(),
        );

        for (target, file_name) in [(ACTION_TARGET, "actions.log"), (CONFLICT_TARGET, "conflicts.log")] {
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, file_name));
            guards.push(guard);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(Targets::new().with_target(target, LevelFilter::TRACE))
                    .boxed(),
            );
        }
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(layers)
        .with(stderr_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    tracing::debug!(
        level = %settings.level,
        file_output = settings.log_dir.is_some(),
        "logging initialized"
    );
    Ok(LogGuards { _guards: guards })
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.trim().to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => bail!("invalid log level: {level}"),
    }
}
