//! Logging setup for hosts embedding the player
//!
//! One sink (console, JSON or file) behind one filter. The decoder, reader
//! and upload stages log per frame from their worker threads, so they get
//! their own level and every line carries the thread name
//! (`hap-decoder`, `hap-upload`). `log` records from the texture module are
//! bridged into the same subscriber by [`init_logging`].

use std::fs::File;
use std::io;
use std::path::PathBuf;

use tracing::Subscriber;
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{Layer, Registry};

/// Targets that log from the pipeline worker threads
pub const PIPELINE_TARGETS: [&str; 3] = [
    "hap_player::video::stream_reader",
    "hap_player::video::decoder",
    "hap_player::video::updater",
];

/// Where log lines go
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// Compact lines on stdout
    #[default]
    Console,
    /// One JSON object per line on stdout
    Json,
    /// Plain lines written to a file by a background writer
    File(PathBuf),
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for everything outside the pipeline workers
    pub default_level: String,
    /// Level for [`PIPELINE_TARGETS`]; `None` uses `default_level`
    pub pipeline_level: Option<String>,
    /// Full filter directives replacing the two levels above
    pub filter_override: Option<String>,
    pub output: LogOutput,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            pipeline_level: Some("warn".to_string()),
            filter_override: None,
            output: LogOutput::Console,
        }
    }
}

impl LogConfig {
    /// Defaults adjusted by the environment
    ///
    /// - `HAP_PLAYER_LOG` (or `RUST_LOG`): filter directives, e.g. `debug` or
    ///   `info,hap_player::video::decoder=trace`
    /// - `HAP_PLAYER_LOG_FORMAT=json`: JSON lines
    /// - `HAP_PLAYER_LOG_FILE`: write to this file instead of stdout
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.filter_override = std::env::var("HAP_PLAYER_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok();
        if let Ok(path) = std::env::var("HAP_PLAYER_LOG_FILE") {
            config.output = LogOutput::File(PathBuf::from(path));
        } else if std::env::var("HAP_PLAYER_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
            config.output = LogOutput::Json;
        }
        config
    }

    /// Filter directives this configuration resolves to
    pub fn filter_directives(&self) -> String {
        if let Some(directives) = &self.filter_override {
            return directives.clone();
        }
        let mut directives = self.default_level.clone();
        if let Some(level) = &self.pipeline_level {
            for target in PIPELINE_TARGETS {
                directives.push_str(&format!(",{}={}", target, level));
            }
        }
        directives
    }
}

/// Logging setup errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("a global subscriber is already installed: {0}")]
    Init(#[from] TryInitError),
}

/// Build the subscriber for `config`, writing to `writer`
///
/// The file path of [`LogOutput::File`] is ignored here; the caller supplies
/// the writer. Useful for scoping logs with `tracing::subscriber::with_default`.
pub fn subscriber<W>(
    config: &LogConfig,
    writer: W,
) -> Result<impl Subscriber + Send + Sync + 'static, LoggingError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_new(config.filter_directives())?;

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        LogOutput::Console => fmt::layer()
            .compact()
            .with_thread_names(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogOutput::Json => fmt::layer()
            .json()
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogOutput::File(_) => fmt::layer()
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    };

    Ok(tracing_subscriber::registry().with(layer))
}

/// Install the global subscriber
///
/// File output returns a guard that must stay alive for buffered lines to
/// be flushed.
///
/// ```no_run
/// use hap_player::telemetry::{init_logging, LogConfig};
///
/// let _guard = init_logging(&LogConfig::from_env()).expect("Failed to initialize logging");
/// ```
pub fn init_logging(config: &LogConfig) -> Result<Option<LogGuard>, LoggingError> {
    let guard = match &config.output {
        LogOutput::File(path) => {
            let (writer, guard) = tracing_appender::non_blocking(File::create(path)?);
            subscriber(config, writer)?.try_init()?;
            Some(guard)
        }
        LogOutput::Console | LogOutput::Json => {
            subscriber(config, io::stdout)?.try_init()?;
            None
        }
    };

    tracing::info!(
        target: "hap_player",
        version = env!("CARGO_PKG_VERSION"),
        filter = %config.filter_directives(),
        "Logging initialized"
    );

    Ok(guard)
}

/// [`init_logging`] with [`LogConfig::from_env`]
pub fn init_logging_default() -> Result<Option<LogGuard>, LoggingError> {
    init_logging(&LogConfig::from_env())
}

// Re-export WorkerGuard so callers can store it
pub use tracing_appender::non_blocking::WorkerGuard as LogGuard;
