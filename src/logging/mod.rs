//! Logging subsystem
//!
//! Structured logging via tracing with JSON (production) and plaintext
//! (development) output formats.
//!
//! # Log Targets
//!
//! Use these consistent target names across the codebase:
//! - `cloud` - registration, tokens, uploads
//! - `commands` - command lifecycle and upload queues
//! - `privet` - local API
//! - `pairing` - pairing sessions
//! - `security` - secrets and tokens
//!
//! # Environment Variables
//!
//! - `WEFT_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// Write to stdout
    #[default]
    Stdout,
    /// Write to stderr
    Stderr,
    /// Write to a file at the given path
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output format (JSON or plaintext)
    pub format: LogFormat,
    /// Output destination (stdout, stderr, or file)
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Create a development configuration (plaintext to stdout, debug level)
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    /// Create a production configuration (JSON to stdout, info level)
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

/// Build the env filter from `WEFT_LOG`, falling back to `RUST_LOG`, then
/// to the configured default level.
fn build_filter(default_level: Level) -> EnvFilter {
    if let Ok(filter) = std::env::var("WEFT_LOG") {
        if let Ok(parsed) = EnvFilter::try_new(&filter) {
            return parsed;
        }
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        if let Ok(parsed) = EnvFilter::try_new(&filter) {
            return parsed;
        }
    }
    EnvFilter::new(default_level.to_string().to_lowercase())
}

/// Initialize the global tracing subscriber. Subsequent calls are no-ops.
pub fn init_logging(config: LogConfig) -> io::Result<()> {
    if INIT_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = build_filter(config.default_level);

    let layer = match (&config.format, &config.output) {
        (LogFormat::Json, LogOutput::File(path)) => {
            let file = File::create(path)?;
            tracing_subscriber::fmt::layer()
                .json()
                .with_timer(UtcTime::rfc_3339())
                .with_writer(file)
                .boxed()
        }
        (LogFormat::Json, LogOutput::Stderr) => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_writer(io::stderr)
            .boxed(),
        (LogFormat::Json, LogOutput::Stdout) => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_writer(io::stdout)
            .boxed(),
        (LogFormat::Plaintext, LogOutput::File(path)) => {
            let file = File::create(path)?;
            tracing_subscriber::fmt::layer()
                .with_timer(UtcTime::rfc_3339())
                .with_writer(file)
                .boxed()
        }
        (LogFormat::Plaintext, LogOutput::Stderr) => tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_writer(io::stderr)
            .boxed(),
        (LogFormat::Plaintext, LogOutput::Stdout) => tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_writer(io::stdout)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let _ = INIT_GUARD.set(());
    Ok(())
}
