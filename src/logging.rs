//! Logging configuration and initialization.

use tracing_subscriber::{fmt, EnvFilter};

/// Output format of log records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn new(verbose: bool, format: LogFormat) -> Self {
        Self {
            level: if verbose { "debug" } else { "info" }.into(),
            format,
        }
    }

    /// Installs the global subscriber. `RUST_LOG` takes precedence over `level`.
    ///
    /// Records go to stderr so stdout stays clean for command output.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.format {
            LogFormat::Json => {
                fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
            LogFormat::Pretty => {
                fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(false, LogFormat::Pretty)
    }
}
