use serde::Deserialize;
use tally_config::GenericConfiguration;
use tally_error::{generic_error, ErrorContext as _, GenericError};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_true() -> bool {
    true
}

/// Logging configuration.
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives for emitted events.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether to write events as JSON.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub log_format_json: bool,

    /// Whether to write events to standard output.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true")]
    pub log_to_console: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` instance from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }
}

/// A set of log filtering directives.
#[derive(Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(EnvFilter);

impl LogLevel {
    /// Returns the directives as an `EnvFilter`.
    pub fn as_env_filter(&self) -> EnvFilter {
        // `EnvFilter` isn't `Clone`, so rebuild it from its rendered directives.
        EnvFilter::builder().parse_lossy(self.0.to_string())
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}
