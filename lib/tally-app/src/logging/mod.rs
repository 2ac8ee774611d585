//! Logging.

use tally_error::GenericError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

mod layer;
use self::layer::build_formatting_layer;

/// Keeps the background log writers alive.
///
/// Must be held until the application is about to shut down, so that pending log lines are flushed before exit.
#[derive(Default)]
pub struct LoggingGuard {
    worker_guards: Vec<WorkerGuard>,
}

impl LoggingGuard {
    fn add_worker_guard(&mut self, guard: WorkerGuard) {
        self.worker_guards.push(guard);
    }
}

/// Initializes the logging subsystem for `tracing`.
///
/// Events are filtered by `log_level`, which accepts anything `EnvFilter` does (`info`, `tally_resources=debug`, and
/// so on). When `log_to_console` is set, events are written to standard output through a non-blocking writer, either
/// as JSON (`log_format_json`) or in a human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<LoggingGuard, GenericError> {
    let mut configured_layers = Vec::new();
    let mut logging_guard = LoggingGuard::default();

    if config.log_to_console {
        let (nb_stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
        logging_guard.add_worker_guard(guard);

        configured_layers.push(build_formatting_layer(config, nb_stdout));
    }

    // A `Vec` of layers acts as a fanout, so events are filtered once rather than once per output.
    tracing_subscriber::registry()
        .with(configured_layers.with_filter(config.log_level.as_env_filter()))
        .try_init()?;

    Ok(logging_guard)
}
