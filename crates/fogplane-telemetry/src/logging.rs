//! Structured logging with JSON output.
//!
//! Structured JSON to stdout in production, pretty output for development.

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the logging subsystem.
///
/// Sets up tracing-subscriber with either JSON or pretty format,
/// respecting the configured log level.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    // RUST_LOG wins over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => init_json_logging(filter),
        LogFormat::Pretty => init_pretty_logging(filter),
    }
}

/// Initialize JSON logging for production.
fn init_json_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false)
        .flatten_event(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Initialize pretty logging for development.
fn init_pretty_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let pretty_layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(pretty_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Stable log event names.
pub mod events {
    /// Control plane is starting up.
    pub const STARTUP: &str = "startup";

    /// Control plane is listening on a socket.
    pub const LISTENING: &str = "listening";

    /// Database migrations were applied.
    pub const MIGRATED: &str = "migrated";

    /// A microservice was created.
    pub const MICROSERVICE_CREATED: &str = "microservice_created";

    /// A microservice was updated.
    pub const MICROSERVICE_UPDATED: &str = "microservice_updated";

    /// A microservice was deleted or marked for deletion.
    pub const MICROSERVICE_DELETED: &str = "microservice_deleted";

    /// A microservice moved to another agent.
    pub const MICROSERVICE_MOVED: &str = "microservice_moved";

    /// An agent change record was advanced.
    pub const CHANGE_TRACKED: &str = "change_tracked";

    /// A tag fan-out target could not be updated.
    pub const FAN_OUT_FAILED: &str = "fan_out_failed";

    /// A dependent host binding could not be re-resolved.
    pub const BINDING_REFRESH_FAILED: &str = "binding_refresh_failed";

    /// An audit event could not be written.
    pub const AUDIT_WRITE_FAILED: &str = "audit_write_failed";
}

/// Log a startup event with the standard event field.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}
