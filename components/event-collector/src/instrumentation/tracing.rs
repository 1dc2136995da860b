// Local crates
use crate::{
    helpers::load_config::{LogRotation, LoggingSettings},
    sink::sink::REMOTE_TARGET,
};

// External crates
use anyhow::{Context, Result};
use std::panic;
use tracing::{Level, error};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
    registry::Registry,
};

/// Install the global subscriber. The returned guard must outlive the run, or
/// buffered lines are lost.
pub fn init_tracing(settings: &LoggingSettings) -> Result<WorkerGuard> {
    let file_appender = match settings.rotation {
        LogRotation::Never => rolling::never(&settings.directory, &settings.file_name),
        LogRotation::Hourly => rolling::hourly(&settings.directory, &settings.file_name),
        LogRotation::Daily => rolling::daily(&settings.directory, &settings.file_name),
    };
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level)
            .with_context(|| format!("Invalid log level {:?}", settings.level))?,
    };

    let fmt_layer = (!settings.json).then(|| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking_writer.clone())
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    });

    let json_layer = settings.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(non_blocking_writer.clone())
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    });

    // Per-event lines already reach the console through the sink echo.
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(filter_fn(|meta| {
            *meta.level() <= Level::WARN && meta.target() != REMOTE_TARGET
        }));

    let error_layer = ErrorLayer::default();

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(json_layer)
        .with(stderr_layer)
        .with(error_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    Ok(guard)
}

pub fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => (*s).to_string(),
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => s.clone(),
                None => "Unknown panic".to_string(),
            },
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            message = %msg,
            location = %location,
            "Application panicked!"
        );
        eprintln!("ERROR: panic at {location}: {msg}");
    }));
}
