use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn file_appender(config: &AppConfig) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => rolling::daily(&config.log_dir, &config.log_file),
        _ => rolling::never(&config.log_dir, &config.log_file),
    }
}

/// Install the global subscriber. Keep the guard alive until shutdown.
///
/// `RUST_LOG` overrides `log_level`. JSON mode writes only to the rolling
/// file so log shippers see one record per line; text mode mirrors to stdout.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(file_appender(config));

    // sqlx logs every statement at info
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.log_level)));

    let json_layer = config.use_json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer.clone())
            .with_ansi(false)
    });
    let text_layers = (!config.use_json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(writer)
            .with_ansi(false)
            .and_then(fmt::layer().with_target(false).with_ansi(true))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layers)
        .init();

    guard
}
