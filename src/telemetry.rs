use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE: &str = "signal-relay.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.level`. Keep the returned guard alive for
/// the life of the process or buffered file lines are lost.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info,signal_relay=debug,sqlx=warn"));

    let mut guard = None;
    let file_layer = config.dir.as_deref().and_then(|dir| {
        if !is_writable(dir) {
            eprintln!(
                "Warning: Could not write to log directory {}, file logging disabled",
                dir.display()
            );
            return None;
        }
        // rolling::daily panics if the first file cannot be created, hence the preflight
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let (json_layer, plain_layer) = if config.json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            ),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .with(file_layer)
        .try_init();

    if installed.is_ok() {
        if let Some(dir) = &config.dir {
            if guard.is_some() {
                eprintln!("Logging to: {}/{}", dir.display(), LOG_FILE);
            }
        }
    }
    guard
}

/// Minimal logging for one-shot CLI commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn is_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let marker = dir.join(".relay_write_test");
    let ok = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&marker)
        .is_ok();
    let _ = std::fs::remove_file(&marker);
    ok
}
