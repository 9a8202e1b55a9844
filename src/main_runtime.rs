use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,ploy_live=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Logging for the controlling program: console plus a daily rotating
/// `supervisor.log` under `log_dir` when it is writable.
pub fn init_logging(log_dir: &Path) {
    // Important: `tracing_appender::rolling::daily` panics (and in our release build,
    // aborts) if it can't create the initial log file. So we must preflight writability.
    let file_layer = if std::fs::create_dir_all(log_dir).is_ok() {
        let test_path = log_dir.join(".ploy_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(log_dir, "supervisor.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Keep the guard alive for the life of the process
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir.display(),
                    e
                );
                None
            }
        }
    } else {
        eprintln!(
            "Warning: Could not create log directory {}, file logging disabled",
            log_dir.display()
        );
        None
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// Logging for a strategy process: stdout/stderr already go to per-strategy
/// log files, so plain text without ANSI colors.
pub fn init_strategy_logging() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true),
        )
        .try_init();
}
