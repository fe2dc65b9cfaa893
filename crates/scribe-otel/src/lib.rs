use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Install the process-wide tracing subscriber.
///
/// Console output is filtered by `RUST_LOG` (default `info`). When
/// `SCRIBE_LOG_ROLL=1`, a second non-blocking layer writes plain-text logs to
/// `SCRIBE_LOG_DIR` (default `logs`) rotated per `SCRIBE_LOG_ROTATION`
/// (`daily`, `hourly`, `minutely`).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter);
}

/// Same as [`init`] but with an explicit default directive, used by the CLI
/// `--verbose` flag.
pub fn init_with_default(directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    install(filter);
}

fn install(filter: EnvFilter) {
    let console = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(console.with_filter(filter));
    if std::env::var("SCRIBE_LOG_ROLL").ok().as_deref() == Some("1") {
        let dir = std::env::var("SCRIBE_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let prefix = std::env::var("SCRIBE_LOG_PREFIX").unwrap_or_else(|_| "scribe".into());
        let rotation = std::env::var("SCRIBE_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
        if std::fs::create_dir_all(&dir).is_err() {
            tracing::warn!(directory = %dir, "failed to create log directory");
        }
        let writer = match rotation.to_lowercase().as_str() {
            "hourly" => tracing_appender::rolling::hourly(&dir, &prefix),
            "minutely" => tracing_appender::rolling::minutely(&dir, &prefix),
            _ => tracing_appender::rolling::daily(&dir, &prefix),
        };
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = FILE_GUARD.set(guard);
        let file_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(nb)
            .with_filter(file_filter);
        let _ = registry.with(file_layer).try_init();
    } else {
        let _ = registry.try_init();
    }
}
