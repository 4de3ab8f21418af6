use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the background log writer alive. Records are flushed when the
/// guard drops; call `drain` before handing the terminal back.
pub struct TelemetryGuard {
    file_guard: Option<WorkerGuard>,
}

impl TelemetryGuard {
    pub fn drain(&mut self) {
        self.file_guard.take();
    }
}

/// Compact stdout layer plus a non-blocking append-only file sink, so the
/// hot path never waits on file I/O. Filter from `RUST_LOG`, default info.
pub fn init(service_name: &str, log_file: Option<&str>) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer().compact().with_target(false);

    let mut file_guard = None;
    let file_layer = log_file.and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                file_guard = Some(guard);
                Some(fmt::layer().with_writer(writer).with_ansi(false))
            }
            Err(error) => {
                eprintln!("could not open log file {path}: {error}");
                None
            }
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    tracing::info!(service = service_name, "telemetry initialized");
    TelemetryGuard { file_guard }
}
