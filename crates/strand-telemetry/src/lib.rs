mod logging;

pub use logging::{JsonlLogLayer, JsonlLogSink, LogQuery, LogRecord, LogSinkError};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "strand_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines on stdout instead of the human-readable format.
    pub json: bool,
    /// Where to persist warn+ logs, if anywhere.
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_file: None,
        }
    }
}

/// Handle returned by [`init_telemetry`]; keeps the persisted log sink reachable.
pub struct TelemetryGuard {
    log_sink: Option<Arc<JsonlLogSink>>,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
}

impl TelemetryGuard {
    /// Get the per-module log level overrides the filter was built from.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&JsonlLogSink> {
        self.log_sink.as_deref()
    }
}

pub(crate) fn filter_directive(level: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter = level.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Initialize the telemetry subsystem. Call once at startup; later calls leave
/// the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let module_levels = Arc::new(RwLock::new(config.module_levels.clone()));

    let filter = filter_directive(config.log_level, &config.module_levels);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let (file_layer, file_sink) = match &config.log_file {
        Some(path) => match JsonlLogSink::open(path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(JsonlLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("strand-telemetry: failed to open log file: {e}");
                (None, None)
            }
        },
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .try_init();

    TelemetryGuard {
        log_sink: file_sink,
        module_levels,
    }
}
