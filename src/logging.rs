use std::fmt;
use std::sync::Arc;

use log::{info, log_enabled, Level};

/// Initializes the logger with the `env_logger` crate.
///
/// Honours `RUST_LOG`; defaults to `info` when unset.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Logs an informational message.
pub fn log_info(message: &str) {
    if log_enabled!(Level::Info) {
        info!("{message}");
    }
}

/// Destination for per-device diagnostics.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, level: Level, label: &str, message: fmt::Arguments<'_>);
}

/// Forwards diagnostics to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&self, level: Level, label: &str, message: fmt::Arguments<'_>) {
        log::log!(target: "modmeter::device", level, "{label}: {message}");
    }
}

/// Diagnostic context handed to the polling engine and device handlers.
///
/// The label starts as `<transport>:<unit>` and becomes the device ident
/// once the meter has been identified.
#[derive(Clone)]
pub struct DiagContext {
    label: String,
    sink: Arc<dyn DiagnosticSink>,
}

impl DiagContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_sink(label, Arc::new(LogSink))
    }

    pub fn with_sink(label: impl Into<String>, sink: Arc<dyn DiagnosticSink>) -> Self {
        DiagContext {
            label: label.into(),
            sink,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn relabel(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        self.sink.emit(level, &self.label, message);
    }

    pub fn error(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Error, message);
    }

    pub fn warn(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Warn, message);
    }

    pub fn info(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Info, message);
    }

    pub fn debug(&self, message: fmt::Arguments<'_>) {
        self.log(Level::Debug, message);
    }
}

impl fmt::Debug for DiagContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagContext").field("label", &self.label).finish()
    }
}
