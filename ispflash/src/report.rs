//! Reporting boundary between the flashing core and its host.
//!
//! The core never prints or writes log files itself. It hands
//! `{severity, message}` events, progress ticks and cooperative yield points
//! to an [`EventSink`] supplied by the host. [`LogSink`] forwards everything to
//! the `log` facade; [`MemorySink`] keeps events for inspection.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Severity of a reported event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Severity {
    /// Progress and status information.
    Info,
    /// Something the user should do (e.g. reset the board).
    Hint,
    /// A recoverable problem, e.g. a chunk retry.
    Warning,
    /// A terminal failure.
    Error,
    /// Developer detail.
    Debug,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Hint => write!(f, "hint"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

/// One reported event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    /// Event severity.
    pub severity: Severity,
    /// Human-readable text.
    pub message: String,
}

/// Capability the host gives the core for reporting.
pub trait EventSink: Send + Sync {
    /// Receive one event.
    fn event(&self, event: Event);

    /// Chunk progress of the running bulk operation.
    fn progress(&self, _done: usize, _total: usize) {}

    /// Cooperative yield point, called between handshake probes so a hosting
    /// event loop can stay responsive.
    fn yield_now(&self) {}
}

/// Sink forwarding events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, event: Event) {
        match event.severity {
            Severity::Info | Severity::Hint => log::info!("{}", event.message),
            Severity::Warning => log::warn!("{}", event.message),
            Severity::Error => log::error!("{}", event.message),
            Severity::Debug => log::debug!("{}", event.message),
        }
    }
}

/// Sink that records every event and the last progress tick.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
    progress: Mutex<Vec<(usize, usize)>>,
    yields: Mutex<usize>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Messages with the given severity.
    pub fn messages(&self, severity: Severity) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.severity == severity)
            .map(|e| e.message)
            .collect()
    }

    /// Recorded progress ticks.
    pub fn progress_ticks(&self) -> Vec<(usize, usize)> {
        self.progress
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Number of yield points hit.
    pub fn yield_count(&self) -> usize {
        self.yields
            .lock()
            .map(|y| *y)
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn event(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn progress(&self, done: usize, total: usize) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.push((done, total));
        }
    }

    fn yield_now(&self) {
        if let Ok(mut yields) = self.yields.lock() {
            *yields += 1;
        }
    }
}

/// Cloneable handle the core uses to report through a sink.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn EventSink>,
}

impl Reporter {
    /// Wrap a sink.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Reporter that forwards to the `log` facade.
    pub fn log() -> Self {
        Self::new(Arc::new(LogSink))
    }

    fn emit(&self, severity: Severity, message: impl Into<String>) {
        self.sink.event(Event {
            severity,
            message: message.into(),
        });
    }

    /// Report information.
    pub fn info(&self, message: impl Into<String>) {
        self.emit(Severity::Info, message);
    }

    /// Report a hint for the user.
    pub fn hint(&self, message: impl Into<String>) {
        self.emit(Severity::Hint, message);
    }

    /// Report a warning.
    pub fn warning(&self, message: impl Into<String>) {
        self.emit(Severity::Warning, message);
    }

    /// Report an error.
    pub fn error(&self, message: impl Into<String>) {
        self.emit(Severity::Error, message);
    }

    /// Report developer detail.
    pub fn debug(&self, message: impl Into<String>) {
        self.emit(Severity::Debug, message);
    }

    /// Report chunk progress.
    pub fn progress(&self, done: usize, total: usize) {
        self.sink.progress(done, total);
    }

    /// Give the host a chance to run.
    pub fn yield_now(&self) {
        self.sink.yield_now();
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::log()
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter").finish_non_exhaustive()
    }
}
