//! User-facing log events
//!
//! The engine reports progress through an explicit [`LogSink`] that it is
//! handed at construction. Presentation code decides how to render events; the
//! library never registers global callbacks.
//!
//! Two channels exist:
//!
//! - [`LogSink::log`] carries persistent [`LogEvent`]s. Renderers show
//!   consecutive events of the same [`LogCategory`] as in-place updates of one
//!   line and start a new line when the category changes.
//! - [`LogSink::status`] carries ephemeral status text (throughput, current
//!   file) that is never persisted.
//!
//! Diagnostics for developers go through `tracing` as everywhere else in the
//! crate; [`TracingSink`] bridges user-facing events into it.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Grouping key for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    /// Lifecycle messages
    Info,
    /// Enumeration progress
    Scan,
    /// A file was hard-linked
    Link,
    /// A file was copied
    Copy,
    /// Degradations that do not fail the run
    Warning,
    /// Per-file or run failures
    Error,
    /// End-of-run summary
    Summary,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogCategory::Info => "INFO",
            LogCategory::Scan => "SCAN",
            LogCategory::Link => "LINK",
            LogCategory::Copy => "COPY",
            LogCategory::Warning => "WARN",
            LogCategory::Error => "ERROR",
            LogCategory::Summary => "SUMMARY",
        };
        f.write_str(name)
    }
}

/// One user-facing log message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Message text
    pub message: String,
    /// Rendering group
    pub category: LogCategory,
    /// Local wall-clock time of emission
    pub timestamp: DateTime<Local>,
}

impl LogEvent {
    /// Create an event stamped with the current time
    pub fn new(category: LogCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category,
            timestamp: Local::now(),
        }
    }

    /// Line written to persistent logs
    pub fn to_log_line(&self) -> String {
        format!(
            "{} [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.category,
            self.message
        )
    }
}

/// Destination for user-facing log events
pub trait LogSink: Send + Sync {
    /// Record a persistent event
    fn log(&self, event: LogEvent);

    /// Replace the ephemeral status text
    fn status(&self, _text: &str) {}
}

/// Convenience methods over any sink
pub trait LogSinkExt: LogSink {
    /// Log a message in `category`
    fn emit(&self, category: LogCategory, message: impl Into<String>) {
        self.log(LogEvent::new(category, message));
    }
}

impl<S: LogSink + ?Sized> LogSinkExt for S {}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _event: LogEvent) {}
}

/// Forwards events to `tracing` at a level matching their category
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, event: LogEvent) {
        match event.category {
            LogCategory::Warning => warn!(category = %event.category, "{}", event.message),
            LogCategory::Error => error!(category = %event.category, "{}", event.message),
            LogCategory::Link | LogCategory::Copy | LogCategory::Scan => {
                debug!(category = %event.category, "{}", event.message)
            }
            LogCategory::Info | LogCategory::Summary => {
                info!(category = %event.category, "{}", event.message)
            }
        }
    }
}

/// Message carried by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    /// Persistent event
    Event(LogEvent),
    /// Ephemeral status text
    Status(String),
}

/// Sends events over a channel to be drained by a presentation thread
#[derive(Debug)]
pub struct ChannelSink {
    sender: Mutex<Sender<SinkMessage>>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it
    pub fn new() -> (Self, Receiver<SinkMessage>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl LogSink for ChannelSink {
    fn log(&self, event: LogEvent) {
        // A dropped receiver only means nobody is rendering any more
        let _ = self.sender.lock().send(SinkMessage::Event(event));
    }

    fn status(&self, text: &str) {
        let _ = self.sender.lock().send(SinkMessage::Status(text.to_string()));
    }
}

/// Appends every persistent event to a line-oriented log file
#[derive(Debug)]
pub struct FileLogSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileLogSink {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl LogSink for FileLogSink {
    fn log(&self, event: LogEvent) {
        let mut writer = self.writer.lock();
        let result = writeln!(writer, "{}", event.to_log_line()).and_then(|_| writer.flush());
        if let Err(e) = result {
            warn!("Failed to append to log file: {}", e);
        }
    }
}

/// Duplicates events to several sinks
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn with(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl LogSink for FanoutSink {
    fn log(&self, event: LogEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.log(event.clone());
            }
            last.log(event);
        }
    }

    fn status(&self, text: &str) {
        for sink in &self.sinks {
            sink.status(text);
        }
    }
}

/// Collects events in memory; used by tests and embedders
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
    statuses: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    /// Messages of the recorded events in `category`
    pub fn messages(&self, category: LogCategory) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.category == category)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Number of status updates seen
    pub fn status_count(&self) -> usize {
        self.statuses.lock().len()
    }
}

impl LogSink for MemorySink {
    fn log(&self, event: LogEvent) {
        self.events.lock().push(event);
    }

    fn status(&self, text: &str) {
        self.statuses.lock().push(text.to_string());
    }
}
