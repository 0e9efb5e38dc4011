//! Write-only output sinks for raw traffic and pretty-printed events.
//!
//! The engine never reads from a sink. Write failures are ignored so a broken
//! log can't affect the connection. Lines are prefixed with a local
//! `HH:MM:SS` timestamp.

use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Shared handle to any `Write` implementation.
#[derive(Clone)]
pub struct Sink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Sink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Append to a file, creating it and its parent directories. A leading
    /// `~` is expanded to the home directory.
    pub fn file(path: &str) -> io::Result<Self> {
        let path = expand_home(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self::new(file))
    }

    pub fn write_line(&self, line: &str) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        let mut writer = self.writer.lock();
        let _ = writeln!(writer, "[{}] {}", stamp, line);
        let _ = writer.flush();
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sink(..)")
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Direction of a raw line, for the debug sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Record one raw protocol line on the debug sink and in `tracing`.
pub(crate) fn log_traffic(sink: Option<&Sink>, direction: Direction, line: &str) {
    let arrow = match direction {
        Direction::Inbound => "<--",
        Direction::Outbound => "-->",
    };
    tracing::trace!(target: "crabirc::traffic", "{} {}", arrow, line);
    if let Some(sink) = sink {
        sink.write_line(&format!("{} {}", arrow, line));
    }
}
