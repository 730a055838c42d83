// SPDX-License-Identifier: Apache-2.0

//! Best-effort debug sink.
//!
//! The planner appends prompt/response/repair traces here while debugging a
//! fleet. Writes are fire-and-forget: a sink failure must never influence a
//! query outcome, so every error is swallowed.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Local;
use parking_lot::Mutex;

/// Sink for free-form diagnostic lines.
pub trait DebugSink: Send + Sync {
    fn append(&self, entry: &str);
}

/// Default sink: drops everything.
#[derive(Debug, Default)]
pub struct NoopSink;

impl DebugSink for NoopSink {
    fn append(&self, _entry: &str) {}
}

/// Appends timestamped lines to a single file.
pub struct FileSink {
    file: Mutex<Option<File>>,
}

impl FileSink {
    /// Opening the file is itself best-effort; a sink that failed to open
    /// behaves like `NoopSink`.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok();
        Self { file: Mutex::new(file) }
    }
}

impl DebugSink for FileSink {
    fn append(&self, entry: &str) {
        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] {}", stamp, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_accepts_anything() {
        NoopSink.append("ignored");
    }

    #[test]
    fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.log");
        let sink = FileSink::open(&path);
        sink.append("first");
        sink.append("second");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("first"));
    }

    #[test]
    fn file_sink_with_bad_path_is_silent() {
        let sink = FileSink::open("/nonexistent-dir/never/debug.log");
        sink.append("goes nowhere");
    }
}
