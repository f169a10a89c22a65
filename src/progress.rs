//! Sync progress reporting.
//!
//! Reports observable progress during `harvest sync` so users see which
//! source is being listed and how many guides are left. Progress is emitted
//! on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

/// A single progress event for sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Guide list is being fetched (or read from cache). Total unknown.
    Listing { source: String },
    /// `done` guides finished out of `total`, `failed` of them failed.
    Guides {
        source: String,
        done: u64,
        total: u64,
        failed: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the orchestrator.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync web:maxroll  guides  12 / 140 (1 failed)".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Listing { source } => {
                format!("sync {}  listing guides...\n", source)
            }
            SyncProgressEvent::Guides {
                source,
                done,
                total,
                failed,
            } => {
                let failed_note = if *failed > 0 {
                    format!(" ({} failed)", format_number(*failed))
                } else {
                    String::new()
                };
                format!(
                    "sync {}  guides  {} / {}{}\n",
                    source,
                    format_number(*done),
                    format_number(*total),
                    failed_note
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Listing { source } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "listing"
            }),
            SyncProgressEvent::Guides {
                source,
                done,
                total,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "guides",
                "done": done,
                "total": total,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. Caller can pass it to the orchestrator.
    pub fn reporter(&self) -> Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
