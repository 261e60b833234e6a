//! Scan progress reporting.
//!
//! Reports observable progress while the engine walks an index so users see
//! how many pages and documents each phase has processed. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanProgressEvent {
    /// A page was processed; counts are cumulative for the phase.
    Scanning { phase: String, pages: u64, docs: u64 },
    /// The phase walked its last page.
    Done { phase: String, docs: u64 },
}

/// Reports scan progress. Implementations write to stderr (human or JSON).
pub trait ScanProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the scroll iterator.
    fn report(&self, event: ScanProgressEvent);
}

/// Human-friendly progress on stderr: "enrich  scanning  12 pages  12,000 docs".
pub struct StderrProgress;

impl ScanProgressReporter for StderrProgress {
    fn report(&self, event: ScanProgressEvent) {
        let line = match &event {
            ScanProgressEvent::Scanning { phase, pages, docs } => format!(
                "{}  scanning  {} pages  {} docs\n",
                phase,
                format_number(*pages),
                format_number(*docs)
            ),
            ScanProgressEvent::Done { phase, docs } => {
                format!("{}  done  {} docs\n", phase, format_number(*docs))
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ScanProgressReporter for JsonProgress {
    fn report(&self, event: ScanProgressEvent) {
        let obj = match &event {
            ScanProgressEvent::Scanning { phase, pages, docs } => serde_json::json!({
                "event": "progress",
                "phase": phase,
                "pages": pages,
                "docs": docs
            }),
            ScanProgressEvent::Done { phase, docs } => serde_json::json!({
                "event": "done",
                "phase": phase,
                "docs": docs
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ScanProgressReporter for NoProgress {
    fn report(&self, _event: ScanProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
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

    pub fn reporter(&self) -> std::sync::Arc<dyn ScanProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
