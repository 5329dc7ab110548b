//! Status-line sinks.
//!
//! Reporters own the progress channel only. Log output goes through
//! `tracing` and never shares a line with a status update; when the status
//! line is on a terminal, logs are written via [`LineReporter::log_writer`].

use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Point-in-time view of the progress counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub cohort: String,
    pub cohort_completed: u64,
    pub cohort_total: u64,
    pub global_completed: u64,
    pub global_total: u64,
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{}, all: {}/{}",
            self.cohort,
            self.cohort_completed,
            self.cohort_total,
            self.global_completed,
            self.global_total
        )
    }
}

/// Receives progress updates from the aggregator.
pub trait Reporter: Send + Sync {
    fn update(&self, snapshot: &ProgressSnapshot);

    /// Called once after the last update of a cohort.
    fn finish(&self) {}
}

/// Discards all updates.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn update(&self, _snapshot: &ProgressSnapshot) {}
}

/// Terminal state shared by the status line and log records.
struct Console {
    out: Box<dyn Write + Send>,
    status: String,
    // A log record was written without its trailing newline
    mid_record: bool,
}

const CLEAR_LINE: &str = "\r\x1b[K";

/// Rewrites a single terminal line on stderr.
///
/// Log output must go through [`LineReporter::log_writer`] so a record never
/// lands on the status line: the status is cleared before each record and
/// redrawn after it.
pub struct LineReporter {
    console: Arc<Mutex<Console>>,
}

impl LineReporter {
    pub fn new() -> Self {
        Self::with_writer(std::io::stderr())
    }

    /// Status line drawn on `out` instead of stderr.
    pub fn with_writer<W: Write + Send + 'static>(out: W) -> Self {
        Self {
            console: Arc::new(Mutex::new(Console {
                out: Box::new(out),
                status: String::new(),
                mid_record: false,
            })),
        }
    }

    /// Writer for log records that shares the terminal with the status line.
    pub fn log_writer(&self) -> LogWriter {
        LogWriter {
            console: Arc::clone(&self.console),
        }
    }
}

impl Default for LineReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LineReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineReporter").finish_non_exhaustive()
    }
}

impl Reporter for LineReporter {
    fn update(&self, snapshot: &ProgressSnapshot) {
        let mut console = self.console.lock().unwrap_or_else(|e| e.into_inner());
        let line = snapshot.to_string();
        if !console.mid_record {
            let _ = write!(console.out, "{}{}", CLEAR_LINE, line);
            let _ = console.out.flush();
        }
        console.status = line;
    }

    fn finish(&self) {
        let mut console = self.console.lock().unwrap_or_else(|e| e.into_inner());
        if !console.status.is_empty() {
            if !console.mid_record {
                let _ = writeln!(console.out);
                let _ = console.out.flush();
            }
            console.status.clear();
        }
    }
}

/// Log sink paired with a [`LineReporter`].
#[derive(Clone)]
pub struct LogWriter {
    console: Arc<Mutex<Console>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut console = self.console.lock().unwrap_or_else(|e| e.into_inner());
        let showing_status = !console.status.is_empty();
        if showing_status && !console.mid_record {
            console.out.write_all(CLEAR_LINE.as_bytes())?;
        }
        console.out.write_all(buf)?;
        console.mid_record = !buf.ends_with(b"\n");
        if showing_status && !console.mid_record {
            let status = console.status.clone();
            console.out.write_all(status.as_bytes())?;
        }
        console.out.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut console = self.console.lock().unwrap_or_else(|e| e.into_inner());
        console.out.flush()
    }
}

/// Emits one JSON object per update on stderr, for machine consumers.
#[derive(Debug, Default)]
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn update(&self, snapshot: &ProgressSnapshot) {
        if let Ok(json) = serde_json::to_string(snapshot) {
            let _ = writeln!(std::io::stderr().lock(), "{}", json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_display() {
        let snapshot = ProgressSnapshot {
            cohort: "2t [32MiB, 64MiB)".into(),
            cohort_completed: 3,
            cohort_total: 10,
            global_completed: 45,
            global_total: 100,
        };
        assert_eq!(snapshot.to_string(), "2t [32MiB, 64MiB): 3/10, all: 45/100");
    }

    #[test]
    fn test_snapshot_json_fields() {
        let snapshot = ProgressSnapshot {
            cohort: "empty".into(),
            cohort_completed: 1,
            cohort_total: 2,
            global_completed: 3,
            global_total: 4,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["cohort"], "empty");
        assert_eq!(json["global_total"], 4);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// What a terminal shows for each finished line, honouring `\r` and `ESC[K`.
    fn rendered_lines(raw: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(raw).replace("\x1b[K", "\u{0}");
        let mut lines = Vec::new();
        let mut line: Vec<char> = Vec::new();
        let mut cursor = 0;
        for c in text.chars() {
            match c {
                '\n' => {
                    lines.push(line.iter().collect());
                    line.clear();
                    cursor = 0;
                }
                '\r' => cursor = 0,
                '\u{0}' => line.truncate(cursor),
                _ => {
                    if cursor < line.len() {
                        line[cursor] = c;
                    } else {
                        line.push(c);
                    }
                    cursor += 1;
                }
            }
        }
        if !line.is_empty() {
            lines.push(line.iter().collect());
        }
        lines
    }

    fn snapshot(done: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            cohort: "1t [0B, 32MiB)".into(),
            cohort_completed: done,
            cohort_total: 2,
            global_completed: done,
            global_total: 2,
        }
    }

    #[test]
    fn test_log_records_never_share_the_status_line() {
        let captured = Captured::default();
        let reporter = LineReporter::with_writer(captured.clone());
        let mut log = reporter.log_writer();

        reporter.update(&snapshot(0));
        log.write_all(b"ERROR Batch 1 failed (exit 1, 2 objects): boom\n").unwrap();
        reporter.update(&snapshot(1));
        // A record split over two writes is still one line
        log.write_all(b"WARN batch 2: ").unwrap();
        reporter.update(&snapshot(2));
        log.write_all(b"slow resource\n").unwrap();
        reporter.finish();

        let raw = captured.0.lock().unwrap().clone();
        let lines = rendered_lines(&raw);
        assert_eq!(
            lines,
            vec![
                "ERROR Batch 1 failed (exit 1, 2 objects): boom",
                "WARN batch 2: slow resource",
                "1t [0B, 32MiB): 2/2, all: 2/2",
            ]
        );
        for line in &lines {
            assert!(!(line.contains("all:") && line.contains("ERROR")));
        }
    }

    #[test]
    fn test_log_without_status_is_passed_through() {
        let captured = Captured::default();
        let reporter = LineReporter::with_writer(captured.clone());
        reporter.log_writer().write_all(b"INFO hello\n").unwrap();
        assert_eq!(captured.0.lock().unwrap().as_slice(), b"INFO hello\n");
    }
}
