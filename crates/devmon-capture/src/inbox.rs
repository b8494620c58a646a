use crate::{CaptureError, CaptureSink};
use devmon_core::{NewEvent, RawSignal};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InboxReport {
    pub events: Vec<NewEvent>,
    pub skipped_corrupt_lines: usize,
    pub skipped_invalid_signals: usize,
    pub skipped_outside_window: usize,
    pub deferred_partial_line: bool,
    pub reset_due_to_truncation: bool,
    pub cursor: u64,
}

/// Append-only JSON-lines file that external watchers (shell hooks, editor
/// plugins) write `{type, source, timestamp, content}` signals into.
#[derive(Debug, Clone)]
pub struct SignalInbox {
    path: PathBuf,
    cursor: u64,
}

impl SignalInbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cursor: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Startup pass: emits only signals newer than `now_ms - window` and
    /// leaves the cursor at the end of the last complete line.
    pub fn prime(&mut self, window: Duration, now_ms: i64) -> Result<InboxReport, CaptureError> {
        let since = now_ms.saturating_sub(window.as_millis() as i64);
        self.cursor = 0;
        self.read_from_cursor(Some(since))
    }

    /// Emits every complete line appended since the previous call.
    pub fn poll(&mut self) -> Result<InboxReport, CaptureError> {
        self.read_from_cursor(None)
    }

    fn read_from_cursor(&mut self, since: Option<i64>) -> Result<InboxReport, CaptureError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let reset = self.cursor > 0;
                self.cursor = 0;
                return Ok(InboxReport {
                    reset_due_to_truncation: reset,
                    ..InboxReport::default()
                });
            }
            Err(err) => return Err(err.into()),
        };

        let mut report = InboxReport::default();
        let mut start_cursor = self.cursor;
        if start_cursor as usize > bytes.len() {
            start_cursor = 0;
            report.reset_due_to_truncation = true;
        }

        let pending = &bytes[start_cursor as usize..];
        let mut consumed: usize = 0;

        while consumed < pending.len() {
            let remaining = &pending[consumed..];
            let Some(newline_index) = remaining.iter().position(|byte| *byte == b'\n') else {
                report.deferred_partial_line = !remaining.is_empty();
                break;
            };

            let line = &remaining[..newline_index];
            consumed += newline_index + 1;

            if line.iter().all(|byte| byte.is_ascii_whitespace()) {
                continue;
            }

            let signal: RawSignal = match serde_json::from_slice(line) {
                Ok(signal) => signal,
                Err(err) => {
                    debug!("inbox_line_corrupt: {err}");
                    report.skipped_corrupt_lines += 1;
                    continue;
                }
            };

            let event = match signal.into_event() {
                Ok(event) => event,
                Err(err) => {
                    debug!("inbox_signal_invalid: {err}");
                    report.skipped_invalid_signals += 1;
                    continue;
                }
            };

            if since.is_some_and(|since| event.timestamp < since) {
                report.skipped_outside_window += 1;
                continue;
            }
            report.events.push(event);
        }

        self.cursor = start_cursor + consumed as u64;
        report.cursor = self.cursor;
        Ok(report)
    }
}

pub async fn run_inbox_watch(
    mut inbox: SignalInbox,
    window: Duration,
    poll_interval: Duration,
    sink: CaptureSink,
    mut shutdown: watch::Receiver<bool>,
) {
    match inbox.prime(window, devmon_core::now_ms()) {
        Ok(report) => {
            info!(
                path = %inbox.path().display(),
                events = report.events.len(),
                "signal inbox primed"
            );
            for event in &report.events {
                sink.record(event);
            }
        }
        Err(err) => {
            warn!("inbox_prime_failed: {err}");
            sink.bus().error(format!("signal inbox unreadable: {err}"));
        }
    }

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match inbox.poll() {
                    Ok(report) => {
                        if report.reset_due_to_truncation {
                            debug!(path = %inbox.path().display(), "signal inbox truncated, cursor reset");
                        }
                        for event in &report.events {
                            sink.record(event);
                        }
                    }
                    Err(err) => {
                        warn!("inbox_poll_failed: {err}");
                        sink.bus().error(format!("signal inbox poll failed: {err}"));
                    }
                }
            }
        }
    }
}
