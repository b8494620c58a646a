use chrono::{Local, TimeZone};
use devmon_core::MonitorNotification;
use std::io::{self, Write};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// One notification as terminal text. `None` hides captures unless asked for.
pub fn render_line(notification: &MonitorNotification, show_captures: bool) -> Option<String> {
    match notification {
        MonitorNotification::Capture { event } => {
            if !show_captures {
                return None;
            }
            let time = Local
                .timestamp_millis_opt(event.timestamp)
                .single()
                .map(|ts| ts.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "--:--:--".to_string());
            let first_line = event.content.lines().next().unwrap_or_default();
            Some(format!(
                "  [{time}] {}/{} {first_line}",
                event.source, event.event_type
            ))
        }
        MonitorNotification::Observation { text, depth } => {
            Some(format!("\n── observation ({depth}) ──\n{}\n", text.trim_end()))
        }
        MonitorNotification::Status { message } => Some(format!("[devmon] {message}")),
        MonitorNotification::Error { message } => Some(format!("[devmon] error: {message}")),
    }
}

pub fn spawn_renderer(
    mut rx: broadcast::Receiver<MonitorNotification>,
    show_captures: bool,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = rx.recv() => match received {
                    Ok(notification) => {
                        if let Some(line) = render_line(&notification, show_captures) {
                            let mut stdout = io::stdout().lock();
                            let _ = writeln!(stdout, "{line}");
                            let _ = stdout.flush();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "renderer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
