pub mod activity;
pub mod notifications;
pub mod patterns;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

pub use activity::{
    ContractError, Depth, EventSource, LessonCategory, LessonDraft, NewEvent,
    NewPatternOccurrence, RawSignal, StoredEvent, StoredLesson, StoredObservation,
};
pub use notifications::{MonitorNotification, NotificationBus};
pub use patterns::{
    EscalationLevel, EscalationTracker, PatternCategory, PatternCode, PatternSpec,
    PATTERN_CATALOG,
};

/// Per-process identity handed to the store and the analysis engine.
///
/// The session id is fresh for every process start; the workspace id is the
/// resolved project root so unrelated projects sharing one database never mix
/// history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub workspace_id: String,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            workspace_id: workspace_id.into(),
        }
    }

    pub fn for_workspace(workspace_id: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), workspace_id)
    }
}

/// Resolves the workspace for `cwd`: the git toplevel when `cwd` is inside a
/// repository, the directory itself otherwise.
pub fn resolve_workspace(cwd: &Path) -> String {
    let toplevel = Command::new("git")
        .arg("-C")
        .arg(cwd)
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|stdout| stdout.trim().to_string())
        .filter(|root| !root.is_empty());

    toplevel.unwrap_or_else(|| {
        cwd.canonicalize()
            .unwrap_or_else(|_| cwd.to_path_buf())
            .to_string_lossy()
            .to_string()
    })
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }

    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let mut out = text
        .chars()
        .take(max_chars.saturating_sub(3))
        .collect::<String>();
    out.push_str("...");
    out
}
