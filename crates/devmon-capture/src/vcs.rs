use crate::CaptureSink;
use devmon_core::{EventSource, NewEvent};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Turns successive `git status` / `git log -1` readings into change events.
/// The first reading only establishes the baseline.
#[derive(Debug, Clone)]
pub struct VcsPoller {
    root: PathBuf,
    baseline_taken: bool,
    last_status: BTreeSet<String>,
    last_head: Option<String>,
}

impl VcsPoller {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            baseline_taken: false,
            last_status: BTreeSet::new(),
            last_head: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn poll(&mut self, now_ms: i64) -> Result<Vec<NewEvent>, String> {
        let status = run_git(&self.root, &["status", "--porcelain=v1", "-u"]).await?;
        // An unborn branch has no HEAD yet; that is not an error.
        let head = run_git(&self.root, &["log", "-1", "--format=%h %s"])
            .await
            .ok()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty());
        Ok(self.observe(&status, head, now_ms))
    }

    pub fn observe(&mut self, status: &str, head: Option<String>, now_ms: i64) -> Vec<NewEvent> {
        let entries = status
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();

        if !self.baseline_taken {
            self.baseline_taken = true;
            self.last_status = entries;
            self.last_head = head;
            return Vec::new();
        }

        let mut events = Vec::new();
        if head.is_some() && head != self.last_head {
            if let Some(commit) = head.as_deref() {
                events.push(NewEvent::new(
                    EventSource::VersionControl,
                    "commit",
                    commit,
                    now_ms,
                ));
            }
        }
        if entries != self.last_status && !entries.is_empty() {
            let content = entries.iter().cloned().collect::<Vec<_>>().join("\n");
            events.push(NewEvent::new(
                EventSource::VersionControl,
                "file_change",
                content,
                now_ms,
            ));
        }

        self.last_status = entries;
        self.last_head = head;
        events
    }
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|err| err.to_string())?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(stderr);
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub async fn run_vcs_poll(
    mut poller: VcsPoller,
    poll_interval: Duration,
    sink: CaptureSink,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut reported_failure = false;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match poller.poll(devmon_core::now_ms()).await {
                    Ok(events) => {
                        reported_failure = false;
                        for event in &events {
                            sink.record(event);
                        }
                    }
                    Err(err) => {
                        debug!(root = %poller.root().display(), "vcs_poll_failed: {err}");
                        if !reported_failure {
                            warn!("vcs_poll_failed: {err}");
                            sink.bus().error(format!("version-control poll failed: {err}"));
                            reported_failure = true;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_baseline_only() {
        let mut poller = VcsPoller::new("/repo");
        let events = poller.observe(" M src/lib.rs\n", Some("abc123 init".to_string()), 1);
        assert!(events.is_empty());
    }

    #[test]
    fn status_change_and_new_head_emit_events() {
        let mut poller = VcsPoller::new("/repo");
        poller.observe("", Some("abc123 init".to_string()), 1);

        let changed = poller.observe(
            " M src/lib.rs\n?? notes.md\n",
            Some("abc123 init".to_string()),
            2,
        );
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].event_type, "file_change");
        assert_eq!(changed[0].content, " M src/lib.rs\n?? notes.md");

        let unchanged = poller.observe(
            " M src/lib.rs\n?? notes.md\n",
            Some("abc123 init".to_string()),
            3,
        );
        assert!(unchanged.is_empty());

        let committed = poller.observe("", Some("def456 add parser".to_string()), 4);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].event_type, "commit");
        assert_eq!(committed[0].content, "def456 add parser");
        assert_eq!(committed[0].source, EventSource::VersionControl);
    }

    #[tokio::test]
    async fn poll_outside_repository_never_emits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut poller = VcsPoller::new(dir.path());
        let events = poller.poll(1).await.unwrap_or_default();
        assert!(events.is_empty());
    }
}
