use crate::bounded::{BoundedCache, BoundedSeenSet};
use crate::{CaptureError, CaptureSink};
use devmon_core::{EventSource, NewEvent};
use notify::{EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RecordTime {
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub start: Option<i64>,
}

/// Per-message metadata written by the assistant client.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, rename = "sessionID")]
    pub session_id: Option<String>,
    #[serde(default, rename = "modelID")]
    pub model_id: Option<String>,
    #[serde(default, rename = "providerID")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub time: RecordTime,
}

/// One body fragment of a message, written independently of its envelope.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ContentRecord {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(default, rename = "sessionID")]
    pub session_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub time: RecordTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationRecord {
    Envelope(MessageEnvelope),
    Content(ContentRecord),
}

impl ConversationRecord {
    /// Classifies a backing file by shape: content records carry a
    /// `messageID`, envelopes carry a `role`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        let object = value.as_object()?;
        if object.contains_key("messageID") {
            return serde_json::from_value(value).ok().map(Self::Content);
        }
        if object.contains_key("role") {
            return serde_json::from_value(value).ok().map(Self::Envelope);
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub cache_capacity: usize,
    pub snapshot_window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: crate::bounded::DEFAULT_CAPACITY,
            snapshot_window: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub events: Vec<NewEvent>,
    pub envelopes: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub skipped_malformed: usize,
    pub skipped_stale: usize,
}

impl ReconcileReport {
    fn merge(&mut self, other: ReconcileReport) {
        self.events.extend(other.events);
        self.envelopes += other.envelopes;
        self.duplicates += other.duplicates;
        self.ignored += other.ignored;
        self.skipped_malformed += other.skipped_malformed;
        self.skipped_stale += other.skipped_stale;
    }
}

/// Joins envelope and content records into conversation events.
///
/// Content never waits for its envelope: when metadata has not arrived yet the
/// event is emitted with a generic type and no model prefix.
pub struct ConversationReconciler {
    config: ReconcilerConfig,
    envelopes: BoundedCache<String, MessageEnvelope>,
    seen_content: BoundedSeenSet<String>,
    stale_files: BoundedSeenSet<PathBuf>,
}

impl ConversationReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            envelopes: BoundedCache::new(config.cache_capacity),
            seen_content: BoundedSeenSet::new(config.cache_capacity),
            stale_files: BoundedSeenSet::new(config.cache_capacity),
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn is_stale(&self, path: &Path) -> bool {
        self.stale_files.contains(path)
    }

    /// Applies one record; returns the event a content record produced.
    pub fn apply(&mut self, record: ConversationRecord, now_ms: i64) -> Option<NewEvent> {
        match record {
            ConversationRecord::Envelope(envelope) => {
                self.envelopes.insert(envelope.id.clone(), envelope);
                None
            }
            ConversationRecord::Content(content) => self.join_content(content, now_ms),
        }
    }

    fn join_content(&mut self, content: ContentRecord, now_ms: i64) -> Option<NewEvent> {
        if content.kind != "text" {
            return None;
        }
        let text = content.text.as_deref().map(str::trim).unwrap_or_default();
        if text.is_empty() {
            return None;
        }
        if !self.seen_content.insert(content.id.clone()) {
            return None;
        }

        let envelope = self.envelopes.get(&content.message_id);
        let event_type = match envelope.map(|envelope| envelope.role.as_str()) {
            Some("user") => "user_message",
            Some("assistant") => "assistant_message",
            _ => "message",
        };
        let body = match envelope.and_then(|envelope| envelope.model_id.as_deref()) {
            Some(model) if !model.trim().is_empty() => format!("[{}] {text}", model.trim()),
            _ => text.to_string(),
        };
        // Arrival time: events must sort after any cursor an earlier cycle set.
        Some(NewEvent::new(
            EventSource::Conversation,
            event_type,
            body,
            now_ms,
        ))
    }

    /// Reads and applies one backing file. Files marked stale by the startup
    /// snapshot are never processed.
    pub fn ingest_file(&mut self, path: &Path, now_ms: i64) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if self.stale_files.contains(path) {
            report.skipped_stale += 1;
            return report;
        }

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(path = %path.display(), "conversation_read_failed: {err}");
                report.skipped_malformed += 1;
                return report;
            }
        };
        let Some(record) = ConversationRecord::parse(&bytes) else {
            report.skipped_malformed += 1;
            return report;
        };

        self.apply_counted(record, now_ms, &mut report);
        report
    }

    fn apply_counted(
        &mut self,
        record: ConversationRecord,
        now_ms: i64,
        report: &mut ReconcileReport,
    ) {
        match record {
            ConversationRecord::Envelope(envelope) => {
                report.envelopes += 1;
                self.apply(ConversationRecord::Envelope(envelope), now_ms);
            }
            ConversationRecord::Content(content) => {
                let already_seen = self.seen_content.contains(&content.id);
                match self.join_content(content, now_ms) {
                    Some(event) => report.events.push(event),
                    None if already_seen => report.duplicates += 1,
                    None => report.ignored += 1,
                }
            }
        }
    }

    /// One pass over the files already under `root`. Files modified within
    /// the snapshot window are processed envelopes first; older files are
    /// remembered as stale and ignored for the lifetime of the reconciler.
    pub fn snapshot(&mut self, root: &Path, now: SystemTime) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if !root.exists() {
            return report;
        }

        let now_ms = system_time_ms(now);
        let mut envelopes = Vec::new();
        let mut contents = Vec::new();

        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() || !is_json(entry.path()) {
                continue;
            }
            let path = entry.path().to_path_buf();
            let modified = entry
                .metadata()
                .ok()
                .and_then(|metadata| metadata.modified().ok())
                .unwrap_or(now);
            let age = now.duration_since(modified).unwrap_or_default();
            if age > self.config.snapshot_window {
                self.stale_files.insert(path);
                report.skipped_stale += 1;
                continue;
            }

            let Ok(bytes) = fs::read(&path) else {
                report.skipped_malformed += 1;
                continue;
            };
            match ConversationRecord::parse(&bytes) {
                Some(record @ ConversationRecord::Envelope(_)) => envelopes.push(record),
                Some(record @ ConversationRecord::Content(_)) => contents.push(record),
                None => report.skipped_malformed += 1,
            }
        }

        contents.sort_by_key(record_time);
        let mut joined = ReconcileReport::default();
        for record in envelopes.into_iter().chain(contents) {
            self.apply_counted(record, now_ms, &mut joined);
        }
        report.merge(joined);
        report
    }
}

fn record_time(record: &ConversationRecord) -> i64 {
    let time = match record {
        ConversationRecord::Envelope(envelope) => &envelope.time,
        ConversationRecord::Content(content) => &content.time,
    };
    time.start.or(time.created).unwrap_or(i64::MAX)
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("json")
}

pub(crate) fn system_time_ms(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Snapshot followed by a polling watch over `root` until shutdown.
pub async fn run_conversation_watch(
    root: PathBuf,
    poll_interval: Duration,
    mut reconciler: ConversationReconciler,
    sink: CaptureSink,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), CaptureError> {
    let snapshot = reconciler.snapshot(&root, SystemTime::now());
    info!(
        root = %root.display(),
        events = snapshot.events.len(),
        stale = snapshot.skipped_stale,
        "conversation snapshot complete"
    );
    for event in &snapshot.events {
        sink.record(event);
    }

    let (path_tx, mut path_rx) = mpsc::unbounded_channel::<PathBuf>();
    let config = notify::Config::default().with_poll_interval(poll_interval);
    let mut watcher = PollWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    for path in event.paths {
                        let _ = path_tx.send(path);
                    }
                }
            }
            Err(err) => warn!("conversation_watch_error: {err}"),
        },
        config,
    )?;

    if root.exists() {
        watcher.watch(&root, RecursiveMode::Recursive)?;
    } else {
        warn!(root = %root.display(), "conversation root missing, watch disabled");
        sink.bus().status(format!(
            "conversation storage {} not found; assistant capture disabled",
            root.display()
        ));
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(path) = path_rx.recv() => {
                if !is_json(&path) {
                    continue;
                }
                let report = reconciler.ingest_file(&path, devmon_core::now_ms());
                for event in &report.events {
                    sink.record(event);
                }
            }
        }
    }

    drop(watcher);
    Ok(())
}
