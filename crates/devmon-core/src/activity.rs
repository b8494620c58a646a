use crate::patterns::{PatternCategory, PatternCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("unknown event source: {0}")]
    UnknownSource(String),
    #[error("unknown analysis depth: {0}")]
    UnknownDepth(String),
    #[error("unknown lesson category: {0}")]
    UnknownLessonCategory(String),
    #[error("unknown pattern code: {0}")]
    UnknownPattern(String),
    #[error("unknown pattern category: {0}")]
    UnknownPatternCategory(String),
    #[error("signal field {field} must be non-empty")]
    EmptySignalField { field: &'static str },
    #[error("signal timestamp must be positive, got {0}")]
    InvalidTimestamp(i64),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    Terminal,
    Conversation,
    VersionControl,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Conversation => "conversation",
            Self::VersionControl => "version-control",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "terminal" | "shell" => Ok(Self::Terminal),
            "conversation" | "assistant" => Ok(Self::Conversation),
            "version-control" | "version_control" | "vcs" | "git" => Ok(Self::VersionControl),
            other => Err(ContractError::UnknownSource(other.to_string())),
        }
    }
}

/// Requested context and output size for one analysis cycle.
///
/// Variants are ordered so that `max` picks the deepest request.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl Depth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Depth {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            other => Err(ContractError::UnknownDepth(other.to_string())),
        }
    }
}

/// Signal shape accepted from external watchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawSignal {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub timestamp: i64,
    pub content: String,
}

impl RawSignal {
    pub fn into_event(self) -> Result<NewEvent, ContractError> {
        let source = self.source.parse::<EventSource>()?;
        let event_type = self.event_type.trim().to_string();
        if event_type.is_empty() {
            return Err(ContractError::EmptySignalField { field: "type" });
        }
        if self.content.trim().is_empty() {
            return Err(ContractError::EmptySignalField { field: "content" });
        }
        if self.timestamp <= 0 {
            return Err(ContractError::InvalidTimestamp(self.timestamp));
        }

        Ok(NewEvent {
            event_type,
            source,
            content: self.content,
            timestamp: self.timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: String,
    pub source: EventSource,
    pub content: String,
    pub timestamp: i64,
}

impl NewEvent {
    pub fn new(
        source: EventSource,
        event_type: impl Into<String>,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source,
            content: content.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: i64,
    pub session_id: String,
    pub workspace_id: String,
    pub event_type: String,
    pub source: EventSource,
    pub content: String,
    pub timestamp: i64,
}

impl StoredEvent {
    pub fn is_commit(&self) -> bool {
        self.source == EventSource::VersionControl && self.event_type == "commit"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredObservation {
    pub id: i64,
    pub session_id: String,
    pub workspace_id: String,
    pub text: String,
    pub depth: Depth,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LessonCategory {
    Workflow,
    Debugging,
    Testing,
    Architecture,
    Tooling,
}

impl LessonCategory {
    pub const ALL: [LessonCategory; 5] = [
        Self::Workflow,
        Self::Debugging,
        Self::Testing,
        Self::Architecture,
        Self::Tooling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Debugging => "debugging",
            Self::Testing => "testing",
            Self::Architecture => "architecture",
            Self::Tooling => "tooling",
        }
    }
}

impl fmt::Display for LessonCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LessonCategory {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "workflow" => Ok(Self::Workflow),
            "debugging" => Ok(Self::Debugging),
            "testing" => Ok(Self::Testing),
            "architecture" => Ok(Self::Architecture),
            "tooling" => Ok(Self::Tooling),
            other => Err(ContractError::UnknownLessonCategory(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LessonDraft {
    pub category: LessonCategory,
    pub content: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredLesson {
    pub id: i64,
    pub category: LessonCategory,
    pub content: String,
    pub confidence: f64,
    pub source_workspace: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPatternOccurrence {
    pub code: PatternCode,
    pub confidence: f64,
    pub evidence: String,
    pub timestamp: i64,
}

impl NewPatternOccurrence {
    pub fn category(&self) -> PatternCategory {
        self.code.category()
    }
}
