use crate::activity::{ContractError, LessonCategory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Behavioral,
    Tactical,
}

impl PatternCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Behavioral => "behavioral",
            Self::Tactical => "tactical",
        }
    }
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternCategory {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "behavioral" | "behavioural" => Ok(Self::Behavioral),
            "tactical" => Ok(Self::Tactical),
            other => Err(ContractError::UnknownPatternCategory(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum PatternCode {
    ThrashLoop,
    ScopeCreep,
    ContextSwitching,
    RabbitHole,
    PrematureAbstraction,
    AssistantOverReliance,
    MissingTests,
    LargeUncommittedDiff,
    IgnoredError,
    DebugPrinting,
    SkippedVerification,
    CopyPasteFix,
}

/// One row of the fixed detection catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternSpec {
    pub code: PatternCode,
    pub category: PatternCategory,
    pub definition: &'static str,
    pub correction: &'static str,
    pub lesson_category: LessonCategory,
    pub lesson: &'static str,
}

pub static PATTERN_CATALOG: [PatternSpec; 12] = [
    PatternSpec {
        code: PatternCode::ThrashLoop,
        category: PatternCategory::Behavioral,
        definition: "Repeating the same failing action without changing the approach.",
        correction: "Stop and read the full error output before the next attempt.",
        lesson_category: LessonCategory::Debugging,
        lesson: "When an action fails twice the same way, change the approach instead of retrying it.",
    },
    PatternSpec {
        code: PatternCode::ScopeCreep,
        category: PatternCategory::Behavioral,
        definition: "Expanding the task beyond its original goal mid-flight.",
        correction: "Write the original goal down and park unrelated work as a follow-up.",
        lesson_category: LessonCategory::Workflow,
        lesson: "Keep a written goal for the current task and defer unrelated improvements.",
    },
    PatternSpec {
        code: PatternCode::ContextSwitching,
        category: PatternCategory::Behavioral,
        definition: "Hopping between unrelated files or tasks in quick succession.",
        correction: "Finish or checkpoint one thread of work before opening another.",
        lesson_category: LessonCategory::Workflow,
        lesson: "Checkpoint the current thread of work before switching to another one.",
    },
    PatternSpec {
        code: PatternCode::RabbitHole,
        category: PatternCategory::Behavioral,
        definition: "Deep-diving into a tangential problem that blocks the main goal.",
        correction: "Time-box the tangent and return to the main path when it expires.",
        lesson_category: LessonCategory::Workflow,
        lesson: "Time-box tangential investigations so they cannot stall the main goal.",
    },
    PatternSpec {
        code: PatternCode::PrematureAbstraction,
        category: PatternCategory::Behavioral,
        definition: "Generalizing code before a second concrete use exists.",
        correction: "Keep the first version concrete and abstract on the second real use.",
        lesson_category: LessonCategory::Architecture,
        lesson: "Wait for a second concrete use before introducing an abstraction.",
    },
    PatternSpec {
        code: PatternCode::AssistantOverReliance,
        category: PatternCategory::Behavioral,
        definition: "Accepting assistant output without reviewing or running it.",
        correction: "Read and run the generated change before accepting it.",
        lesson_category: LessonCategory::Tooling,
        lesson: "Review and execute assistant-generated changes before building on them.",
    },
    PatternSpec {
        code: PatternCode::MissingTests,
        category: PatternCategory::Tactical,
        definition: "Changing behavior without adding or running tests.",
        correction: "Add a focused test that exercises the changed behavior.",
        lesson_category: LessonCategory::Testing,
        lesson: "Pair every behavior change with a focused test.",
    },
    PatternSpec {
        code: PatternCode::LargeUncommittedDiff,
        category: PatternCategory::Tactical,
        definition: "Accumulating many uncommitted changes across files.",
        correction: "Commit a coherent slice of the work now.",
        lesson_category: LessonCategory::Workflow,
        lesson: "Commit small coherent slices instead of one large uncommitted diff.",
    },
    PatternSpec {
        code: PatternCode::IgnoredError,
        category: PatternCategory::Tactical,
        definition: "Moving past an error or warning without addressing it.",
        correction: "Resolve the error or record it explicitly before continuing.",
        lesson_category: LessonCategory::Debugging,
        lesson: "Address or explicitly record errors and warnings as soon as they appear.",
    },
    PatternSpec {
        code: PatternCode::DebugPrinting,
        category: PatternCategory::Tactical,
        definition: "Debugging by scattering print statements instead of targeted tools.",
        correction: "Reach for a debugger, a focused test or structured logging.",
        lesson_category: LessonCategory::Debugging,
        lesson: "Prefer a debugger or a focused failing test over scattered print statements.",
    },
    PatternSpec {
        code: PatternCode::SkippedVerification,
        category: PatternCategory::Tactical,
        definition: "Declaring work done without building or running it.",
        correction: "Run the build and the relevant tests before moving on.",
        lesson_category: LessonCategory::Testing,
        lesson: "Build and run the relevant tests before calling a change done.",
    },
    PatternSpec {
        code: PatternCode::CopyPasteFix,
        category: PatternCategory::Tactical,
        definition: "Duplicating code to fix the same problem in several places.",
        correction: "Extract the shared logic once and call it from each place.",
        lesson_category: LessonCategory::Architecture,
        lesson: "Fix duplicated logic once in a shared place instead of patching every copy.",
    },
];

impl PatternCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThrashLoop => "thrash-loop",
            Self::ScopeCreep => "scope-creep",
            Self::ContextSwitching => "context-switching",
            Self::RabbitHole => "rabbit-hole",
            Self::PrematureAbstraction => "premature-abstraction",
            Self::AssistantOverReliance => "assistant-over-reliance",
            Self::MissingTests => "missing-tests",
            Self::LargeUncommittedDiff => "large-uncommitted-diff",
            Self::IgnoredError => "ignored-error",
            Self::DebugPrinting => "debug-printing",
            Self::SkippedVerification => "skipped-verification",
            Self::CopyPasteFix => "copy-paste-fix",
        }
    }

    pub fn spec(self) -> &'static PatternSpec {
        PATTERN_CATALOG
            .iter()
            .find(|spec| spec.code == self)
            .unwrap_or(&PATTERN_CATALOG[0])
    }

    pub fn category(self) -> PatternCategory {
        self.spec().category
    }
}

impl fmt::Display for PatternCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternCode {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('_', "-");
        PATTERN_CATALOG
            .iter()
            .map(|spec| spec.code)
            .find(|code| code.as_str() == normalized)
            .ok_or(ContractError::UnknownPattern(normalized))
    }
}

/// Visibility tier for a detected pattern, derived from its session count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    Silent,
    Label,
    Confirm,
    Active,
}

impl EscalationLevel {
    pub fn for_count(count: u32) -> Self {
        match count {
            0 | 1 => Self::Silent,
            2 => Self::Label,
            3 => Self::Confirm,
            _ => Self::Active,
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::Silent => "·",
            Self::Label => "◆",
            Self::Confirm => "▲",
            Self::Active => "■",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Silent => "silent",
            Self::Label => "label",
            Self::Confirm => "confirm",
            Self::Active => "active",
        }
    }
}

/// Per-session occurrence counts. Lives in memory only.
#[derive(Debug, Default, Clone)]
pub struct EscalationTracker {
    counts: BTreeMap<PatternCode, u32>,
}

impl EscalationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, code: PatternCode) -> (u32, EscalationLevel) {
        let count = self.counts.entry(code).or_insert(0);
        *count = count.saturating_add(1);
        (*count, EscalationLevel::for_count(*count))
    }

    pub fn count(&self, code: PatternCode) -> u32 {
        self.counts.get(&code).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }
}
