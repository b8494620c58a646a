//! Analysis side of the monitor: turns stored activity into observations,
//! escalates recurring behavior patterns and distills lessons.

pub mod analysis;
pub mod context;
pub mod lessons;
pub mod patterns;
pub mod provider;

pub use analysis::{
    select_depth, spawn_analysis_loop, AnalysisConfig, AnalysisEngine, AnalysisError,
    CycleReport, CycleTrigger,
};
pub use context::{build_context, ContextInput, ContextLimits, NO_VCS_PLACEHOLDER};
pub use lessons::{LessonExtractor, PendingLesson, LESSON_INCREMENT};
pub use patterns::{
    format_observation, parse_detection, DetectedPattern, EscalatedPattern, PatternAssessment,
    PatternConfig, PatternEngine,
};
pub use provider::{
    AnalysisProvider, AnthropicProvider, FallbackChain, ProviderConfig, ProviderError,
    ProviderFailureKind,
};
