use crate::context::{extract_json, format_event, ContextLimits};
use crate::provider::AnalysisProvider;
use devmon_core::{
    Depth, EscalationLevel, EscalationTracker, LessonDraft, NewPatternOccurrence, PatternCategory,
    PatternCode, StoredEvent, PATTERN_CATALOG,
};
use devmon_storage::MonitorStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternConfig {
    pub min_observation_chars: usize,
    pub context_events: usize,
    pub lesson_threshold: u32,
    pub lesson_confidence: f64,
    pub lesson_increment: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_observation_chars: 20,
            context_events: 20,
            lesson_threshold: 3,
            lesson_confidence: 0.5,
            lesson_increment: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPattern {
    pub code: PatternCode,
    pub confidence: f64,
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscalatedPattern {
    pub pattern: DetectedPattern,
    pub count: u32,
    pub level: EscalationLevel,
}

/// Formatted observation plus the escalations it announces. Nothing is
/// counted or persisted until [`PatternEngine::record`] runs.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternAssessment {
    pub text: String,
    pub escalated: Vec<EscalatedPattern>,
}

pub fn build_detection_prompt(observation: &str, events: &[StoredEvent]) -> String {
    let mut out = String::from(
        "Classify the developer behavior below against this fixed catalog. Only use these codes.\n\n",
    );
    for category in [PatternCategory::Behavioral, PatternCategory::Tactical] {
        out.push_str(&format!("{category}:\n"));
        for spec in PATTERN_CATALOG.iter().filter(|spec| spec.category == category) {
            out.push_str(&format!("- {}: {}\n", spec.code, spec.definition));
        }
    }

    out.push_str("\nRecent activity:\n");
    for event in events {
        out.push_str(&format_event(event, ContextLimits::default()));
        out.push('\n');
    }

    out.push_str("\nObservation:\n");
    out.push_str(observation.trim());
    out.push_str(
        "\n\nRespond with JSON only: {\"patterns\": [{\"code\": \"...\", \"category\": \
         \"behavioral|tactical\", \"confidence\": 0.0-1.0, \"evidence\": \"...\"}]}. \
         Use an empty list when nothing applies.\n",
    );
    out
}

fn parse_entry(entry: &Value) -> Option<DetectedPattern> {
    let object = entry.as_object()?;
    let code = object.get("code")?.as_str()?.parse::<PatternCode>().ok()?;
    let category = object
        .get("category")?
        .as_str()?
        .parse::<PatternCategory>()
        .ok()?;
    if category != code.category() {
        return None;
    }
    let confidence = object.get("confidence")?.as_f64()?;
    if !(0.0..=1.0).contains(&confidence) {
        return None;
    }
    let evidence = object
        .get("evidence")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    Some(DetectedPattern {
        code,
        confidence,
        evidence,
    })
}

/// Parses the detector reply. Invalid entries are dropped individually; a
/// code reported twice keeps its most confident entry.
pub fn parse_detection(response: &str) -> Vec<DetectedPattern> {
    let Some(value) = extract_json(response) else {
        debug!("pattern_response_unparseable");
        return Vec::new();
    };
    let entries = match &value {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(object) => match object.get("patterns") {
            Some(Value::Array(entries)) => entries.as_slice(),
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    let mut by_code: BTreeMap<PatternCode, DetectedPattern> = BTreeMap::new();
    for detected in entries.iter().filter_map(parse_entry) {
        match by_code.get(&detected.code) {
            Some(existing) if existing.confidence >= detected.confidence => {}
            _ => {
                by_code.insert(detected.code, detected);
            }
        }
    }
    by_code.into_values().collect()
}

/// Annotates observation text according to the highest escalation level
/// reached this cycle.
pub fn format_observation(text: &str, escalated: &[EscalatedPattern]) -> String {
    let Some(level) = escalated.iter().map(|entry| entry.level).max() else {
        return text.to_string();
    };

    let codes = escalated
        .iter()
        .map(|entry| {
            if level >= EscalationLevel::Label {
                format!("{} ×{}", entry.pattern.code, entry.count)
            } else {
                entry.pattern.code.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = format!("{} {codes}\n", level.icon());
    if level >= EscalationLevel::Confirm {
        for entry in escalated {
            let spec = entry.pattern.code.spec();
            out.push_str(&format!("  {}: {}\n", spec.code, spec.definition));
            if level >= EscalationLevel::Active {
                out.push_str(&format!("    try: {}\n", spec.correction));
            }
        }
    }
    out.push_str(text);
    out
}

/// Detects catalog patterns in observations and escalates repeat offenders.
pub struct PatternEngine {
    provider: Arc<dyn AnalysisProvider>,
    store: Arc<MonitorStore>,
    tracker: Mutex<EscalationTracker>,
    config: PatternConfig,
}

impl PatternEngine {
    pub fn new(
        provider: Arc<dyn AnalysisProvider>,
        store: Arc<MonitorStore>,
        config: PatternConfig,
    ) -> Self {
        Self {
            provider,
            store,
            tracker: Mutex::new(EscalationTracker::new()),
            config,
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Provider and parse failures yield no patterns.
    pub async fn detect(&self, observation: &str, events: &[StoredEvent]) -> Vec<DetectedPattern> {
        if observation.trim().chars().count() < self.config.min_observation_chars {
            return Vec::new();
        }

        let recent_start = events.len().saturating_sub(self.config.context_events);
        let prompt = build_detection_prompt(observation, &events[recent_start..]);
        match self.provider.analyze(&prompt, Depth::Quick).await {
            Ok(response) => parse_detection(&response),
            Err(err) => {
                warn!("pattern_detection_failed: {err}");
                Vec::new()
            }
        }
    }

    /// Levels the detections would reach if recorded now.
    pub fn escalate(&self, detected: Vec<DetectedPattern>) -> Vec<EscalatedPattern> {
        let tracker = match self.tracker.lock() {
            Ok(tracker) => tracker,
            Err(poisoned) => poisoned.into_inner(),
        };
        detected
            .into_iter()
            .map(|pattern| {
                let count = tracker.count(pattern.code).saturating_add(1);
                EscalatedPattern {
                    pattern,
                    count,
                    level: EscalationLevel::for_count(count),
                }
            })
            .collect()
    }

    /// Detection and formatting for one observation, without side effects.
    pub async fn assess(&self, observation: &str, events: &[StoredEvent]) -> PatternAssessment {
        let detected = self.detect(observation, events).await;
        let escalated = self.escalate(detected);
        PatternAssessment {
            text: format_observation(observation, &escalated),
            escalated,
        }
    }

    /// Counts each escalation, persists the occurrence and promotes repeat
    /// patterns to lessons. Call once the observation itself is stored.
    pub fn record(&self, escalated: &[EscalatedPattern], now_ms: i64) {
        for entry in escalated {
            let pattern = &entry.pattern;
            let (count, _) = match self.tracker.lock() {
                Ok(mut tracker) => tracker.record(pattern.code),
                Err(poisoned) => poisoned.into_inner().record(pattern.code),
            };
            if count != entry.count {
                debug!(code = %pattern.code, count, assessed = entry.count, "pattern count drifted");
            }

            if let Err(err) = self.store.append_pattern_occurrence(&NewPatternOccurrence {
                code: pattern.code,
                confidence: pattern.confidence,
                evidence: pattern.evidence.clone(),
                timestamp: now_ms,
            }) {
                warn!(code = %pattern.code, "pattern_occurrence_store_failed: {err}");
            }

            if count >= self.config.lesson_threshold {
                let spec = pattern.code.spec();
                let draft = LessonDraft {
                    category: spec.lesson_category,
                    content: spec.lesson.to_string(),
                    confidence: self.config.lesson_confidence,
                };
                if let Err(err) = self
                    .store
                    .upsert_lesson(&draft, self.config.lesson_increment)
                {
                    warn!(code = %pattern.code, "pattern_lesson_store_failed: {err}");
                }
            }
        }
    }

    /// Assess and record in one step.
    pub async fn process(&self, observation: &str, events: &[StoredEvent], now_ms: i64) -> String {
        let assessment = self.assess(observation, events).await;
        self.record(&assessment.escalated, now_ms);
        assessment.text
    }

    pub fn count(&self, code: PatternCode) -> u32 {
        match self.tracker.lock() {
            Ok(tracker) => tracker.count(code),
            Err(poisoned) => poisoned.into_inner().count(code),
        }
    }

    pub fn reset(&self) {
        match self.tracker.lock() {
            Ok(mut tracker) => tracker.reset(),
            Err(poisoned) => poisoned.into_inner().reset(),
        }
    }
}
