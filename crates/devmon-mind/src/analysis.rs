use crate::context::{build_context, normalize_response, ContextInput, ContextLimits};
use crate::lessons::LessonExtractor;
use crate::patterns::PatternEngine;
use crate::provider::{AnalysisProvider, ProviderError};
use devmon_core::{Depth, MonitorNotification, NotificationBus, StoredObservation};
use devmon_storage::{MonitorStore, StorageError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub warmup: Duration,
    pub interval: Duration,
    pub default_depth: Depth,
    pub deep_every_cycles: u64,
    pub deep_batch_threshold: usize,
    pub quick_batch_threshold: usize,
    pub session_observation_limit: usize,
    pub past_observation_limit: usize,
    pub lesson_limit: usize,
    pub limits: ContextLimits,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(15),
            interval: Duration::from_secs(120),
            default_depth: Depth::Standard,
            deep_every_cycles: 5,
            deep_batch_threshold: 15,
            quick_batch_threshold: 3,
            session_observation_limit: 5,
            past_observation_limit: 5,
            lesson_limit: 10,
            limits: ContextLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    Scheduled,
    Manual,
}

impl fmt::Display for CycleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub trigger: CycleTrigger,
    pub events: usize,
    pub depth: Option<Depth>,
    pub observation: Option<StoredObservation>,
    /// Cursor after the cycle; `None` when the tick was skipped.
    pub cursor: Option<i64>,
    /// A scheduled tick found another cycle in flight.
    pub skipped: bool,
}

/// Depth for one cycle: every `deep_every_cycles`-th cycle is deep, otherwise
/// batch size decides. The deeper of the two wins.
pub fn select_depth(cycle: u64, batch_len: usize, config: &AnalysisConfig) -> Depth {
    let by_size = if batch_len > config.deep_batch_threshold {
        Depth::Deep
    } else if batch_len < config.quick_batch_threshold {
        Depth::Quick
    } else {
        config.default_depth
    };

    if config.deep_every_cycles > 0 && cycle > 0 && cycle % config.deep_every_cycles == 0 {
        by_size.max(Depth::Deep)
    } else {
        by_size
    }
}

#[derive(Debug, Default)]
struct CycleState {
    cursor: i64,
    cycles: u64,
}

pub struct AnalysisEngine {
    store: Arc<MonitorStore>,
    provider: Arc<dyn AnalysisProvider>,
    patterns: Arc<PatternEngine>,
    lessons: LessonExtractor,
    bus: NotificationBus,
    config: AnalysisConfig,
    state: Mutex<CycleState>,
}

impl AnalysisEngine {
    pub fn new(
        store: Arc<MonitorStore>,
        provider: Arc<dyn AnalysisProvider>,
        patterns: Arc<PatternEngine>,
        bus: NotificationBus,
        config: AnalysisConfig,
    ) -> Self {
        let lessons = LessonExtractor::new(Arc::clone(&provider), Arc::clone(&store));
        Self {
            store,
            provider,
            patterns,
            lessons,
            bus,
            config,
            state: Mutex::new(CycleState::default()),
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub async fn cursor(&self) -> i64 {
        self.state.lock().await.cursor
    }

    /// Forces a cycle, waiting for any cycle already in flight.
    pub async fn analyze_now(&self) -> Result<CycleReport, AnalysisError> {
        let mut state = self.state.lock().await;
        self.run_reported(&mut state, CycleTrigger::Manual).await
    }

    /// Scheduled cycle; skipped when another cycle holds the guard.
    pub async fn scheduled_tick(&self) -> Result<CycleReport, AnalysisError> {
        let Ok(mut state) = self.state.try_lock() else {
            debug!("analysis tick skipped, cycle in flight");
            self.bus.status("analysis already running; tick skipped");
            return Ok(CycleReport {
                trigger: CycleTrigger::Scheduled,
                events: 0,
                depth: None,
                observation: None,
                cursor: None,
                skipped: true,
            });
        };
        self.run_reported(&mut state, CycleTrigger::Scheduled).await
    }

    async fn run_reported(
        &self,
        state: &mut CycleState,
        trigger: CycleTrigger,
    ) -> Result<CycleReport, AnalysisError> {
        match self.run_cycle(state, trigger).await {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(trigger = %trigger, "analysis_cycle_failed: {err}");
                self.bus.error(format!("analysis cycle failed: {err}"));
                Err(err)
            }
        }
    }

    async fn run_cycle(
        &self,
        state: &mut CycleState,
        trigger: CycleTrigger,
    ) -> Result<CycleReport, AnalysisError> {
        let since = if state.cursor == 0 { 0 } else { state.cursor + 1 };
        let events = self.store.events_since(since)?;
        if events.is_empty() {
            return Ok(CycleReport {
                trigger,
                events: 0,
                depth: None,
                observation: None,
                cursor: Some(state.cursor),
                skipped: false,
            });
        }

        let cycle = state.cycles + 1;
        let depth = select_depth(cycle, events.len(), &self.config);
        let batch_max = events
            .iter()
            .map(|event| event.timestamp)
            .max()
            .unwrap_or(state.cursor);

        let session_id = self.store.context().session_id.clone();
        let session_observations = self
            .store
            .session_observations(self.config.session_observation_limit)?;
        let past_observations = self
            .store
            .past_observations(&session_id, self.config.past_observation_limit)?;
        let lessons = self.store.recent_lessons(self.config.lesson_limit)?;

        let payload = build_context(&ContextInput {
            events: &events,
            session_observations: &session_observations,
            past_observations: &past_observations,
            lessons: &lessons,
            depth,
            limits: self.config.limits,
        });

        info!(
            trigger = %trigger,
            events = events.len(),
            depth = %depth,
            provider = self.provider.name(),
            "analysis cycle"
        );
        let response = self.provider.analyze(&payload, depth).await?;
        state.cycles = cycle;

        let Some(text) = normalize_response(&response) else {
            state.cursor = batch_max.max(state.cursor);
            return Ok(CycleReport {
                trigger,
                events: events.len(),
                depth: Some(depth),
                observation: None,
                cursor: Some(state.cursor),
                skipped: false,
            });
        };

        // Pattern and lesson side effects follow a stored observation.
        let lesson = self.lessons.begin(text.clone());
        let assessment = self.patterns.assess(&text, &events).await;
        let now = devmon_core::now_ms();
        let observation = match self.store.append_observation(&assessment.text, depth, now) {
            Ok(observation) => observation,
            Err(err) => {
                lesson.abandon();
                return Err(err.into());
            }
        };
        self.patterns.record(&assessment.escalated, now);
        let _ = lesson.persist();
        state.cursor = batch_max.max(state.cursor);

        self.bus.publish(MonitorNotification::Observation {
            text: observation.text.clone(),
            depth,
        });

        Ok(CycleReport {
            trigger,
            events: events.len(),
            depth: Some(depth),
            observation: Some(observation),
            cursor: Some(state.cursor),
            skipped: false,
        })
    }
}

/// Warm-up, then one scheduled tick per interval until shutdown. Errors are
/// already reported by the engine; the loop keeps ticking.
pub fn spawn_analysis_loop(
    engine: Arc<AnalysisEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = engine.config().clone();
        let start = Instant::now() + config.warmup;
        let mut ticker = tokio::time::interval_at(start, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let engine = Arc::clone(&engine);
                    // Overlapping ticks are skipped by the single-flight guard.
                    tokio::spawn(async move {
                        let _ = engine.scheduled_tick().await;
                    });
                }
            }
        }
        debug!("analysis loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_follows_batch_size() {
        let config = AnalysisConfig::default();
        assert_eq!(select_depth(1, 2, &config), Depth::Quick);
        assert_eq!(select_depth(1, 3, &config), Depth::Standard);
        assert_eq!(select_depth(1, 15, &config), Depth::Standard);
        assert_eq!(select_depth(1, 16, &config), Depth::Deep);
    }

    #[test]
    fn every_fifth_cycle_is_deep() {
        let config = AnalysisConfig::default();
        assert_eq!(select_depth(5, 1, &config), Depth::Deep);
        assert_eq!(select_depth(10, 5, &config), Depth::Deep);
        assert_eq!(select_depth(4, 1, &config), Depth::Quick);
    }

    #[test]
    fn configured_default_applies_to_mid_sized_batches() {
        let config = AnalysisConfig {
            default_depth: Depth::Quick,
            ..AnalysisConfig::default()
        };
        assert_eq!(select_depth(1, 8, &config), Depth::Quick);
    }
}
