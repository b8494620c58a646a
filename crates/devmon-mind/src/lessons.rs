use crate::context::extract_json;
use crate::provider::AnalysisProvider;
use devmon_core::{Depth, LessonCategory, LessonDraft, StoredLesson};
use devmon_storage::MonitorStore;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

pub const LESSON_INCREMENT: f64 = 0.1;

pub fn build_lesson_prompt(observation: &str) -> String {
    let categories = LessonCategory::ALL
        .iter()
        .map(|category| category.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Read this observation about a developer's session and extract at most one reusable, \
         general lesson.\n\nObservation:\n{}\n\nRespond with JSON only: {{\"lesson\": \"...\", \
         \"category\": one of [{categories}], \"confidence\": 0.0-1.0}}. \
         If there is no lesson, respond with {{\"lesson\": null}}.\n",
        observation.trim()
    )
}

/// `None` for "no lesson", unknown categories and anything unparseable.
pub fn parse_lesson(response: &str) -> Option<LessonDraft> {
    let trimmed = response.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NONE") {
        return None;
    }

    let value = extract_json(trimmed)?;
    let object = value.as_object()?;
    let content = object
        .get("lesson")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|lesson| !lesson.is_empty())?;
    let category = object
        .get("category")
        .and_then(Value::as_str)?
        .parse::<LessonCategory>()
        .ok()?;
    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    Some(LessonDraft {
        category,
        content: content.to_string(),
        confidence,
    })
}

/// Open-ended lesson distillation that runs beside the main pipeline.
#[derive(Clone)]
pub struct LessonExtractor {
    provider: Arc<dyn AnalysisProvider>,
    store: Arc<MonitorStore>,
}

impl LessonExtractor {
    pub fn new(provider: Arc<dyn AnalysisProvider>, store: Arc<MonitorStore>) -> Self {
        Self { provider, store }
    }

    /// Provider round trip only; nothing is written.
    pub async fn draft(&self, observation: &str) -> Option<LessonDraft> {
        let prompt = build_lesson_prompt(observation);
        let response = match self.provider.analyze(&prompt, Depth::Quick).await {
            Ok(response) => response,
            Err(err) => {
                debug!("lesson_extraction_failed: {err}");
                return None;
            }
        };

        let draft = parse_lesson(&response);
        if draft.is_none() {
            debug!("lesson_response_discarded");
        }
        draft
    }

    pub fn store(&self, draft: &LessonDraft) -> Option<StoredLesson> {
        match self.store.upsert_lesson(draft, LESSON_INCREMENT) {
            Ok(lesson) => Some(lesson),
            Err(err) => {
                debug!("lesson_store_failed: {err}");
                None
            }
        }
    }

    /// Every failure is swallowed; the result only matters to tests.
    pub async fn extract(&self, observation: &str) -> Option<StoredLesson> {
        let draft = self.draft(observation).await?;
        self.store(&draft)
    }

    /// Starts drafting in the background. The draft is stored only through
    /// [`PendingLesson::persist`].
    pub fn begin(&self, observation: String) -> PendingLesson {
        let extractor = self.clone();
        PendingLesson {
            task: tokio::spawn(async move { extractor.draft(&observation).await }),
            extractor: self.clone(),
        }
    }

    pub fn spawn(&self, observation: String) -> JoinHandle<Option<StoredLesson>> {
        self.begin(observation).persist()
    }
}

/// A lesson draft in flight for an observation that is not stored yet.
pub struct PendingLesson {
    task: JoinHandle<Option<LessonDraft>>,
    extractor: LessonExtractor,
}

impl PendingLesson {
    /// Drops the draft; used when the observation could not be stored.
    pub fn abandon(self) {
        self.task.abort();
    }

    pub fn persist(self) -> JoinHandle<Option<StoredLesson>> {
        tokio::spawn(async move {
            let draft = self.task.await.ok().flatten()?;
            self.extractor.store(&draft)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, ProviderFailureKind};
    use async_trait::async_trait;
    use devmon_core::SessionContext;

    struct Reply(Result<String, ProviderError>);

    #[async_trait]
    impl AnalysisProvider for Reply {
        fn name(&self) -> &str {
            "reply"
        }

        async fn analyze(&self, _payload: &str, _depth: Depth) -> Result<String, ProviderError> {
            self.0.clone()
        }
    }

    fn extractor(reply: Result<String, ProviderError>) -> (LessonExtractor, Arc<MonitorStore>) {
        let store = Arc::new(
            MonitorStore::open_in_memory(SessionContext::new("s1", "/repo")).expect("store"),
        );
        (
            LessonExtractor::new(Arc::new(Reply(reply)), Arc::clone(&store)),
            store,
        )
    }

    #[test]
    fn parse_accepts_valid_lessons_and_rejects_the_rest() {
        let draft = parse_lesson(
            r#"{"lesson": "Run clippy before pushing.", "category": "tooling", "confidence": 0.7}"#,
        )
        .expect("draft");
        assert_eq!(draft.category, LessonCategory::Tooling);
        assert!((draft.confidence - 0.7).abs() < 1e-9);

        assert!(parse_lesson(r#"{"lesson": null}"#).is_none());
        assert!(parse_lesson("NONE").is_none());
        assert!(parse_lesson(r#"{"lesson": "x", "category": "cooking"}"#).is_none());
        assert!(parse_lesson("garbage").is_none());
    }

    #[tokio::test]
    async fn repeated_lesson_accumulates_confidence() {
        let reply = r#"{"lesson": "Commit after each green run.", "category": "workflow", "confidence": 0.5}"#;
        let (extractor, store) = extractor(Ok(reply.to_string()));

        let first = extractor
            .spawn("observation one".to_string())
            .await
            .expect("join")
            .expect("lesson");
        assert!((first.confidence - 0.5).abs() < 1e-9);

        let second = extractor
            .extract("observation two")
            .await
            .expect("lesson");
        assert_eq!(second.id, first.id);
        assert!((second.confidence - 0.6).abs() < 1e-9);
        assert_eq!(store.recent_lessons(5).expect("lessons").len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_is_silent() {
        let (extractor, store) = extractor(Err(ProviderError::new(
            ProviderFailureKind::Transport,
            "offline",
        )));
        assert!(extractor.extract("observation").await.is_none());
        assert!(store.recent_lessons(5).expect("lessons").is_empty());
    }

    #[tokio::test]
    async fn abandoned_lesson_is_never_stored() {
        let reply = r#"{"lesson": "Commit after each green run.", "category": "workflow", "confidence": 0.5}"#;
        let (extractor, store) = extractor(Ok(reply.to_string()));

        extractor.begin("observation".to_string()).abandon();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(store.recent_lessons(5).expect("lessons").is_empty());

        let stored = extractor
            .begin("observation".to_string())
            .persist()
            .await
            .expect("join")
            .expect("lesson");
        assert_eq!(stored.content, "Commit after each green run.");
    }
}
