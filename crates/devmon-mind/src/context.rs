use chrono::{TimeZone, Utc};
use devmon_core::{truncate_chars, Depth, EventSource, StoredEvent, StoredLesson, StoredObservation};
use serde_json::Value;

pub const NO_VCS_PLACEHOLDER: &str = "No version-control activity in this window.";

const HIGH_CONFIDENCE: f64 = 0.8;
const MEDIUM_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub body_chars: usize,
    pub diff_paths: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            body_chars: 280,
            diff_paths: 3,
        }
    }
}

/// Everything one analysis payload is assembled from.
#[derive(Debug, Clone, Copy)]
pub struct ContextInput<'a> {
    pub events: &'a [StoredEvent],
    pub session_observations: &'a [StoredObservation],
    pub past_observations: &'a [StoredObservation],
    pub lessons: &'a [StoredLesson],
    pub depth: Depth,
    pub limits: ContextLimits,
}

fn clock(timestamp: i64) -> String {
    Utc.timestamp_millis_opt(timestamp)
        .single()
        .map(|time| time.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

fn speaker(event_type: &str) -> &'static str {
    match event_type {
        "user_message" => "user",
        "assistant_message" => "assistant",
        _ => "message",
    }
}

/// Summarizes porcelain entries as a path list capped at `limit`.
pub fn summarize_diff(content: &str, limit: usize) -> String {
    let paths = content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            if line.len() > 3 && line.is_char_boundary(3) {
                line[3..].trim()
            } else {
                line.trim()
            }
        })
        .collect::<Vec<_>>();

    let shown = paths.iter().take(limit).copied().collect::<Vec<_>>().join(", ");
    if paths.len() > limit {
        format!("{shown} (+{} more)", paths.len() - limit)
    } else {
        shown
    }
}

pub fn format_event(event: &StoredEvent, limits: ContextLimits) -> String {
    let body = match event.source {
        EventSource::Terminal => format!("$ {}", event.content.trim()),
        EventSource::Conversation => format!(
            "{}: {}",
            speaker(&event.event_type),
            truncate_chars(&devmon_core::normalize_text(&event.content), limits.body_chars)
        ),
        EventSource::VersionControl if event.is_commit() => {
            format!("commit {}", event.content.trim())
        }
        EventSource::VersionControl => {
            format!("changed {}", summarize_diff(&event.content, limits.diff_paths))
        }
    };
    format!("[{}] {body}", clock(event.timestamp))
}

pub fn progression_section(events: &[StoredEvent]) -> Vec<String> {
    let vcs = events
        .iter()
        .filter(|event| event.source == EventSource::VersionControl)
        .collect::<Vec<_>>();
    if vcs.is_empty() {
        return vec![NO_VCS_PLACEHOLDER.to_string()];
    }

    let commits = vcs
        .iter()
        .filter(|event| event.is_commit())
        .map(|event| format!("[{}] {}", clock(event.timestamp), event.content.trim()))
        .collect::<Vec<_>>();
    if commits.is_empty() {
        return vec![format!(
            "No commits yet; {} uncommitted change set(s) in progress.",
            vcs.len()
        )];
    }
    commits
}

fn confidence_bucket(confidence: f64) -> usize {
    if confidence >= HIGH_CONFIDENCE {
        0
    } else if confidence >= MEDIUM_CONFIDENCE {
        1
    } else {
        2
    }
}

fn lesson_line(lesson: &StoredLesson) -> String {
    format!(
        "- [{}] {} ({:.2})",
        lesson.category, lesson.content, lesson.confidence
    )
}

fn instruction(depth: Depth) -> &'static str {
    match depth {
        Depth::Quick => "In one or two sentences, note anything worth the developer's attention.",
        Depth::Standard => {
            "In a short paragraph of three to five sentences, describe what the developer is \
             doing, how it is going, and anything worth their attention."
        }
        Depth::Deep => {
            "Write a thorough review of up to three short paragraphs: the current goal, how the \
             work has progressed, recurring habits, and concrete suggestions."
        }
    }
}

/// Builds the analysis payload in a fixed section order.
pub fn build_context(input: &ContextInput<'_>) -> String {
    let mut out = String::new();

    out.push_str("## Recent activity\n");
    for event in input.events {
        out.push_str(&format_event(event, input.limits));
        out.push('\n');
    }

    out.push_str("\n## Development progression\n");
    for line in progression_section(input.events) {
        out.push_str(&line);
        out.push('\n');
    }

    if !input.session_observations.is_empty() {
        out.push_str("\n## Earlier in this session\n");
        for observation in input.session_observations {
            out.push_str(&format!(
                "- [{}] {}\n",
                clock(observation.timestamp),
                observation.text.trim()
            ));
        }
    }

    if !input.past_observations.is_empty() {
        out.push_str("\n## Previous sessions in this workspace\n");
        for observation in input.past_observations {
            out.push_str(&format!("- {}\n", observation.text.trim()));
        }
    }

    if !input.lessons.is_empty() {
        out.push_str("\n## Lessons learned\n");
        for (bucket, title) in ["High confidence", "Medium confidence", "Low confidence"]
            .into_iter()
            .enumerate()
        {
            let lines = input
                .lessons
                .iter()
                .filter(|lesson| confidence_bucket(lesson.confidence) == bucket)
                .map(lesson_line)
                .collect::<Vec<_>>();
            if lines.is_empty() {
                continue;
            }
            out.push_str(&format!("{title}:\n"));
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
    }

    out.push_str("\n## Instructions\n");
    out.push_str(
        "You are watching a developer's activity stream. Observe, do not command.\n",
    );
    out.push_str(instruction(input.depth));
    out.push_str(
        "\nIf nothing notable happened, respond with an empty message.\n",
    );
    out
}

/// Provider text with the "nothing to report" sentinels mapped to `None`.
pub fn normalize_response(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("EMPTY")
        || trimmed.eq_ignore_ascii_case("NONE")
    {
        return None;
    }
    Some(trimmed.to_string())
}

/// Finds the first JSON object or array embedded in `text`, which may be
/// wrapped in prose or a fenced code block.
pub fn extract_json(text: &str) -> Option<Value> {
    let object = text.find('{').zip(text.rfind('}'));
    let array = text.find('[').zip(text.rfind(']'));

    let mut candidates = [object, array]
        .into_iter()
        .flatten()
        .filter(|(start, end)| end > start)
        .collect::<Vec<_>>();
    candidates.sort_by_key(|(start, _)| *start);

    candidates
        .into_iter()
        .find_map(|(start, end)| serde_json::from_str(&text[start..=end]).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmon_core::LessonCategory;

    fn event(id: i64, source: EventSource, event_type: &str, content: &str) -> StoredEvent {
        StoredEvent {
            id,
            session_id: "s1".to_string(),
            workspace_id: "/repo".to_string(),
            event_type: event_type.to_string(),
            source,
            content: content.to_string(),
            timestamp: 1_700_000_000_000 + id * 1_000,
        }
    }

    fn lesson(content: &str, confidence: f64) -> StoredLesson {
        StoredLesson {
            id: 1,
            category: LessonCategory::Testing,
            content: content.to_string(),
            confidence,
            source_workspace: "/repo".to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn input<'a>(
        events: &'a [StoredEvent],
        lessons: &'a [StoredLesson],
        depth: Depth,
    ) -> ContextInput<'a> {
        ContextInput {
            events,
            session_observations: &[],
            past_observations: &[],
            lessons,
            depth,
            limits: ContextLimits::default(),
        }
    }

    #[test]
    fn diff_summary_caps_paths() {
        let summary = summarize_diff(" M a.rs\n M b.rs\n?? c.rs\n D d.rs\n A e.rs\n", 3);
        assert_eq!(summary, "a.rs, b.rs, c.rs (+2 more)");
        assert_eq!(summarize_diff(" M a.rs\n", 3), "a.rs");
    }

    #[test]
    fn conversation_bodies_are_truncated() {
        let long = "x".repeat(400);
        let line = format_event(
            &event(1, EventSource::Conversation, "assistant_message", &long),
            ContextLimits::default(),
        );
        assert!(line.contains("assistant: "));
        assert!(line.ends_with("..."));
        assert_eq!(line.chars().count(), "[00:00:00] assistant: ".len() + 280);
    }

    #[test]
    fn progression_uses_placeholders() {
        let shell = [event(1, EventSource::Terminal, "command", "ls")];
        assert_eq!(progression_section(&shell), vec![NO_VCS_PLACEHOLDER]);

        let dirty = [
            event(1, EventSource::VersionControl, "file_change", " M a.rs"),
            event(2, EventSource::VersionControl, "file_change", " M b.rs"),
        ];
        assert_eq!(
            progression_section(&dirty),
            vec!["No commits yet; 2 uncommitted change set(s) in progress."]
        );

        let committed = [
            event(1, EventSource::VersionControl, "file_change", " M a.rs"),
            event(2, EventSource::VersionControl, "commit", "abc123 add parser"),
        ];
        let lines = progression_section(&committed);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("abc123 add parser"));
    }

    #[test]
    fn context_sections_appear_in_order() {
        let events = [
            event(1, EventSource::Terminal, "command", "cargo test"),
            event(2, EventSource::Conversation, "user_message", "why does it fail?"),
        ];
        let lessons = [
            lesson("high lesson", 0.9),
            lesson("medium lesson", 0.6),
            lesson("low lesson", 0.2),
        ];
        let payload = build_context(&input(&events, &lessons, Depth::Deep));

        let activity = payload.find("## Recent activity").expect("activity");
        let progression = payload.find("## Development progression").expect("progression");
        let learned = payload.find("## Lessons learned").expect("lessons");
        let instructions = payload.find("## Instructions").expect("instructions");
        assert!(activity < progression && progression < learned && learned < instructions);

        assert!(payload.contains("$ cargo test"));
        assert!(payload.contains("user: why does it fail?"));
        assert!(payload.contains(NO_VCS_PLACEHOLDER));
        let high = payload.find("High confidence:").expect("high bucket");
        let medium = payload.find("Medium confidence:").expect("medium bucket");
        let low = payload.find("Low confidence:").expect("low bucket");
        assert!(high < medium && medium < low);
        assert!(payload.contains("respond with an empty message"));
        assert!(!payload.contains("## Earlier in this session"));
    }

    #[test]
    fn sentinel_responses_normalize_to_none() {
        assert_eq!(normalize_response("  "), None);
        assert_eq!(normalize_response("EMPTY"), None);
        assert_eq!(normalize_response("none\n"), None);
        assert_eq!(
            normalize_response(" Steady progress. "),
            Some("Steady progress.".to_string())
        );
    }

    #[test]
    fn json_is_extracted_from_fences_and_prose() {
        let fenced = "```json\n{\"patterns\": []}\n```";
        assert_eq!(
            extract_json(fenced).expect("fenced"),
            serde_json::json!({ "patterns": [] })
        );

        let array = "Here you go: [{\"code\": \"thrash-loop\"}]";
        assert!(extract_json(array).expect("array").is_array());
        assert!(extract_json("no json here").is_none());
    }
}
