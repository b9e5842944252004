//! Query classification: what kind of recall is being asked for, and what
//! kind of task the user is doing.

use regex::Regex;
use std::sync::OnceLock;

/// What the raw query string resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    /// Empty/whitespace: most recent session in scope.
    Recent,
    /// Exact session fetch (`session_<n>`).
    SessionId(String),
    /// Exact learning fetch (`#42`, `42`, `learning_42`).
    LearningId(i64),
    /// Everything else: hybrid semantic search.
    Hybrid,
}

fn session_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^session_\d+$").expect("valid regex"))
}

fn learning_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:#?(\d+)|learning_(\d+))$").expect("valid regex"))
}

pub fn classify_query(raw: &str) -> QueryKind {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return QueryKind::Recent;
    }
    if session_re().is_match(trimmed) {
        return QueryKind::SessionId(trimmed.to_string());
    }
    if let Some(caps) = learning_re().captures(trimmed) {
        let digits = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str());
        if let Some(Ok(id)) = digits.map(str::parse) {
            return QueryKind::LearningId(id);
        }
    }
    QueryKind::Hybrid
}

// ---------------------------------------------------------------------------
// Task types and category boosts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Debug,
    Implement,
    Refactor,
    Design,
    Explain,
    General,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Debug => "debug",
            TaskType::Implement => "implement",
            TaskType::Refactor => "refactor",
            TaskType::Design => "design",
            TaskType::Explain => "explain",
            TaskType::General => "general",
        }
    }
}

const DEBUG_WORDS: &[&str] = &[
    "debug", "fix", "error", "bug", "crash", "broken", "fails", "failing", "failure",
    "exception", "traceback", "panics",
];
const IMPLEMENT_WORDS: &[&str] = &["implement", "add", "create", "build", "write", "support"];
const REFACTOR_WORDS: &[&str] = &[
    "refactor", "cleanup", "clean", "simplify", "restructure", "rename", "extract",
];
const DESIGN_WORDS: &[&str] = &[
    "design", "architecture", "architect", "plan", "approach", "schema", "model",
];
const EXPLAIN_WORDS: &[&str] = &["explain", "what", "how", "why", "understand", "describe"];

/// Rule-based task-type detection over the query's words.
///
/// First matching family wins, most specific first: a query like "fix the
/// broken build" is a debug task even though "build" alone would read as
/// implement.
pub fn detect_task_type(query: &str) -> TaskType {
    let lower = query.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let hits = |table: &[&str]| words.iter().any(|w| table.contains(w));
    if hits(DEBUG_WORDS) {
        TaskType::Debug
    } else if hits(REFACTOR_WORDS) {
        TaskType::Refactor
    } else if hits(DESIGN_WORDS) {
        TaskType::Design
    } else if hits(IMPLEMENT_WORDS) {
        TaskType::Implement
    } else if hits(EXPLAIN_WORDS) {
        TaskType::Explain
    } else {
        TaskType::General
    }
}

/// Per-task-type category boost. Values are within [1.0, 2.0]; categories
/// not listed boost at 1.0.
pub fn category_boost(task_type: TaskType, category: &str) -> f64 {
    let table: &[(&str, f64)] = match task_type {
        TaskType::Debug => &[
            ("debugging", 1.8),
            ("errors", 1.6),
            ("testing", 1.3),
            ("backend", 1.2),
        ],
        TaskType::Implement => &[
            ("patterns", 1.5),
            ("architecture", 1.3),
            ("backend", 1.2),
            ("frontend", 1.2),
        ],
        TaskType::Refactor => &[
            ("patterns", 1.6),
            ("architecture", 1.4),
            ("conventions", 1.3),
        ],
        TaskType::Design => &[
            ("architecture", 1.8),
            ("design", 1.6),
            ("patterns", 1.5),
        ],
        TaskType::Explain => &[("concepts", 1.5), ("architecture", 1.2)],
        TaskType::General => &[],
    };
    table
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, b)| *b)
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        assert_eq!(classify_query(""), QueryKind::Recent);
        assert_eq!(classify_query("   "), QueryKind::Recent);
        assert_eq!(
            classify_query("session_42"),
            QueryKind::SessionId("session_42".into())
        );
        assert_eq!(classify_query("#17"), QueryKind::LearningId(17));
        assert_eq!(classify_query("17"), QueryKind::LearningId(17));
        assert_eq!(classify_query("learning_17"), QueryKind::LearningId(17));
        assert_eq!(classify_query("typography guidelines"), QueryKind::Hybrid);
        // Not an exact-id shape: falls through to hybrid.
        assert_eq!(classify_query("session_42 extras"), QueryKind::Hybrid);
    }

    #[test]
    fn task_type_detection() {
        assert_eq!(detect_task_type("fix the broken build"), TaskType::Debug);
        assert_eq!(detect_task_type("implement retry logic"), TaskType::Implement);
        assert_eq!(detect_task_type("refactor the store layer"), TaskType::Refactor);
        assert_eq!(detect_task_type("design the schema"), TaskType::Design);
        assert_eq!(detect_task_type("how does claiming work"), TaskType::Explain);
        assert_eq!(detect_task_type("typography"), TaskType::General);
    }

    #[test]
    fn boosts_stay_in_range() {
        for task in [
            TaskType::Debug,
            TaskType::Implement,
            TaskType::Refactor,
            TaskType::Design,
            TaskType::Explain,
            TaskType::General,
        ] {
            for category in ["debugging", "patterns", "architecture", "unknown"] {
                let b = category_boost(task, category);
                assert!((1.0..=2.0).contains(&b), "{task:?}/{category}: {b}");
            }
        }
        assert_eq!(category_boost(TaskType::General, "debugging"), 1.0);
        assert_eq!(category_boost(TaskType::Debug, "debugging"), 1.8);
    }
}
