use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }

    /// Display color used by list and detail views.
    pub fn color(self) -> &'static str {
        match self {
            Self::High => "#FF3B30",
            Self::Medium => "#FF9500",
            Self::Low => "#34C759",
        }
    }

    /// Accepts the long names in any case and the `H`/`M`/`L` short forms.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" | "h" => Some(Self::High),
            "medium" | "med" | "m" => Some(Self::Medium),
            "low" | "l" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_lenient(s)
            .ok_or_else(|| anyhow!("unknown priority '{s}', expected high, medium or low"))
    }
}

pub const UNSET_PRIORITY_LABEL: &str = "no priority";
pub const UNSET_PRIORITY_COLOR: &str = "#8E8E93";

pub fn priority_color(priority: Option<Priority>) -> &'static str {
    priority.map(Priority::color).unwrap_or(UNSET_PRIORITY_COLOR)
}

pub fn priority_label(priority: Option<Priority>) -> &'static str {
    priority.map(Priority::as_str).unwrap_or(UNSET_PRIORITY_LABEL)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,

    pub title: String,

    #[serde(default, with = "priority_serde")]
    pub priority: Option<Priority>,

    #[serde(default)]
    pub completed: bool,
}

impl Todo {
    pub fn new(id: String, title: String, priority: Option<Priority>) -> Self {
        Self {
            id,
            title,
            priority,
            completed: false,
        }
    }

    /// Merges every field present in `patch`. The title must already be normalized.
    pub fn apply(&mut self, patch: &TodoPatch) {
        if let Some(title) = patch.title.as_ref() {
            self.title = title.clone();
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
    }
}

/// Partial update for a single todo. `None` leaves the field untouched;
/// `priority: Some(None)` clears the priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoPatch {
    pub title: Option<String>,
    pub priority: Option<Option<Priority>>,
    pub completed: Option<bool>,
}

impl TodoPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn priority(priority: Option<Priority>) -> Self {
        Self {
            priority: Some(priority),
            ..Self::default()
        }
    }

    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.priority.is_none() && self.completed.is_none()
    }
}

/// Returns the trimmed title, or `None` when nothing but whitespace is left.
pub fn normalize_title(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Next identifier: the current millisecond timestamp, bumped past both the
/// last identifier issued by this process and every numeric identifier in
/// `existing`.
pub fn next_id(existing: &[Todo], last_issued: u64, now_millis: i64) -> u64 {
    let now = u64::try_from(now_millis).unwrap_or(0);
    let max_existing = existing
        .iter()
        .filter_map(|todo| todo.id.parse::<u64>().ok())
        .max()
        .unwrap_or(0);

    if let (Some(after_issued), Some(after_existing)) =
        (last_issued.checked_add(1), max_existing.checked_add(1))
    {
        return now.max(after_issued).max(after_existing);
    }

    // The counter is exhausted; fall back to the first free id from `now`.
    let taken: HashSet<&str> = existing.iter().map(|todo| todo.id.as_str()).collect();
    let mut candidate = now;
    while candidate == last_issued || taken.contains(candidate.to_string().as_str()) {
        candidate = candidate.wrapping_add(1);
    }
    candidate
}

pub mod priority_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Priority;

    pub fn serialize<S>(priority: &Option<Priority>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(priority.map(Priority::as_str).unwrap_or_default())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Priority>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(Priority::parse_lenient))
    }
}

#[cfg(test)]
mod tests {
    use super::{Priority, Todo, TodoPatch, next_id, normalize_title};

    #[test]
    fn priority_wire_format_is_lenient() {
        let raw = r#"[
            {"id":"1","title":"a","priority":"high","completed":false},
            {"id":"2","title":"b","priority":"","completed":true},
            {"id":"3","title":"c","priority":"M","completed":false},
            {"id":"4","title":"d","priority":null},
            {"id":"5","title":"e","priority":"urgent","extra":1}
        ]"#;
        let todos: Vec<Todo> = serde_json::from_str(raw).expect("parse todos");

        let priorities: Vec<_> = todos.iter().map(|t| t.priority).collect();
        assert_eq!(
            priorities,
            vec![Some(Priority::High), None, Some(Priority::Medium), None, None]
        );
        assert!(todos[1].completed);
        assert!(!todos[3].completed);
    }

    #[test]
    fn unset_priority_serializes_as_empty_string() {
        let todo = Todo::new("7".to_string(), "x".to_string(), None);
        let json = serde_json::to_value(&todo).expect("serialize");
        assert_eq!(json["priority"], "");
        assert_eq!(json["completed"], false);
    }

    #[test]
    fn titles_are_trimmed_and_blank_ones_rejected() {
        assert_eq!(normalize_title("  Buy milk \n"), Some("Buy milk".to_string()));
        assert_eq!(normalize_title(" \t "), None);
        assert_eq!(normalize_title(""), None);
    }

    #[test]
    fn next_id_is_strictly_increasing() {
        let existing = vec![Todo::new("5000".to_string(), "x".to_string(), None)];
        assert_eq!(next_id(&existing, 0, 1000), 5001);
        assert_eq!(next_id(&[], 1200, 1000), 1201);
        assert_eq!(next_id(&[], 0, 1000), 1000);
    }

    #[test]
    fn next_id_survives_an_exhausted_counter() {
        let mut existing = vec![Todo::new(u64::MAX.to_string(), "x".to_string(), None)];
        let mut last = 0;
        for _ in 0..3 {
            let id = next_id(&existing, last, 1000);
            assert!(existing.iter().all(|todo| todo.id != id.to_string()));
            existing.push(Todo::new(id.to_string(), "y".to_string(), None));
            last = id;
        }
        let ids: Vec<_> = existing.iter().map(|todo| todo.id.as_str()).collect();
        assert_eq!(ids, vec!["18446744073709551615", "1000", "1001", "1002"]);

        assert_eq!(next_id(&[], u64::MAX, 1000), 1000);
    }

    #[test]
    fn patch_applies_only_present_fields() {
        let mut todo = Todo::new("1".to_string(), "a".to_string(), Some(Priority::High));
        todo.apply(&TodoPatch::completed(true));
        assert_eq!(todo.priority, Some(Priority::High));
        assert!(todo.completed);

        todo.apply(&TodoPatch::priority(None));
        assert_eq!(todo.priority, None);
        assert_eq!(todo.title, "a");
    }
}
