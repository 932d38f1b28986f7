use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved id of the bucket collecting everything no project matched.
pub const UNKNOWN_ID: &str = "unknown";

/// Categorical strength attached to a match or a candidate. Values outside the known set (as
/// returned by a provider) collapse into [ConfidenceHint::Unknown].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceHint {
    Strong,
    Medium,
    Weak,
    Manual,
    Locked,
    Legacy,
    #[serde(other)]
    Unknown,
}

impl ConfidenceHint {
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "strong" => Self::Strong,
            "medium" => Self::Medium,
            "weak" => Self::Weak,
            "manual" => Self::Manual,
            "locked" => Self::Locked,
            "legacy" => Self::Legacy,
            _ => Self::Unknown,
        }
    }

    /// Hints that were set by the user or by the tracker itself rather than by a provider.
    pub fn is_user_asserted(&self) -> bool {
        matches!(self, Self::Manual | Self::Locked | Self::Legacy)
    }
}

impl Display for ConfidenceHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::Strong => "strong",
            Self::Medium => "medium",
            Self::Weak => "weak",
            Self::Manual => "manual",
            Self::Locked => "locked",
            Self::Legacy => "legacy",
            Self::Unknown => "unknown",
        };
        write!(f, "{value}")
    }
}

/// Runner-up project kept for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: String,
    pub confidence_hint: ConfidenceHint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleHints {
    pub keywords: Vec<String>,
    pub window_title_hints: Vec<String>,
    pub url_hints: Vec<String>,
}

impl RuleHints {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.window_title_hints.is_empty() && self.url_hints.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

/// One timestamped attribution of screen time to a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Seconds credited to the project for this entry.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub match_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_hint: Option<ConfidenceHint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_not_second: Option<String>,
    #[serde(default)]
    pub is_edge_case: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl HistoryEntry {
    pub fn new(timestamp: DateTime<Utc>, duration: u64, reason: impl Into<String>) -> Self {
        Self {
            timestamp,
            duration,
            reason: reason.into(),
            match_id: None,
            confidence_hint: None,
            candidates: vec![],
            why_not_second: None,
            is_edge_case: false,
            action: None,
        }
    }

    /// Marks the entry as asserted by the user. Provider evidence no longer applies to it.
    pub fn mark_manual(&mut self) {
        self.confidence_hint = Some(ConfidenceHint::Manual);
        self.candidates.clear();
        self.why_not_second = None;
    }
}

/// A tracked context or the reserved Unknown bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub do_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dont_list: Vec<String>,
    #[serde(default, skip_serializing_if = "RuleHints::is_empty")]
    pub rule_hints: RuleHints,
    #[serde(default)]
    pub todos: Vec<TodoItem>,
    #[serde(default)]
    pub total_time: u64,
    #[serde(default)]
    pub detect_count: u64,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub is_unknown: bool,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            notes: None,
            keywords: vec![],
            do_list: vec![],
            dont_list: vec![],
            rule_hints: RuleHints::default(),
            todos: vec![],
            total_time: 0,
            detect_count: 0,
            last_active: None,
            history: vec![],
            is_unknown: false,
        }
    }

    pub fn unknown_bucket() -> Self {
        Self {
            is_unknown: true,
            ..Self::new(
                UNKNOWN_ID,
                "Unknown / Idle",
                "Any activity that does not match specific projects. General browsing, desktop, or unrecognized apps.",
            )
        }
    }

    /// Appends an entry that is already attributed to this project and updates the counters.
    pub(crate) fn push_entry(&mut self, entry: HistoryEntry) {
        self.detect_count += 1;
        self.total_time += entry.duration;
        self.history.push(entry);
    }

    /// Removes an entry and rolls the counters back. Counters never go below zero.
    pub(crate) fn take_entry(&mut self, index: usize) -> Option<HistoryEntry> {
        if index >= self.history.len() {
            return None;
        }
        let entry = self.history.remove(index);
        self.detect_count = self.detect_count.saturating_sub(1);
        self.total_time = self.total_time.saturating_sub(entry.duration);
        Some(entry)
    }
}
