//! Read-only views over the collection: the review queue, the timeline and text logs.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    classify::is_placeholder_reason,
    utils::time::{format_log_timestamp, format_total_time},
};

use super::storage::{
    collection::ProjectCollection,
    entities::{ConfidenceHint, HistoryEntry, Project},
};

/// A history entry together with its address in the collection.
#[derive(Debug, Clone, Copy)]
pub struct LocatedEntry<'a> {
    pub project: &'a Project,
    /// Position inside `project.history`, as accepted by the move and edit operations.
    pub index: usize,
    pub entry: &'a HistoryEntry,
}

fn all_entries(collection: &ProjectCollection) -> impl Iterator<Item = LocatedEntry<'_>> {
    collection.projects().iter().flat_map(|project| {
        project
            .history
            .iter()
            .enumerate()
            .map(move |(index, entry)| LocatedEntry {
                project,
                index,
                entry,
            })
    })
}

/// Every entry across all projects, newest first.
pub fn timeline(collection: &ProjectCollection) -> Vec<LocatedEntry<'_>> {
    let mut entries: Vec<_> = all_entries(collection).collect();
    entries.sort_by(|a, b| b.entry.timestamp.cmp(&a.entry.timestamp));
    entries
}

/// Chronological plain text export of the whole timeline.
pub fn timeline_text(collection: &ProjectCollection) -> String {
    timeline(collection)
        .iter()
        .rev()
        .map(|e| {
            format!(
                "[{}] [{}] {} ({}s)",
                format_log_timestamp(e.entry.timestamp),
                e.project.name,
                e.entry.reason,
                e.entry.duration
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn project_log(project: &Project) -> String {
    let mut entries: Vec<_> = project.history.iter().collect();
    entries.sort_by_key(|e| e.timestamp);
    let lines = entries
        .iter()
        .map(|e| {
            format!(
                "[{}] {} ({}s)",
                format_log_timestamp(e.timestamp),
                e.reason,
                e.duration
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "--- Tracking Log: {} ---\nTotal Time: {}\n\n{lines}",
        project.name,
        format_total_time(project.total_time)
    )
}

/// Whether a classifier attribution is weak enough to deserve a second look. User asserted
/// entries never are.
pub fn is_low_confidence(entry: &HistoryEntry) -> bool {
    match entry.confidence_hint {
        Some(hint) if hint.is_user_asserted() => false,
        _ if entry.match_id.is_none() => true,
        None => false,
        Some(hint) => hint != ConfidenceHint::Strong,
    }
}

/// Entries awaiting review: everything in the Unknown bucket plus low confidence matches
/// elsewhere, newest first. Entries recorded by the tracker itself are left out.
pub fn review_queue(collection: &ProjectCollection) -> Vec<LocatedEntry<'_>> {
    let mut entries: Vec<_> = all_entries(collection)
        .filter(|e| !is_placeholder_reason(&e.entry.reason))
        .filter(|e| e.project.is_unknown || is_low_confidence(e.entry))
        .collect();
    entries.sort_by(|a, b| b.entry.timestamp.cmp(&a.entry.timestamp));
    entries
}

/// Writes the collection as pretty printed JSON.
pub async fn export_json(collection: &ProjectCollection, path: &Path) -> Result<()> {
    let data = serde_json::to_vec_pretty(collection)?;
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("Failed to export to {path:?}"))?;
    info!("Exported {} projects to {path:?}", collection.projects().len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::{
        classify::{ANALYSIS_FAILED, RATE_LIMIT_REACHED},
        tracker::storage::{
            collection::EntryFields,
            entities::{ConfidenceHint, UNKNOWN_ID},
        },
    };

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_530_662_400, 0).unwrap()
    }

    fn fields(reason: &str, hint: Option<ConfidenceHint>) -> EntryFields {
        EntryFields {
            reason: reason.into(),
            confidence_hint: hint,
            ..Default::default()
        }
    }

    /// Alpha gets a strong and a medium match, Unknown gets an observation and two placeholders.
    fn sample() -> (ProjectCollection, String) {
        let mut collection = ProjectCollection::default();
        let id = collection.create_project("Alpha", "Rust").unwrap();
        let at = |s: i64| start() + Duration::seconds(s);
        collection.credit_attribution(Some(&id), 30, fields("Editing", Some(ConfidenceHint::Strong)), at(0));
        collection.credit_attribution(None, 30, fields("Watching a video", None), at(30));
        collection.credit_attribution(Some(&id), 30, fields("Reading docs", Some(ConfidenceHint::Medium)), at(60));
        collection.credit_attribution(None, 30, fields(ANALYSIS_FAILED, None), at(90));
        collection.credit_attribution(None, 30, fields(RATE_LIMIT_REACHED, None), at(120));
        (collection, id)
    }

    #[test]
    fn test_timeline_is_newest_first() {
        let (collection, _) = sample();
        let reasons: Vec<_> = timeline(&collection)
            .iter()
            .map(|e| e.entry.reason.as_str())
            .collect();
        assert_eq!(
            reasons,
            vec![
                RATE_LIMIT_REACHED,
                ANALYSIS_FAILED,
                "Reading docs",
                "Watching a video",
                "Editing"
            ]
        );
    }

    #[test]
    fn test_timeline_text_is_chronological() {
        let (collection, _) = sample();
        let text = timeline_text(&collection);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] [Alpha] Editing (30s)"));
        assert!(lines[1].ends_with("] [Unknown / Idle] Watching a video (30s)"));
    }

    #[test]
    fn test_project_log() {
        let (collection, id) = sample();
        let log = project_log(collection.get(&id).unwrap());
        let mut lines = log.lines();
        assert_eq!(lines.next(), Some("--- Tracking Log: Alpha ---"));
        assert_eq!(lines.next(), Some("Total Time: 0h 1m 0s"));
        assert_eq!(lines.next(), Some(""));
        assert!(lines.next().unwrap().ends_with("] Editing (30s)"));
        assert!(lines.next().unwrap().ends_with("] Reading docs (30s)"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_review_queue() {
        let (mut collection, id) = sample();
        let queue = review_queue(&collection);
        let reasons: Vec<_> = queue.iter().map(|e| e.entry.reason.as_str()).collect();
        assert_eq!(reasons, vec!["Reading docs", "Watching a video"]);
        assert_eq!(queue[0].project.id, id);
        assert_eq!(queue[0].index, 1);
        assert_eq!(queue[1].project.id, UNKNOWN_ID);
        assert_eq!(queue[1].index, 0);

        // Confirming the unknown entry by moving it makes it manual and removes it.
        assert!(collection.move_history_entry(UNKNOWN_ID, 0, &id));
        let reasons: Vec<_> = review_queue(&collection)
            .iter()
            .map(|e| e.entry.reason.as_str())
            .collect();
        assert_eq!(reasons, vec!["Reading docs"]);
    }

    #[test]
    fn test_low_confidence_rules() {
        let entry = |hint: Option<ConfidenceHint>, matched: bool| HistoryEntry {
            match_id: matched.then(|| "a".to_string()),
            confidence_hint: hint,
            ..HistoryEntry::new(start(), 30, "r")
        };
        assert!(!is_low_confidence(&entry(Some(ConfidenceHint::Strong), true)));
        assert!(is_low_confidence(&entry(Some(ConfidenceHint::Weak), true)));
        assert!(is_low_confidence(&entry(Some(ConfidenceHint::Unknown), true)));
        assert!(!is_low_confidence(&entry(None, true)));
        assert!(is_low_confidence(&entry(None, false)));
        assert!(!is_low_confidence(&entry(Some(ConfidenceHint::Manual), false)));
        assert!(!is_low_confidence(&entry(Some(ConfidenceHint::Legacy), false)));
        assert!(!is_low_confidence(&entry(Some(ConfidenceHint::Locked), true)));
    }

    #[tokio::test]
    async fn test_export_json() -> Result<()> {
        let (collection, _) = sample();
        let dir = tempdir()?;
        let path = dir.path().join("export.json");
        export_json(&collection, &path).await?;

        let exported: ProjectCollection = serde_json::from_slice(&std::fs::read(&path)?)?;
        assert_eq!(exported, collection);
        Ok(())
    }
}
