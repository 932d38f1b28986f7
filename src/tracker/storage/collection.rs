use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::entities::{
    Candidate, ConfidenceHint, HistoryEntry, Project, RuleHints, TodoItem, UNKNOWN_ID,
};

/// Longest project name produced by [ProjectCollection::create_project_from_reason] before the
/// ellipsis.
const SUGGESTED_NAME_LENGTH: usize = 30;

/// Fields of a history entry supplied by whoever produced the attribution. Timestamp, duration
/// and match id are filled in by the collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryFields {
    pub reason: String,
    pub confidence_hint: Option<ConfidenceHint>,
    pub candidates: Vec<Candidate>,
    pub why_not_second: Option<String>,
    pub action: Option<String>,
}

/// The single source of truth for tracked projects. Every mutation goes through `&mut self`, so
/// each update is applied as one step and readers never observe a half-applied attribution.
///
/// Invariant: for every project `detect_count == history.len()` and `total_time` is the sum of
/// entry durations. The Unknown bucket is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectCollection {
    projects: Vec<Project>,
}

impl Default for ProjectCollection {
    fn default() -> Self {
        Self {
            projects: vec![Project::unknown_bucket()],
        }
    }
}

impl ProjectCollection {
    /// Builds a collection from stored projects, inserting the Unknown bucket at the front if it
    /// is missing.
    pub fn from_projects(mut projects: Vec<Project>) -> Self {
        if !projects.iter().any(|p| p.id == UNKNOWN_ID) {
            warn!("Unknown bucket was missing, inserting a fresh one");
            projects.insert(0, Project::unknown_bucket());
        }
        for project in projects.iter_mut() {
            project.is_unknown = project.id == UNKNOWN_ID;
        }
        Self { projects }
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn into_projects(self) -> Vec<Project> {
        self.projects
    }

    pub fn get(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Project> {
        self.projects.iter_mut().find(|p| p.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.projects.iter().position(|p| p.id == id)
    }

    pub fn unknown(&self) -> Option<&Project> {
        self.get(UNKNOWN_ID)
    }

    /// Projects that may be offered to a classifier.
    pub fn candidates(&self) -> impl Iterator<Item = &Project> {
        self.projects.iter().filter(|p| !p.is_unknown)
    }

    /// Sum of time over every project except the Unknown bucket.
    pub fn total_focus_time(&self) -> u64 {
        self.candidates().map(|p| p.total_time).sum()
    }

    /// Records one attribution. A missing or unrecognised target falls back to the Unknown
    /// bucket. Returns the id that was actually credited.
    pub fn credit_attribution(
        &mut self,
        target_id: Option<&str>,
        duration: u64,
        fields: EntryFields,
        now: DateTime<Utc>,
    ) -> String {
        let target_id = match target_id {
            Some(id) if self.get(id).is_some() => id.to_string(),
            Some(id) => {
                warn!("Attribution target {id} no longer exists, crediting unknown bucket");
                UNKNOWN_ID.to_string()
            }
            None => UNKNOWN_ID.to_string(),
        };
        if self.get(&target_id).is_none() {
            self.projects.insert(0, Project::unknown_bucket());
        }

        let EntryFields {
            reason,
            confidence_hint,
            candidates,
            why_not_second,
            action,
        } = fields;
        let entry = HistoryEntry {
            match_id: Some(target_id.clone()),
            confidence_hint,
            candidates,
            why_not_second,
            action,
            ..HistoryEntry::new(now, duration, reason)
        };

        if let Some(project) = self.get_mut(&target_id) {
            project.push_entry(entry);
            project.last_active = Some(now);
            debug!(
                "Credited {duration}s to {target_id}, count {}",
                project.detect_count
            );
        }
        target_id
    }

    /// Moves a single history entry to another project. Out of range indices, unknown ids and
    /// moves onto the same project leave the collection untouched and return `false`.
    pub fn move_history_entry(&mut self, source_id: &str, index: usize, target_id: &str) -> bool {
        if source_id == target_id {
            return false;
        }
        let (Some(source), Some(target)) = (self.position(source_id), self.position(target_id))
        else {
            return false;
        };
        let Some(mut entry) = self.projects[source].take_entry(index) else {
            return false;
        };

        entry.match_id = Some(target_id.to_string());
        entry.mark_manual();

        let target = &mut self.projects[target];
        target.push_entry(entry);
        target.history.sort_by_key(|e| e.timestamp);
        true
    }

    pub fn edit_history_reason(&mut self, item_id: &str, index: usize, new_reason: &str) -> bool {
        let Some(entry) = self
            .get_mut(item_id)
            .and_then(|p| p.history.get_mut(index))
        else {
            return false;
        };
        entry.reason = new_reason.to_string();
        entry.mark_manual();
        true
    }

    pub fn toggle_edge_case(&mut self, item_id: &str, index: usize) -> bool {
        let Some(entry) = self
            .get_mut(item_id)
            .and_then(|p| p.history.get_mut(index))
        else {
            return false;
        };
        entry.is_edge_case = !entry.is_edge_case;
        true
    }

    pub fn create_project(&mut self, name: &str, description: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            bail!("Project name can't be empty");
        }
        let mut id = Uuid::new_v4().to_string();
        while id == UNKNOWN_ID || self.get(&id).is_some() {
            id = Uuid::new_v4().to_string();
        }
        self.projects
            .push(Project::new(id.clone(), name, description.trim()));
        Ok(id)
    }

    /// Seeds a new project from an observed reason, typically one sitting in the Unknown bucket.
    pub fn create_project_from_reason(&mut self, reason: &str) -> Result<String> {
        let (name, description) = suggest_project(reason);
        self.create_project(&name, &description)
    }

    pub fn delete_project(&mut self, id: &str) -> Result<Project> {
        if id == UNKNOWN_ID {
            bail!("The unknown bucket can't be deleted");
        }
        let Some(position) = self.position(id) else {
            bail!("No project with id {id}");
        };
        Ok(self.projects.remove(position))
    }

    pub fn set_notes(&mut self, id: &str, notes: &str) -> Result<()> {
        let Some(project) = self.get_mut(id) else {
            bail!("No project with id {id}");
        };
        project.notes = (!notes.is_empty()).then(|| notes.to_string());
        Ok(())
    }

    pub fn set_hints(
        &mut self,
        id: &str,
        keywords: Vec<String>,
        do_list: Vec<String>,
        dont_list: Vec<String>,
        rule_hints: RuleHints,
    ) -> Result<()> {
        let Some(project) = self.get_mut(id) else {
            bail!("No project with id {id}");
        };
        project.keywords = keywords;
        project.do_list = do_list;
        project.dont_list = dont_list;
        project.rule_hints = rule_hints;
        Ok(())
    }

    pub fn add_todo(&mut self, id: &str, text: &str) -> Result<String> {
        let Some(project) = self.get_mut(id) else {
            bail!("No project with id {id}");
        };
        let todo_id = Uuid::new_v4().to_string();
        project.todos.push(TodoItem {
            id: todo_id.clone(),
            text: text.to_string(),
            completed: false,
        });
        Ok(todo_id)
    }

    pub fn toggle_todo(&mut self, id: &str, todo_id: &str) -> bool {
        let Some(todo) = self
            .get_mut(id)
            .and_then(|p| p.todos.iter_mut().find(|t| t.id == todo_id))
        else {
            return false;
        };
        todo.completed = !todo.completed;
        true
    }
}

/// Name and description proposed for a project created from an observed reason.
pub fn suggest_project(reason: &str) -> (String, String) {
    let reason = reason.trim();
    let name = if reason.chars().count() > SUGGESTED_NAME_LENGTH {
        let mut name: String = reason.chars().take(SUGGESTED_NAME_LENGTH).collect();
        name.push_str("...");
        name
    } else {
        reason.to_string()
    };
    (name, format!("Context where the screen shows: {reason}"))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

    use super::*;

    const TEST_START_DATE: NaiveDateTime =
        NaiveDateTime::new(NaiveDate::from_ymd_opt(2018, 7, 4).unwrap(), NaiveTime::MIN);

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.from_utc_datetime(&TEST_START_DATE) + Duration::seconds(seconds)
    }

    fn reason(text: &str) -> EntryFields {
        EntryFields {
            reason: text.into(),
            confidence_hint: Some(ConfidenceHint::Strong),
            candidates: vec![Candidate {
                id: "other".into(),
                confidence_hint: ConfidenceHint::Weak,
            }],
            why_not_second: Some("closer match".into()),
            action: None,
        }
    }

    fn assert_invariants(collection: &ProjectCollection) {
        for project in collection.projects() {
            assert_eq!(project.detect_count, project.history.len() as u64);
            assert_eq!(
                project.total_time,
                project.history.iter().map(|e| e.duration).sum::<u64>()
            );
            for entry in &project.history {
                assert_eq!(entry.match_id.as_deref(), Some(project.id.as_str()));
            }
        }
    }

    fn two_projects() -> (ProjectCollection, String, String) {
        let mut collection = ProjectCollection::default();
        let a = collection.create_project("Alpha", "editing rust").unwrap();
        let b = collection.create_project("Beta", "reading docs").unwrap();
        (collection, a, b)
    }

    #[test]
    fn credit_updates_counters_and_history_together() {
        let (mut collection, a, _) = two_projects();
        collection.credit_attribution(Some(&a), 30, reason("editing"), at(0));
        collection.credit_attribution(Some(&a), 60, reason("editing more"), at(30));

        let project = collection.get(&a).unwrap();
        assert_eq!(project.detect_count, 2);
        assert_eq!(project.total_time, 90);
        assert_eq!(project.last_active, Some(at(30)));
        assert_invariants(&collection);
    }

    #[test]
    fn credit_without_match_goes_to_unknown() {
        let (mut collection, _, _) = two_projects();
        let credited = collection.credit_attribution(None, 30, reason("browsing"), at(0));
        assert_eq!(credited, UNKNOWN_ID);
        let credited =
            collection.credit_attribution(Some("deleted-project"), 30, reason("x"), at(1));
        assert_eq!(credited, UNKNOWN_ID);
        assert_eq!(collection.unknown().unwrap().detect_count, 2);
        assert_invariants(&collection);
    }

    #[test]
    fn move_preserves_totals_and_relabels() {
        let (mut collection, a, b) = two_projects();
        collection.credit_attribution(Some(&a), 30, reason("first"), at(0));
        collection.credit_attribution(Some(&a), 45, reason("second"), at(60));
        collection.credit_attribution(Some(&b), 20, reason("third"), at(30));

        let before = |c: &ProjectCollection| {
            let (a, b) = (c.get(&a).unwrap(), c.get(&b).unwrap());
            (a.total_time + b.total_time, a.detect_count + b.detect_count)
        };
        let totals = before(&collection);

        assert!(collection.move_history_entry(&a, 1, &b));
        assert_eq!(before(&collection), totals);
        assert_invariants(&collection);

        let target = collection.get(&b).unwrap();
        let timestamps: Vec<_> = target.history.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![at(30), at(60)]);
        let moved = &target.history[1];
        assert_eq!(moved.confidence_hint, Some(ConfidenceHint::Manual));
        assert!(moved.candidates.is_empty());
        assert_eq!(moved.why_not_second, None);

        let source = collection.get(&a).unwrap();
        assert_eq!(source.history.len(), 1);
        assert_eq!(source.history[0].reason, "first");
    }

    #[test]
    fn invalid_moves_are_ignored() {
        let (mut collection, a, b) = two_projects();
        collection.credit_attribution(Some(&a), 30, reason("first"), at(0));
        let snapshot = collection.clone();

        assert!(!collection.move_history_entry(&a, 5, &b));
        assert!(!collection.move_history_entry(&a, 0, &a));
        assert!(!collection.move_history_entry(&a, 0, "missing"));
        assert!(!collection.move_history_entry("missing", 0, &b));
        assert_eq!(collection, snapshot);
    }

    #[test]
    fn edit_reason_marks_entry_manual() {
        let (mut collection, a, _) = two_projects();
        collection.credit_attribution(Some(&a), 30, reason("first"), at(0));

        assert!(collection.edit_history_reason(&a, 0, "pair programming"));
        let entry = &collection.get(&a).unwrap().history[0];
        assert_eq!(entry.reason, "pair programming");
        assert_eq!(entry.confidence_hint, Some(ConfidenceHint::Manual));
        assert!(entry.candidates.is_empty());
        assert!(!collection.edit_history_reason(&a, 3, "nope"));
    }

    #[test]
    fn toggle_edge_case_does_not_touch_counters() {
        let (mut collection, a, _) = two_projects();
        collection.credit_attribution(Some(&a), 30, reason("first"), at(0));

        assert!(collection.toggle_edge_case(&a, 0));
        assert!(collection.get(&a).unwrap().history[0].is_edge_case);
        assert!(collection.toggle_edge_case(&a, 0));
        assert!(!collection.get(&a).unwrap().history[0].is_edge_case);
        assert!(!collection.toggle_edge_case(&a, 1));
        assert_eq!(collection.get(&a).unwrap().total_time, 30);
    }

    #[test]
    fn unknown_bucket_is_protected() {
        let (mut collection, a, _) = two_projects();
        assert!(collection.delete_project(UNKNOWN_ID).is_err());
        assert!(collection.delete_project(&a).is_ok());
        assert!(collection.get(&a).is_none());
        assert!(collection.delete_project(&a).is_err());
    }

    #[test]
    fn focus_time_excludes_unknown() {
        let (mut collection, a, b) = two_projects();
        collection.credit_attribution(Some(&a), 30, reason("a"), at(0));
        collection.credit_attribution(Some(&b), 15, reason("b"), at(1));
        collection.credit_attribution(None, 100, reason("idle"), at(2));
        assert_eq!(collection.total_focus_time(), 45);
    }

    #[test]
    fn project_from_reason_is_truncated_and_starts_empty() {
        let mut collection = ProjectCollection::default();
        let reason = "User is editing React components in VS Code";
        let id = collection.create_project_from_reason(reason).unwrap();
        let project = collection.get(&id).unwrap();
        assert_eq!(project.name, "User is editing React componen...");
        assert_eq!(
            project.description,
            format!("Context where the screen shows: {reason}")
        );
        assert_eq!(project.total_time, 0);
        assert_eq!(project.detect_count, 0);
        assert!(!project.is_unknown);

        let (name, _) = suggest_project("Short reason");
        assert_eq!(name, "Short reason");
    }

    #[test]
    fn missing_unknown_bucket_is_restored_in_front() {
        let projects = vec![Project::new("a", "Alpha", ""), Project::new("b", "Beta", "")];
        let collection = ProjectCollection::from_projects(projects);
        let ids: Vec<_> = collection.projects().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![UNKNOWN_ID, "a", "b"]);
        assert!(collection.projects()[0].is_unknown);
    }

    #[test]
    fn todos_toggle() {
        let (mut collection, a, _) = two_projects();
        let todo = collection.add_todo(&a, "write tests").unwrap();
        assert!(collection.toggle_todo(&a, &todo));
        assert!(collection.get(&a).unwrap().todos[0].completed);
        assert!(!collection.toggle_todo(&a, "missing"));
    }
}
