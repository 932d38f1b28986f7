use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use tracing::info;

use crate::{
    tracker::{
        review::{export_json, project_log, review_queue, timeline, timeline_text, LocatedEntry},
        storage::{
            collection::ProjectCollection,
            entities::{Project, RuleHints},
            project_storage::{JsonProjectStorage, ProjectStorage},
        },
    },
    utils::time::{format_log_timestamp, format_total_time},
};

#[derive(Debug, clap::Args)]
pub struct HintArgs {
    #[arg(long = "keyword", help = "Keyword hinting at the project. Repeatable")]
    keywords: Vec<String>,
    #[arg(long = "do", help = "Activity that belongs to the project. Repeatable")]
    do_list: Vec<String>,
    #[arg(long = "dont", help = "Activity that doesn't belong to the project. Repeatable")]
    dont_list: Vec<String>,
    #[arg(long = "window-hint", help = "Window title fragment. Repeatable")]
    window_title_hints: Vec<String>,
    #[arg(long = "url-hint", help = "URL fragment. Repeatable")]
    url_hints: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum TodoAction {
    Add { text: String },
    Toggle { todo_id: String },
}

#[derive(Debug, Subcommand)]
pub enum ProjectCommand {
    #[command(about = "Create a project")]
    Add {
        name: String,
        #[arg(long, short, default_value = "")]
        description: String,
        #[command(flatten)]
        hints: HintArgs,
    },
    #[command(about = "Replace the classification hints of a project")]
    Hints {
        id: String,
        #[command(flatten)]
        hints: HintArgs,
    },
    #[command(about = "Create a project from an observed activity description")]
    FromReason { reason: String },
    #[command(about = "Delete a project together with its history")]
    Delete { id: String },
    #[command(about = "List projects and their totals")]
    List,
    #[command(about = "Move a history entry to another project")]
    Move {
        source: String,
        index: usize,
        target: String,
    },
    #[command(about = "Replace the description of a history entry")]
    EditReason {
        id: String,
        index: usize,
        reason: String,
    },
    #[command(about = "Flag or unflag a history entry as an edge case")]
    ToggleEdge { id: String, index: usize },
    #[command(about = "Set the notes of a project. An empty text clears them")]
    Notes { id: String, text: String },
    #[command(about = "Manage the todo list of a project")]
    Todo {
        id: String,
        #[command(subcommand)]
        action: TodoAction,
    },
    #[command(about = "Show entries that need review")]
    Review,
    #[command(about = "Show every recorded entry")]
    Timeline {
        #[arg(long, help = "Print the chronological text export instead")]
        text: bool,
    },
    #[command(about = "Print the tracking log of a project")]
    Log { id: String },
    #[command(about = "Export all projects as JSON")]
    Export { path: PathBuf },
}

/// Top level keywords describe the project, rule hints keep only the title and URL fragments.
fn apply_hints(collection: &mut ProjectCollection, id: &str, hints: HintArgs) -> Result<()> {
    let HintArgs {
        keywords,
        do_list,
        dont_list,
        window_title_hints,
        url_hints,
    } = hints;
    let rule_hints = RuleHints {
        keywords: vec![],
        window_title_hints,
        url_hints,
    };
    collection.set_hints(id, keywords, do_list, dont_list, rule_hints)
}

/// Loads the collection, applies `change` and saves the result. Refused while a `track` session
/// owns the collection, its next save would drop the change.
async fn update<T>(
    storage: &JsonProjectStorage,
    change: impl FnOnce(&mut ProjectCollection) -> Result<T>,
) -> Result<T> {
    let _lock = storage.lock_session().await?;
    let mut collection = storage.load().await;
    let result = change(&mut collection)?;
    storage.save(&collection).await?;
    Ok(result)
}

fn require<'a>(collection: &'a ProjectCollection, id: &str) -> Result<&'a Project> {
    collection
        .get(id)
        .with_context(|| format!("No project with id {id}"))
}

pub async fn process_project_command(dir: &Path, command: ProjectCommand) -> Result<()> {
    let storage = JsonProjectStorage::new(dir)?;

    match command {
        ProjectCommand::Add {
            name,
            description,
            hints,
        } => {
            let id = update(&storage, |c| {
                let id = c.create_project(&name, &description)?;
                apply_hints(c, &id, hints)?;
                Ok(id)
            })
            .await?;
            info!("Created project {id}");
            println!("{id}");
        }
        ProjectCommand::Hints { id, hints } => {
            update(&storage, |c| apply_hints(c, &id, hints)).await?;
        }
        ProjectCommand::FromReason { reason } => {
            let id = update(&storage, |c| c.create_project_from_reason(&reason)).await?;
            println!("{id}");
        }
        ProjectCommand::Delete { id } => {
            let removed = update(&storage, |c| c.delete_project(&id)).await?;
            info!("Deleted project {id}");
            println!(
                "Deleted {} ({} entries, {})",
                removed.name,
                removed.history.len(),
                format_total_time(removed.total_time)
            );
        }
        ProjectCommand::List => {
            let collection = storage.load().await;
            print_projects(&collection);
        }
        ProjectCommand::Move {
            source,
            index,
            target,
        } => {
            let moved = update(&storage, |c| Ok(c.move_history_entry(&source, index, &target))).await?;
            report_addressing(moved, &source, index)?;
        }
        ProjectCommand::EditReason { id, index, reason } => {
            let edited = update(&storage, |c| Ok(c.edit_history_reason(&id, index, &reason))).await?;
            report_addressing(edited, &id, index)?;
        }
        ProjectCommand::ToggleEdge { id, index } => {
            let toggled = update(&storage, |c| Ok(c.toggle_edge_case(&id, index))).await?;
            report_addressing(toggled, &id, index)?;
        }
        ProjectCommand::Notes { id, text } => {
            update(&storage, |c| c.set_notes(&id, &text)).await?;
        }
        ProjectCommand::Todo {
            id,
            action: TodoAction::Add { text },
        } => {
            let todo_id = update(&storage, |c| c.add_todo(&id, &text)).await?;
            println!("{todo_id}");
        }
        ProjectCommand::Todo {
            id,
            action: TodoAction::Toggle { todo_id },
        } => {
            let toggled = update(&storage, |c| Ok(c.toggle_todo(&id, &todo_id))).await?;
            if !toggled {
                bail!("No todo {todo_id} in project {id}");
            }
        }
        ProjectCommand::Review => {
            let collection = storage.load().await;
            let queue = review_queue(&collection);
            if queue.is_empty() {
                println!("Nothing to review");
            }
            for entry in queue {
                println!("{}", describe_entry(&collection, &entry));
            }
        }
        ProjectCommand::Timeline { text: true } => {
            println!("{}", timeline_text(&storage.load().await));
        }
        ProjectCommand::Timeline { text: false } => {
            let collection = storage.load().await;
            for entry in timeline(&collection) {
                println!("{}", describe_entry(&collection, &entry));
            }
        }
        ProjectCommand::Log { id } => {
            let collection = storage.load().await;
            println!("{}", project_log(require(&collection, &id)?));
        }
        ProjectCommand::Export { path } => {
            export_json(&storage.load().await, &path).await?;
        }
    }
    Ok(())
}

/// Addressing errors leave the collection untouched. They are still worth telling the user about.
fn report_addressing(applied: bool, id: &str, index: usize) -> Result<()> {
    if !applied {
        bail!("No history entry {index} in project {id}");
    }
    Ok(())
}

fn print_projects(collection: &ProjectCollection) {
    for project in collection.projects() {
        let open_todos = project.todos.iter().filter(|t| !t.completed).count();
        println!(
            "{:<36}  {:<30}  {:>12}  {:>5} scans  {} open todos",
            project.id,
            project.name,
            format_total_time(project.total_time),
            project.detect_count,
            open_todos
        );
        if let Some(notes) = &project.notes {
            println!("    {notes}");
        }
    }
    println!(
        "Total focus time: {}",
        format_total_time(collection.total_focus_time())
    );
}

fn describe_entry(collection: &ProjectCollection, located: &LocatedEntry) -> String {
    let entry = located.entry;
    let hint = entry
        .confidence_hint
        .map(|h| h.to_string())
        .unwrap_or_else(|| "unknown".into());
    let mut line = format!(
        "[{}] {} #{} ({hint}) {} ({}s)",
        format_log_timestamp(entry.timestamp),
        located.project.id,
        located.index,
        entry.reason,
        entry.duration
    );
    if entry.is_edge_case {
        line.push_str(" [edge case]");
    }
    if !entry.candidates.is_empty() {
        let candidates = entry
            .candidates
            .iter()
            .map(|c| {
                let name = collection.get(&c.id).map_or(c.id.as_str(), |p| p.name.as_str());
                format!("{name} ({})", c.confidence_hint)
            })
            .collect::<Vec<_>>()
            .join(", ");
        line.push_str(&format!("\n    candidates: {candidates}"));
    }
    if let Some(why) = &entry.why_not_second {
        line.push_str(&format!("\n    why not second: {why}"));
    }
    if let Some(action) = &entry.action {
        line.push_str(&format!("\n    suggested action: {action}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;

    use crate::tracker::storage::entities::UNKNOWN_ID;

    use super::*;

    async fn stored(dir: &Path) -> Result<ProjectCollection> {
        Ok(JsonProjectStorage::new(dir)?.load().await)
    }

    #[tokio::test]
    async fn test_commands_update_stored_collection() -> Result<()> {
        let dir = tempdir()?;
        process_project_command(
            dir.path(),
            ProjectCommand::FromReason {
                reason: "Reading the tokio documentation about select".into(),
            },
        )
        .await?;

        let collection = stored(dir.path()).await?;
        let project = &collection.projects()[1];
        assert_eq!(project.name, "Reading the tokio documentatio...");
        assert_eq!(
            project.description,
            "Context where the screen shows: Reading the tokio documentation about select"
        );
        let id = project.id.clone();

        process_project_command(
            dir.path(),
            ProjectCommand::Notes {
                id: id.clone(),
                text: "Async book".into(),
            },
        )
        .await?;
        process_project_command(
            dir.path(),
            ProjectCommand::Todo {
                id: id.clone(),
                action: TodoAction::Add {
                    text: "Read chapter 3".into(),
                },
            },
        )
        .await?;
        let todo_id = stored(dir.path()).await?.get(&id).unwrap().todos[0].id.clone();
        process_project_command(
            dir.path(),
            ProjectCommand::Todo {
                id: id.clone(),
                action: TodoAction::Toggle { todo_id },
            },
        )
        .await?;

        let collection = stored(dir.path()).await?;
        let project = collection.get(&id).unwrap();
        assert_eq!(project.notes.as_deref(), Some("Async book"));
        assert!(project.todos[0].completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_add_with_hints() -> Result<()> {
        let dir = tempdir()?;
        let hints = HintArgs {
            keywords: vec!["rust".into()],
            do_list: vec!["editing .rs files".into()],
            dont_list: vec![],
            window_title_hints: vec!["trackwhat".into()],
            url_hints: vec!["docs.rs".into()],
        };
        process_project_command(
            dir.path(),
            ProjectCommand::Add {
                name: "Trackwhat".into(),
                description: "Working on the tracker".into(),
                hints,
            },
        )
        .await?;

        let collection = stored(dir.path()).await?;
        let project = &collection.projects()[1];
        assert_eq!(project.keywords, vec!["rust"]);
        assert_eq!(project.do_list, vec!["editing .rs files"]);
        assert_eq!(project.rule_hints.window_title_hints, vec!["trackwhat"]);
        assert_eq!(project.rule_hints.url_hints, vec!["docs.rs"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_edits_are_refused_while_tracking() -> Result<()> {
        let dir = tempdir()?;
        let storage = JsonProjectStorage::new(dir.path())?;
        let session = storage.lock_session().await?;

        let result = process_project_command(
            dir.path(),
            ProjectCommand::FromReason {
                reason: "Reviewing a pull request".into(),
            },
        )
        .await;
        assert!(result.is_err());
        // Reading stays possible.
        process_project_command(dir.path(), ProjectCommand::List).await?;

        // What the session writes is all that ends up on disk.
        storage.save(&storage.load().await).await?;
        assert_eq!(stored(dir.path()).await?.projects().len(), 1);

        drop(session);
        process_project_command(
            dir.path(),
            ProjectCommand::FromReason {
                reason: "Reviewing a pull request".into(),
            },
        )
        .await?;
        assert_eq!(stored(dir.path()).await?.projects().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_requests_fail_without_changes() -> Result<()> {
        let dir = tempdir()?;
        let before = stored(dir.path()).await?;

        let result = process_project_command(
            dir.path(),
            ProjectCommand::Delete {
                id: UNKNOWN_ID.into(),
            },
        )
        .await;
        assert!(result.is_err());

        let result = process_project_command(
            dir.path(),
            ProjectCommand::Move {
                source: UNKNOWN_ID.into(),
                index: 3,
                target: "missing".into(),
            },
        )
        .await;
        assert!(result.is_err());

        assert_eq!(stored(dir.path()).await?, before);
        Ok(())
    }
}
