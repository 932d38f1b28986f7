use std::{
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, error, info, warn};

use super::{
    collection::ProjectCollection,
    entities::{ConfidenceHint, Project},
};

pub const PROJECTS_FILE: &str = "projects.json";
pub const SESSION_LOCK_FILE: &str = "session.lock";

/// Version written by [JsonProjectStorage::save]. Older shapes are migrated on load:
/// - 1: bare array of projects whose history entries carry only timestamp, reason and duration.
/// - 2: bare array with match ids and confidence hints.
/// - 3: versioned envelope.
pub const SCHEMA_VERSION: u32 = 3;

/// Interface for persisting the project collection.
pub trait ProjectStorage {
    /// Never fails: unreadable data is logged and replaced by a collection holding only the
    /// Unknown bucket.
    fn load(&self) -> impl Future<Output = ProjectCollection> + Send;

    fn save(&self, collection: &ProjectCollection) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    projects: &'a ProjectCollection,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    projects: Vec<Project>,
}

/// Exclusive ownership of the stored collection. A running `track` session holds one for its
/// whole lifetime, edits from other processes hold one between their load and save. Released on
/// drop.
#[derive(Debug)]
pub struct SessionLock {
    _file: File,
}

/// Stores the collection as a single JSON document.
pub struct JsonProjectStorage {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonProjectStorage {
    pub fn new(dir: &Path) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(PROJECTS_FILE),
            lock_path: dir.join(SESSION_LOCK_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fails right away when another process owns the collection, usually a running `track`
    /// session that would overwrite any change made behind its back.
    pub async fn lock_session(&self) -> Result<SessionLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .await
            .with_context(|| format!("Failed to open {:?}", self.lock_path))?;
        if let Err(e) = file.try_lock_exclusive() {
            debug!("Session lock {:?} is taken: {e}", self.lock_path);
            bail!("Projects are in use by a running tracking session, stop it first");
        }
        Ok(SessionLock { _file: file })
    }

    async fn read_raw(&self) -> Result<Option<String>, std::io::Error> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        file.lock_shared()?;
        let mut content = String::new();
        let result = file.read_to_string(&mut content).await;
        file.unlock_async().await?;
        result?;
        Ok(Some(content))
    }

    /// Keeps unreadable data around so the next save doesn't destroy it.
    async fn preserve_corrupted(&self) {
        let backup = self
            .path
            .with_extension(format!("corrupt-{}.json", Utc::now().timestamp()));
        match tokio::fs::copy(&self.path, &backup).await {
            Ok(_) => warn!("Unreadable project data preserved at {backup:?}"),
            Err(e) => error!("Failed to preserve unreadable project data: {e:?}"),
        }
    }
}

impl ProjectStorage for JsonProjectStorage {
    async fn load(&self) -> ProjectCollection {
        let raw = match self.read_raw().await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("No stored projects at {:?}, starting fresh", self.path);
                return ProjectCollection::default();
            }
            Err(e) => {
                error!("Failed to read projects from {:?}: {e:?}", self.path);
                return ProjectCollection::default();
            }
        };

        match parse_collection(&raw) {
            Ok(collection) => {
                debug!("Loaded {} projects", collection.projects().len());
                collection
            }
            Err(e) => {
                error!("Failed to parse projects from {:?}: {e:?}", self.path);
                self.preserve_corrupted().await;
                ProjectCollection::default()
            }
        }
    }

    async fn save(&self, collection: &ProjectCollection) -> Result<()> {
        let data = serde_json::to_vec_pretty(&EnvelopeRef {
            version: SCHEMA_VERSION,
            projects: collection,
        })?;

        // Written next to the target and renamed over it, so a crash mid-write leaves the old
        // document intact.
        let temporary = self.path.with_extension("json.tmp");
        let mut file = File::create(&temporary)
            .await
            .with_context(|| format!("Failed to create {temporary:?}"))?;
        file.lock_exclusive()?;
        let written = async {
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        file.unlock_async().await?;
        written.with_context(|| format!("Failed to write {temporary:?}"))?;
        drop(file);

        tokio::fs::rename(&temporary, &self.path)
            .await
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}

/// Parses any known stored shape and migrates it to the current one.
pub fn parse_collection(raw: &str) -> Result<ProjectCollection> {
    let value: Value = serde_json::from_str(raw)?;
    let (version, projects) = match value {
        Value::Array(_) => {
            let projects: Vec<Project> = serde_json::from_value(value)?;
            let version = if projects
                .iter()
                .flat_map(|p| p.history.iter())
                .any(|e| e.match_id.is_some() || e.confidence_hint.is_some())
            {
                2
            } else {
                1
            };
            (version, projects)
        }
        Value::Object(_) => {
            let Envelope { version, projects } = serde_json::from_value(value)?;
            if version > SCHEMA_VERSION {
                bail!("Stored schema version {version} is newer than supported {SCHEMA_VERSION}");
            }
            (version, projects)
        }
        _ => bail!("Unexpected stored project shape"),
    };

    if version < SCHEMA_VERSION {
        info!("Migrating stored projects from schema {version} to {SCHEMA_VERSION}");
    }
    let projects = projects
        .into_iter()
        .map(|project| migrate_project(project, version))
        .collect();
    Ok(ProjectCollection::from_projects(projects))
}

fn migrate_project(mut project: Project, version: u32) -> Project {
    // Never-active projects were stored with a zero timestamp.
    if project.last_active.is_some_and(|t| t.timestamp_millis() == 0) {
        project.last_active = None;
    }

    for entry in project.history.iter_mut() {
        if entry.match_id.as_deref() != Some(project.id.as_str()) {
            entry.match_id = Some(project.id.clone());
        }
        if version < 2 && entry.confidence_hint.is_none() {
            entry.confidence_hint = Some(ConfidenceHint::Legacy);
        }
    }

    let count = project.history.len() as u64;
    let total = project.history.iter().map(|e| e.duration).sum::<u64>();
    if project.detect_count != count || project.total_time != total {
        warn!(
            "Project {} counters drifted ({} / {}s), recomputed as {} / {}s",
            project.id, project.detect_count, project.total_time, count, total
        );
        project.detect_count = count;
        project.total_time = total;
    }
    project
}
