//! Classification Provider Adapter.
//!
//! Builds a provider-agnostic request out of a frame and the project collection, hands it to one
//! of the [ClassificationProvider] back ends and turns whatever comes back into a sanitized
//! [AnalysisResult]. Provider output is never trusted: ids outside the offered set are dropped.

pub mod gemini;
pub mod openai;

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    capture::Frame,
    tracker::storage::{
        collection::{EntryFields, ProjectCollection},
        entities::{Candidate, ConfidenceHint, Project, RuleHints, UNKNOWN_ID},
    },
    utils::config::Settings,
};

pub const ANALYSIS_FAILED: &str = "Analysis failed";
pub const ANALYZING: &str = "Analyzing...";
pub const RATE_LIMIT_REACHED: &str = "Rate limit reached";
const FALLBACK_REASON: &str = "Unknown activity detected";

pub const MAX_CANDIDATES: usize = 2;
pub const MAX_EXAMPLES: usize = 6;
const FREQUENT_EXAMPLES: usize = 3;
const RECENT_EXAMPLES: usize = 2;

/// Reasons produced by the tracker itself rather than observed on screen.
pub fn is_placeholder_reason(reason: &str) -> bool {
    reason.is_empty() || [ANALYSIS_FAILED, ANALYZING, RATE_LIMIT_REACHED].contains(&reason)
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider answered with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider returned no content")]
    EmptyResponse,
    #[error("failed to parse provider output: {0}")]
    Parse(String),
    #[error("environment variable {0} with the API key is not set")]
    MissingApiKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    #[value(name = "openai")]
    #[serde(rename = "openai")]
    OpenAi,
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::OpenAi => write!(f, "openai"),
        }
    }
}

/// How a classification ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    /// The provider answered. `match_id` may still be empty.
    Answered,
    /// The provider explicitly put the screen into the Unknown / Idle bucket.
    Idle,
    /// No usable answer: the request failed or the response was rejected.
    Failed,
}

/// Canonical classification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisResult {
    pub status: AnalysisStatus,
    pub match_id: Option<String>,
    pub reason: String,
    pub candidates: Vec<Candidate>,
    pub confidence_hint: Option<ConfidenceHint>,
    pub why_not_second: Option<String>,
    pub action: Option<String>,
}

impl AnalysisResult {
    pub fn failed() -> Self {
        Self {
            status: AnalysisStatus::Failed,
            match_id: None,
            reason: ANALYSIS_FAILED.to_string(),
            candidates: vec![],
            confidence_hint: None,
            why_not_second: None,
            action: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == AnalysisStatus::Failed
    }
}

impl From<AnalysisResult> for EntryFields {
    fn from(result: AnalysisResult) -> Self {
        Self {
            reason: result.reason,
            confidence_hint: result.confidence_hint,
            candidates: result.candidates,
            why_not_second: result.why_not_second,
            action: result.action,
        }
    }
}

/// What a provider learns about one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub do_list: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dont_list: Vec<String>,
    #[serde(skip_serializing_if = "RuleHints::is_empty")]
    pub rule_hints: RuleHints,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
}

impl From<&Project> for ProjectProfile {
    fn from(project: &Project) -> Self {
        Self {
            id: project.id.clone(),
            name: project.name.clone(),
            description: project.description.clone(),
            keywords: project.keywords.clone(),
            do_list: project.do_list.clone(),
            dont_list: project.dont_list.clone(),
            rule_hints: project.rule_hints.clone(),
            examples: select_examples(project),
        }
    }
}

/// Project profiles and prompt captured when a scan is triggered. Turned into a request once the
/// frame is available, so edits made meanwhile don't leak into an already started scan.
#[derive(Debug, Clone)]
pub struct ProjectSnapshot {
    pub projects: Vec<ProjectProfile>,
    pub prompt: String,
}

impl ProjectSnapshot {
    /// Offers every project except the Unknown bucket.
    pub fn new(collection: &ProjectCollection) -> Self {
        let projects: Vec<ProjectProfile> = collection.candidates().map(Into::into).collect();
        let prompt = build_prompt(&projects);
        Self { projects, prompt }
    }

    pub fn into_request(self, frame: Frame) -> ClassificationRequest {
        ClassificationRequest {
            frame,
            projects: self.projects,
            prompt: self.prompt,
        }
    }
}

/// Everything a provider needs for one call.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub frame: Frame,
    pub projects: Vec<ProjectProfile>,
    pub prompt: String,
}

impl ClassificationRequest {
    pub fn new(frame: Frame, collection: &ProjectCollection) -> Self {
        ProjectSnapshot::new(collection).into_request(frame)
    }

    fn offered_ids(&self) -> HashSet<&str> {
        self.projects.iter().map(|p| p.id.as_str()).collect()
    }
}

/// A back end able to classify a frame. Returns the raw JSON text produced by the model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClassificationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn classify(&self, request: &ClassificationRequest) -> Result<String, ProviderError>;
}

/// Creates the back end selected in the settings. Fails when its API key is missing.
pub fn build_provider(settings: &Settings) -> Result<Arc<dyn ClassificationProvider>> {
    let model = settings.model();
    let env_var = settings.api_key_env();
    let timeout = settings.request_timeout();
    let provider: Arc<dyn ClassificationProvider> = match settings.provider {
        ProviderKind::Gemini => Arc::new(gemini::GeminiProvider::from_env(model, &env_var, timeout)?),
        ProviderKind::OpenAi => Arc::new(openai::OpenAiProvider::from_env(
            model,
            &env_var,
            settings.base_url.clone(),
            timeout,
        )?),
    };
    info!("Using {} provider", provider.name());
    Ok(provider)
}

/// Runs one classification. Never fails: any error becomes the [ANALYSIS_FAILED] result.
pub async fn analyze_frame(
    provider: Arc<dyn ClassificationProvider>,
    request: ClassificationRequest,
) -> AnalysisResult {
    let span = info_span!("classification", provider = provider.name());
    async move {
        let text = match provider.classify(&request).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Classification request failed: {e}");
                return AnalysisResult::failed();
            }
        };
        match parse_analysis(&text, &request.offered_ids()) {
            Ok(result) => {
                debug!(
                    "Classified as {:?} ({:?}): {}",
                    result.match_id, result.status, result.reason
                );
                result
            }
            Err(e) => {
                warn!("Classification response rejected: {e}");
                AnalysisResult::failed()
            }
        }
    }
    .instrument(span)
    .await
}

/// Strictly parses provider output. Only a non-object document is an error; individual fields
/// with the wrong shape or unknown ids degrade to their empty defaults.
pub fn parse_analysis(text: &str, offered_ids: &HashSet<&str>) -> Result<AnalysisResult, ProviderError> {
    let value: Value = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| ProviderError::Parse(e.to_string()))?;
    let Value::Object(object) = value else {
        return Err(ProviderError::Parse("expected a JSON object".into()));
    };

    let text_field = |name: &str| {
        object
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let answered_id = text_field("matchId");
    let status = if answered_id.as_deref() == Some(UNKNOWN_ID) {
        AnalysisStatus::Idle
    } else {
        AnalysisStatus::Answered
    };
    let match_id = answered_id.filter(|id| offered_ids.contains(id.as_str()));
    let reason = text_field("reason").unwrap_or_else(|| FALLBACK_REASON.to_string());
    let confidence_hint = text_field("confidenceHint").map(|v| ConfidenceHint::parse_lenient(&v));

    let mut seen = HashSet::new();
    let candidates = object
        .get("candidates")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item.get("id")?.as_str()?.trim();
                    let hint = item
                        .get("confidenceHint")
                        .and_then(Value::as_str)
                        .map(ConfidenceHint::parse_lenient)
                        .unwrap_or(ConfidenceHint::Unknown);
                    Some((id, hint))
                })
                .filter(|(id, _)| offered_ids.contains(id))
                .filter(|(id, _)| match_id.as_deref() != Some(*id))
                .filter(|(id, _)| seen.insert(id.to_string()))
                .take(MAX_CANDIDATES)
                .map(|(id, confidence_hint)| Candidate {
                    id: id.to_string(),
                    confidence_hint,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(AnalysisResult {
        status,
        match_id,
        reason,
        candidates,
        confidence_hint,
        why_not_second: text_field("whyNotSecond"),
        action: text_field("action"),
    })
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Picks up to [MAX_EXAMPLES] representative reasons from a project's history: the most
/// frequent ones, then the most recent distinct ones, then edge cases.
pub fn select_examples(project: &Project) -> Vec<String> {
    let usable = || {
        project
            .history
            .iter()
            .filter(|e| !is_placeholder_reason(e.reason.trim()))
    };

    let mut frequency: HashMap<&str, (usize, i64)> = HashMap::new();
    for entry in usable() {
        let slot = frequency.entry(entry.reason.trim()).or_insert((0, i64::MIN));
        slot.0 += 1;
        slot.1 = slot.1.max(entry.timestamp.timestamp_millis());
    }
    let mut by_frequency: Vec<_> = frequency.into_iter().collect();
    by_frequency.sort_by(|(a_reason, a), (b_reason, b)| {
        b.0.cmp(&a.0)
            .then(b.1.cmp(&a.1))
            .then(a_reason.cmp(b_reason))
    });

    let mut by_recency: Vec<_> = usable().collect();
    by_recency.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut examples: Vec<String> = vec![];
    let push = |examples: &mut Vec<String>, reason: &str| {
        if examples.len() < MAX_EXAMPLES && !examples.iter().any(|e| e == reason) {
            examples.push(reason.to_string());
        }
    };

    for &(reason, _) in by_frequency.iter().take(FREQUENT_EXAMPLES) {
        push(&mut examples, reason);
    }
    let mut recent_added = 0;
    for entry in by_recency.iter() {
        if recent_added == RECENT_EXAMPLES {
            break;
        }
        let reason = entry.reason.trim();
        if !examples.iter().any(|e| e == reason) {
            push(&mut examples, reason);
            recent_added += 1;
        }
    }
    for entry in by_recency.iter().filter(|e| e.is_edge_case) {
        push(&mut examples, entry.reason.trim());
    }
    examples
}

pub fn build_prompt(projects: &[ProjectProfile]) -> String {
    let known = if projects.is_empty() {
        "No specific projects are defined yet.".to_string()
    } else {
        serde_json::to_string_pretty(projects).unwrap_or_default()
    };

    format!(
        r#"You classify what a user is doing from a screenshot of their screen.

Known projects the user tracks (JSON):
{known}

Instructions:
1. Describe in one short sentence what is visible and what the user is doing. Return it as "reason".
2. Decide whether the activity matches one of the known projects, using the description, keywords,
   do/don't lists, rule hints and examples of earlier observations.
3. If one project clearly matches, set "matchId" to its id. If the user is away or the screen shows
   no activity at all, set "matchId" to "{UNKNOWN_ID}". Otherwise set "matchId" to null.
4. Set "confidenceHint" to "strong", "medium" or "weak".
5. List up to {MAX_CANDIDATES} other plausible projects in "candidates" with their own confidenceHint.
6. If there is a runner-up, explain in "whyNotSecond" why it lost.
7. Optionally suggest a short next step in "action".

Only use ids from the list above. Respond with JSON only."#
    )
}

/// JSON schema of the expected answer, shared by providers that accept one.
pub fn response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "matchId": { "type": ["string", "null"] },
            "reason": { "type": "string" },
            "confidenceHint": { "type": "string", "enum": ["strong", "medium", "weak"] },
            "candidates": {
                "type": "array",
                "maxItems": MAX_CANDIDATES,
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "confidenceHint": { "type": "string", "enum": ["strong", "medium", "weak"] }
                    },
                    "required": ["id", "confidenceHint"]
                }
            },
            "whyNotSecond": { "type": "string" },
            "action": { "type": ["string", "null"] }
        },
        "required": ["reason", "matchId"]
    })
}
