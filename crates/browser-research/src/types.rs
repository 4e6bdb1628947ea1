//! Core data types: plans, tasks, documents and per-task results.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// The kind of knowledge source a task is executed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    WebSearch,
    Encyclopedia,
    Academic,
    GenericPage,
}

impl SourceKind {
    /// Every kind, in declaration order.
    pub const ALL: [SourceKind; 4] = [
        SourceKind::WebSearch,
        SourceKind::Encyclopedia,
        SourceKind::Academic,
        SourceKind::GenericPage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSearch => "web_search",
            Self::Encyclopedia => "encyclopedia",
            Self::Academic => "academic",
            Self::GenericPage => "generic_page",
        }
    }

    /// Default number of documents requested when a task does not say.
    pub fn default_max_results(self) -> usize {
        match self {
            Self::WebSearch => 5,
            Self::Encyclopedia => 2,
            Self::Academic => 3,
            Self::GenericPage => 1,
        }
    }

    /// Map a planner source name ("wikipedia", "arxiv", ...) to a kind.
    pub fn from_source_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "web_search" | "web" | "search" => Some(Self::WebSearch),
            "encyclopedia" | "wikipedia" => Some(Self::Encyclopedia),
            "academic" | "arxiv" => Some(Self::Academic),
            "generic_page" | "page" | "url" => Some(Self::GenericPage),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_source_name(s).ok_or_else(|| format!("unknown source kind: {s}"))
    }
}

/// Unique task identifier within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One unit of retrieval work against one knowledge source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub source_kind: SourceKind,
    /// Search query, or URL for `generic_page` tasks.
    pub target: String,
    /// Higher runs earlier among tasks of the same source kind.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
    /// Total attempt budget; falls back to `retry.max_attempts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, source_kind: SourceKind, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_kind,
            target: target.into(),
            priority: 0,
            max_results: None,
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn effective_max_results(&self) -> usize {
        self.max_results
            .unwrap_or_else(|| self.source_kind.default_max_results())
            .max(1)
    }
}

/// A decomposed research query: ordered tasks plus a priority order over
/// source kinds. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchPlan {
    query: String,
    tasks: Vec<Task>,
    #[serde(default)]
    priority_order: Vec<SourceKind>,
}

impl ResearchPlan {
    pub fn new(query: impl Into<String>, tasks: Vec<Task>, priority_order: Vec<SourceKind>) -> Self {
        Self {
            query: query.into(),
            tasks,
            priority_order,
        }
    }

    /// Single web search for the raw query, used when planning fails.
    pub fn fallback(query: &str) -> Self {
        Self::new(
            query,
            vec![Task::new("web_search-1", SourceKind::WebSearch, query)],
            vec![SourceKind::WebSearch],
        )
    }

    /// Build a plan from the planner's query analysis.
    ///
    /// Sources are visited in the analysis' `priority_order`; each search
    /// term becomes one task. Unknown source names are skipped. An analysis
    /// that yields no task degrades to [`ResearchPlan::fallback`].
    pub fn from_analysis(query: &str, analysis: &QueryAnalysis) -> Self {
        let mut priority_order = Vec::new();
        let mut tasks = Vec::new();
        let mut counters: HashMap<SourceKind, usize> = HashMap::new();

        for name in &analysis.priority_order {
            let Some(kind) = SourceKind::from_source_name(name) else {
                tracing::warn!("planner named unknown source {name:?}, skipping");
                continue;
            };
            if !priority_order.contains(&kind) {
                priority_order.push(kind);
            }
            let Some(terms) = analysis.search_terms.get(name.as_str()) else {
                continue;
            };
            for term in terms.iter().filter(|t| !t.trim().is_empty()) {
                let n = counters.entry(kind).or_insert(0);
                *n += 1;
                tasks.push(Task::new(format!("{kind}-{n}"), kind, term.trim()));
            }
        }

        if tasks.is_empty() {
            return Self::fallback(query);
        }
        Self::new(query, tasks, priority_order)
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn priority_order(&self) -> &[SourceKind] {
        &self.priority_order
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Admission rank of a source kind: listed kinds in list order, then
    /// unlisted kinds in declaration order.
    pub fn rank(&self, kind: SourceKind) -> usize {
        match self.priority_order.iter().position(|k| *k == kind) {
            Some(pos) => pos,
            None => {
                let idx = SourceKind::ALL.iter().position(|k| *k == kind).unwrap_or(0);
                self.priority_order.len() + idx
            }
        }
    }

    /// Reject duplicate ids and empty targets.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(&task.id) {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
            if task.target.trim().is_empty() {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "task {} has an empty target",
                    task.id
                )));
            }
        }
        Ok(())
    }
}

/// Query analysis emitted by the planner collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryAnalysis {
    #[serde(default)]
    pub main_question: String,
    #[serde(default)]
    pub sub_questions: Vec<String>,
    #[serde(default)]
    pub search_terms: HashMap<String, SearchTerms>,
    #[serde(default)]
    pub priority_order: Vec<String>,
    #[serde(default)]
    pub requires_followup: bool,
}

/// Planner search terms: a single string or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchTerms {
    One(String),
    Many(Vec<String>),
}

impl SearchTerms {
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        match self {
            Self::One(s) => std::slice::from_ref(s).iter(),
            Self::Many(v) => v.iter(),
        }
    }
}

/// A normalized piece of retrieved content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            text: String::new(),
            snippet: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Terminal state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Cached,
    Failed,
    Denied,
    Cancelled,
}

impl TaskStatus {
    /// Whether the result carries content.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::Cached)
    }
}

/// Outcome of one task. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub source_kind: SourceKind,
    pub target: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Adapter invocations spent on this task.
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    fn new(task: &Task, status: TaskStatus, attempts: u32) -> Self {
        Self {
            task_id: task.id.clone(),
            source_kind: task.source_kind,
            target: task.target.clone(),
            status,
            documents: Vec::new(),
            error: None,
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn succeeded(task: &Task, documents: Vec<Document>, attempts: u32) -> Self {
        Self {
            documents,
            ..Self::new(task, TaskStatus::Succeeded, attempts)
        }
    }

    /// Serve `task` from a previously stored result.
    pub fn cached(task: &Task, stored: &TaskResult) -> Self {
        Self {
            documents: stored.documents.clone(),
            ..Self::new(task, TaskStatus::Cached, 0)
        }
    }

    pub fn failed(task: &Task, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(task, TaskStatus::Failed, attempts)
        }
    }

    pub fn denied(task: &Task, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::new(task, TaskStatus::Denied, 0)
        }
    }

    pub fn cancelled(task: &Task, attempts: u32) -> Self {
        Self {
            error: Some("plan cancelled".to_string()),
            ..Self::new(task, TaskStatus::Cancelled, attempts)
        }
    }
}
