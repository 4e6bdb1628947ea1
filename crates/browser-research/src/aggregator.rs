//! Turns terminal task results into a [`ResearchResult`].
//!
//! Successful results keep plan order. Every denied, failed or cancelled
//! task lands in the manifest with its reason, so synthesis can name the
//! gaps instead of silently dropping sources.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::normalize::normalize_url;
use crate::types::{Document, ResearchPlan, SourceKind, TaskId, TaskResult, TaskStatus};

/// A task that produced no content, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub task_id: TaskId,
    pub source_kind: SourceKind,
    pub target: String,
    pub status: TaskStatus,
    pub reason: String,
    pub attempts: u32,
}

/// A deduplicated document with the tasks that returned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcedDocument {
    #[serde(flatten)]
    pub document: Document,
    pub source_kind: SourceKind,
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultStats {
    pub total: usize,
    pub succeeded: usize,
    pub cached: usize,
    pub failed: usize,
    pub denied: usize,
    pub cancelled: usize,
    pub elapsed_ms: u64,
}

/// An origin whose robots rules could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedOrigin {
    pub origin: String,
    pub reason: String,
}

/// Report-ready outcome of one plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub query: String,
    /// Succeeded and cached results, in plan order.
    pub results: Vec<TaskResult>,
    /// Denied, failed and cancelled tasks, in plan order.
    pub manifest: Vec<ManifestEntry>,
    pub documents: Vec<SourcedDocument>,
    pub stats: ResultStats,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_origins: Vec<DegradedOrigin>,
    /// Origins contacted without a robots check (API endpoints and
    /// configured exemptions).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub robots_exempt_origins: Vec<String>,
}

impl ResearchResult {
    /// Assemble from one terminal result per plan task, in plan order.
    pub fn from_terminal(
        plan: &ResearchPlan,
        terminal: Vec<TaskResult>,
        cancelled: bool,
        elapsed_ms: u64,
    ) -> Self {
        let mut stats = ResultStats {
            total: terminal.len(),
            elapsed_ms,
            ..ResultStats::default()
        };
        let mut results = Vec::new();
        let mut manifest = Vec::new();

        for result in terminal {
            match result.status {
                TaskStatus::Succeeded => stats.succeeded += 1,
                TaskStatus::Cached => stats.cached += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Denied => stats.denied += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            if result.status.is_success() {
                results.push(result);
            } else {
                manifest.push(ManifestEntry {
                    task_id: result.task_id,
                    source_kind: result.source_kind,
                    target: result.target,
                    status: result.status,
                    reason: result.error.unwrap_or_default(),
                    attempts: result.attempts,
                });
            }
        }

        let documents = dedup_documents(&results);
        Self {
            query: plan.query().to_string(),
            results,
            manifest,
            documents,
            stats,
            cancelled,
            degraded_origins: Vec::new(),
            robots_exempt_origins: Vec::new(),
        }
    }

    /// Successful results grouped by source kind, plan order within a kind.
    pub fn by_source(&self) -> BTreeMap<SourceKind, Vec<&TaskResult>> {
        let mut groups: BTreeMap<SourceKind, Vec<&TaskResult>> = BTreeMap::new();
        for r in &self.results {
            groups.entry(r.source_kind).or_default().push(r);
        }
        groups
    }

    pub fn result_for(&self, id: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.task_id.as_str() == id)
    }

    pub fn manifest_entry(&self, id: &str) -> Option<&ManifestEntry> {
        self.manifest.iter().find(|m| m.task_id.as_str() == id)
    }

    /// Input for the synthesis collaborator: numbered sources plus gaps.
    pub fn handoff(&self) -> SynthesisInput {
        let sources = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, d)| NumberedSource {
                number: i + 1,
                title: d.document.title.clone(),
                url: d.document.url.clone(),
                source_kind: d.source_kind,
                content: if d.document.text.is_empty() {
                    d.document.snippet.clone()
                } else {
                    d.document.text.clone()
                },
                provenance: d.task_ids.clone(),
            })
            .collect();
        let gaps = self
            .manifest
            .iter()
            .map(|m| {
                format!(
                    "{} {} ({:?}): {}",
                    m.source_kind,
                    m.target,
                    m.status,
                    if m.reason.is_empty() { "no reason recorded" } else { m.reason.as_str() }
                )
            })
            .collect();
        SynthesisInput {
            query: self.query.clone(),
            sources,
            gaps,
        }
    }

    /// `## References` section, one numbered line per deduplicated source.
    pub fn references_markdown(&self) -> String {
        if self.documents.is_empty() {
            return String::new();
        }
        let mut out = String::from("## References\n\n");
        for (i, d) in self.documents.iter().enumerate() {
            let title = if d.document.title.is_empty() {
                d.document.url.as_str()
            } else {
                d.document.title.as_str()
            };
            let line = match d.source_kind {
                SourceKind::WebSearch | SourceKind::GenericPage => {
                    format!("{}. {}. Retrieved from {}\n", i + 1, title, d.document.url)
                }
                SourceKind::Encyclopedia | SourceKind::Academic => format!(
                    "{}. {}. {}. Retrieved from {}\n",
                    i + 1,
                    title,
                    source_label(d),
                    d.document.url
                ),
            };
            out.push_str(&line);
        }
        out
    }
}

fn source_label(d: &SourcedDocument) -> &str {
    match d.document.metadata.get("source").map(String::as_str) {
        Some("wikipedia") => "Wikipedia",
        Some("arxiv") => "arXiv",
        _ => d.source_kind.as_str(),
    }
}

/// Merge documents across results by normalised URL. The first occurrence
/// wins; later ones only add provenance. Documents without a URL are kept.
fn dedup_documents(results: &[TaskResult]) -> Vec<SourcedDocument> {
    let mut out: Vec<SourcedDocument> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for result in results {
        for doc in &result.documents {
            let key = normalize_url(&doc.url)
                .map(|u| u.to_string())
                .ok()
                .filter(|_| !doc.url.trim().is_empty());
            if let Some(idx) = key.as_ref().and_then(|k| seen.get(k)) {
                let entry = &mut out[*idx];
                if !entry.task_ids.contains(&result.task_id) {
                    entry.task_ids.push(result.task_id.clone());
                }
                continue;
            }
            if let Some(k) = key {
                seen.insert(k, out.len());
            }
            out.push(SourcedDocument {
                document: doc.clone(),
                source_kind: result.source_kind,
                task_ids: vec![result.task_id.clone()],
            });
        }
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberedSource {
    pub number: usize,
    pub title: String,
    pub url: String,
    pub source_kind: SourceKind,
    pub content: String,
    pub provenance: Vec<TaskId>,
}

/// What the report writer receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisInput {
    pub query: String,
    pub sources: Vec<NumberedSource>,
    /// Sources that could not be consulted, one line each.
    pub gaps: Vec<String>,
}
