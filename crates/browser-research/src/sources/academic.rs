//! Academic adapter: queries the `arxiv` knowledge context.
//!
//! A task target may carry a category prefix, `cat:cs.AI attention`, which
//! is passed on as the context's `category` parameter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::SourceAdapter;
use crate::config::AcademicConfig;
use crate::error::FetchError;
use crate::knowledge::{KnowledgeSource, Parameters};
use crate::types::{Document, SourceKind, Task};

const CONTEXT: &str = "arxiv";

pub struct AcademicAdapter {
    knowledge: Arc<dyn KnowledgeSource>,
    timeout: Duration,
}

impl AcademicAdapter {
    pub fn new(knowledge: Arc<dyn KnowledgeSource>, config: &AcademicConfig) -> Self {
        Self {
            knowledge,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

/// Split `cat:<category> <query>` into its parts.
fn split_category(target: &str) -> (Option<&str>, &str) {
    let target = target.trim();
    match target.strip_prefix("cat:") {
        Some(rest) => match rest.split_once(char::is_whitespace) {
            Some((cat, query)) => (Some(cat), query.trim()),
            None => (Some(rest), ""),
        },
        None => (None, target),
    }
}

fn parameters(task: &Task) -> Parameters {
    let (category, query) = split_category(&task.target);
    let mut params = Parameters::new();
    params.insert("query".into(), Value::String(query.to_string()));
    if let Some(cat) = category {
        params.insert("category".into(), Value::String(cat.to_string()));
    }
    params
}

#[async_trait]
impl SourceAdapter for AcademicAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Academic
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn gate_url(&self, task: &Task) -> Result<Url, FetchError> {
        Ok(self.knowledge.gate_url(CONTEXT, &parameters(task))?)
    }

    fn api_endpoint(&self) -> bool {
        true
    }

    async fn fetch(&self, task: &Task) -> Result<Vec<Document>, FetchError> {
        let response = self
            .knowledge
            .query_context(CONTEXT, &parameters(task), task.effective_max_results())
            .await?;
        Ok(response.results)
    }
}
