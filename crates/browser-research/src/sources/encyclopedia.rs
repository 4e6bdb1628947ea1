//! Encyclopedia adapter: queries the `wikipedia` knowledge context.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::SourceAdapter;
use crate::config::EncyclopediaConfig;
use crate::error::FetchError;
use crate::knowledge::{KnowledgeSource, Parameters};
use crate::types::{Document, SourceKind, Task};

const CONTEXT: &str = "wikipedia";

pub struct EncyclopediaAdapter {
    knowledge: Arc<dyn KnowledgeSource>,
    language: String,
    timeout: Duration,
}

impl EncyclopediaAdapter {
    pub fn new(knowledge: Arc<dyn KnowledgeSource>, config: &EncyclopediaConfig) -> Self {
        Self {
            knowledge,
            language: config.language.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    fn parameters(&self, task: &Task) -> Parameters {
        let mut params = Parameters::new();
        params.insert("query".into(), Value::String(task.target.clone()));
        params.insert("language".into(), Value::String(self.language.clone()));
        params
    }
}

#[async_trait]
impl SourceAdapter for EncyclopediaAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Encyclopedia
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn gate_url(&self, task: &Task) -> Result<Url, FetchError> {
        Ok(self.knowledge.gate_url(CONTEXT, &self.parameters(task))?)
    }

    fn api_endpoint(&self) -> bool {
        true
    }

    async fn fetch(&self, task: &Task) -> Result<Vec<Document>, FetchError> {
        let response = self
            .knowledge
            .query_context(CONTEXT, &self.parameters(task), task.effective_max_results())
            .await?;
        Ok(response.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpClient;
    use crate::knowledge::wikipedia::WikipediaContext;
    use crate::knowledge::KnowledgeHub;
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_through_hub() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("gsrsearch", "tokio runtime"))
            .and(query_param("gsrlimit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "query": {"pages": [{"pageid": 7, "title": "Tokio", "index": 1, "extract": "Async runtime."}]}
            })))
            .mount(&server)
            .await;

        let config = EncyclopediaConfig {
            api_url: format!("{}/w/api.php", server.uri()),
            ..EncyclopediaConfig::default()
        };
        let mut hub = KnowledgeHub::new();
        hub.register(Arc::new(WikipediaContext::new(
            HttpClient::new("test-agent", 5000),
            config.clone(),
        )));
        let adapter = EncyclopediaAdapter::new(Arc::new(hub), &config);

        let task = Task::new("e1", SourceKind::Encyclopedia, "tokio runtime");
        let docs = adapter.fetch(&task).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].title, "Tokio");
        let gate = adapter.gate_url(&task).unwrap();
        assert_eq!(gate.path(), "/w/api.php");
        assert!(gate.query_pairs().any(|(k, v)| k == "gsrsearch" && v == "tokio runtime"));
        assert!(adapter.api_endpoint());
    }

    #[tokio::test]
    async fn test_missing_context_is_permanent() {
        let adapter = EncyclopediaAdapter::new(
            Arc::new(KnowledgeHub::new()),
            &EncyclopediaConfig::default(),
        );
        let task = Task::new("e1", SourceKind::Encyclopedia, "x");
        let err = adapter.fetch(&task).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(adapter.gate_url(&task).is_err());
    }
}
