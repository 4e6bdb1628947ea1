//! HTTP client for a remote knowledge-source server.
//!
//! Routes: `GET contexts`, `GET contexts/{name}`, `POST query/{name}` with
//! `{"parameters": {...}, "max_results": n}`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{ContextInfo, ContextResponse, KnowledgeSource, Parameters};
use crate::error::{FetchError, KnowledgeError};
use crate::http_client::HttpClient;

#[derive(Debug, Deserialize)]
struct ContextList {
    #[serde(default)]
    contexts: Vec<ContextInfo>,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    parameters: &'a Parameters,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct QueryReply {
    #[serde(flatten)]
    response: ContextResponse,
    #[serde(default)]
    error: Option<String>,
}

pub struct RemoteKnowledgeClient {
    http: HttpClient,
    base_url: Url,
    timeout_ms: u64,
    schemas: DashMap<String, Value>,
}

impl RemoteKnowledgeClient {
    pub fn new(http: HttpClient, base_url: &str, timeout_ms: u64) -> Result<Self, KnowledgeError> {
        // Trailing slash so relative joins keep the base path.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized).map_err(|e| {
            KnowledgeError::Fetch(FetchError::permanent(format!(
                "bad knowledge_base_url {base_url}: {e}"
            )))
        })?;
        Ok(Self {
            http,
            base_url,
            timeout_ms,
            schemas: DashMap::new(),
        })
    }

    fn route(&self, path: &str) -> Result<Url, KnowledgeError> {
        self.base_url.join(path).map_err(|e| {
            KnowledgeError::Fetch(FetchError::permanent(format!("bad route {path}: {e}")))
        })
    }
}

#[async_trait]
impl KnowledgeSource for RemoteKnowledgeClient {
    async fn list_contexts(&self) -> Result<Vec<ContextInfo>, KnowledgeError> {
        let url = self.route("contexts")?;
        let list: ContextList = self
            .http
            .get(url.as_str(), &[], self.timeout_ms)
            .await?
            .error_for_status("list contexts")?
            .json()?;
        for ctx in &list.contexts {
            self.schemas.insert(ctx.name.clone(), ctx.schema.clone());
        }
        Ok(list.contexts)
    }

    async fn get_context_schema(&self, context: &str) -> Result<Value, KnowledgeError> {
        if let Some(schema) = self.schemas.get(context) {
            return Ok(schema.clone());
        }
        let url = self.route(&format!("contexts/{context}"))?;
        let resp = self.http.get(url.as_str(), &[], self.timeout_ms).await?;
        if resp.status == 404 {
            return Err(KnowledgeError::UnknownContext(context.to_string()));
        }
        let info: ContextInfo = resp.error_for_status("get context schema")?.json()?;
        self.schemas.insert(context.to_string(), info.schema.clone());
        Ok(info.schema)
    }

    async fn query_context(
        &self,
        context: &str,
        parameters: &Parameters,
        max_results: usize,
    ) -> Result<ContextResponse, KnowledgeError> {
        let url = self.route(&format!("query/{context}"))?;
        let body = QueryRequest {
            parameters,
            max_results,
        };
        let resp = self.http.post_json(url.as_str(), &body, self.timeout_ms).await?;
        if resp.status == 404 {
            return Err(KnowledgeError::UnknownContext(context.to_string()));
        }
        let reply: QueryReply = resp.error_for_status("query context")?.json()?;
        if let Some(error) = reply.error {
            return Err(KnowledgeError::Fetch(FetchError::permanent(format!(
                "{context}: {error}"
            ))));
        }
        Ok(reply.response)
    }

    fn gate_url(&self, context: &str, _parameters: &Parameters) -> Result<Url, KnowledgeError> {
        self.route(&format!("query/{context}"))
    }
}
