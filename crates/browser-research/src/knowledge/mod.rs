//! Knowledge-source protocol.
//!
//! A knowledge source exposes named *contexts* (`wikipedia`, `arxiv`), each
//! with a JSON parameter schema. [`KnowledgeHub`] serves contexts in-process;
//! [`remote::RemoteKnowledgeClient`] speaks the same protocol over HTTP.

pub mod arxiv;
pub mod remote;
pub mod wikipedia;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::config::SourcesConfig;
use crate::error::KnowledgeError;
use crate::http_client::HttpClient;
use crate::types::Document;

pub type Parameters = Map<String, Value>;

/// A context as listed by a knowledge source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: Value,
}

/// Normalised answer to a context query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextResponse {
    #[serde(default)]
    pub results: Vec<Document>,
}

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    async fn list_contexts(&self) -> Result<Vec<ContextInfo>, KnowledgeError>;

    async fn get_context_schema(&self, context: &str) -> Result<Value, KnowledgeError>;

    async fn query_context(
        &self,
        context: &str,
        parameters: &Parameters,
        max_results: usize,
    ) -> Result<ContextResponse, KnowledgeError>;

    /// URL a query will hit, for robots checks and rate limiting.
    fn gate_url(&self, context: &str, parameters: &Parameters) -> Result<Url, KnowledgeError>;
}

/// Serves one context.
#[async_trait]
pub trait ContextHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn schema(&self) -> Value;
    fn gate_url(&self, parameters: &Parameters) -> Result<Url, KnowledgeError>;
    async fn handle(
        &self,
        parameters: &Parameters,
        max_results: usize,
    ) -> Result<Vec<Document>, KnowledgeError>;
}

/// In-process knowledge source with registered context handlers.
#[derive(Default)]
pub struct KnowledgeHub {
    handlers: BTreeMap<String, Arc<dyn ContextHandler>>,
}

impl KnowledgeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub with the `wikipedia` and `arxiv` contexts.
    pub fn with_defaults(http: HttpClient, sources: &SourcesConfig) -> Self {
        let mut hub = Self::new();
        hub.register(Arc::new(wikipedia::WikipediaContext::new(
            http.clone(),
            sources.encyclopedia.clone(),
        )));
        hub.register(Arc::new(arxiv::ArxivContext::new(
            http,
            sources.academic.clone(),
        )));
        hub
    }

    pub fn register(&mut self, handler: Arc<dyn ContextHandler>) {
        tracing::debug!("registered knowledge context {}", handler.name());
        self.handlers.insert(handler.name().to_string(), handler);
    }

    fn handler(&self, context: &str) -> Result<&Arc<dyn ContextHandler>, KnowledgeError> {
        self.handlers
            .get(context)
            .ok_or_else(|| KnowledgeError::UnknownContext(context.to_string()))
    }
}

#[async_trait]
impl KnowledgeSource for KnowledgeHub {
    async fn list_contexts(&self) -> Result<Vec<ContextInfo>, KnowledgeError> {
        Ok(self
            .handlers
            .values()
            .map(|h| ContextInfo {
                name: h.name().to_string(),
                description: h.description().to_string(),
                schema: h.schema(),
            })
            .collect())
    }

    async fn get_context_schema(&self, context: &str) -> Result<Value, KnowledgeError> {
        Ok(self.handler(context)?.schema())
    }

    async fn query_context(
        &self,
        context: &str,
        parameters: &Parameters,
        max_results: usize,
    ) -> Result<ContextResponse, KnowledgeError> {
        let handler = self.handler(context)?;
        validate_parameters(context, &handler.schema(), parameters)?;
        let results = handler.handle(parameters, max_results).await?;
        Ok(ContextResponse { results })
    }

    fn gate_url(&self, context: &str, parameters: &Parameters) -> Result<Url, KnowledgeError> {
        self.handler(context)?.gate_url(parameters)
    }
}

/// Check `parameters` against a JSON object schema: required keys present,
/// declared `string` properties are strings, `enum` values respected.
pub fn validate_parameters(
    context: &str,
    schema: &Value,
    parameters: &Parameters,
) -> Result<(), KnowledgeError> {
    let invalid = |reason: String| KnowledgeError::InvalidParameters {
        context: context.to_string(),
        reason,
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match parameters.get(key) {
                None | Some(Value::Null) => return Err(invalid(format!("missing `{key}`"))),
                Some(Value::String(s)) if s.trim().is_empty() => {
                    return Err(invalid(format!("`{key}` is empty")))
                }
                _ => {}
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (key, value) in parameters {
        let Some(prop) = properties.get(key) else {
            continue;
        };
        if prop.get("type").and_then(Value::as_str) == Some("string") && !value.is_string() {
            return Err(invalid(format!("`{key}` must be a string")));
        }
        if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(invalid(format!("`{key}` must be one of {}", Value::from(allowed.clone()))));
            }
        }
    }
    Ok(())
}

/// String parameter, or `default` when absent.
pub(crate) fn str_param<'a>(parameters: &'a Parameters, key: &str, default: &'a str) -> &'a str {
    parameters
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
}
