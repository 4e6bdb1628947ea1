//! `wikipedia` context: MediaWiki search with intro extracts.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use super::{str_param, ContextHandler, Parameters};
use crate::config::EncyclopediaConfig;
use crate::error::{FetchError, KnowledgeError};
use crate::http_client::HttpClient;
use crate::types::Document;

const SNIPPET_CHARS: usize = 300;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    query: Option<ApiQuery>,
}

#[derive(Debug, Deserialize)]
struct ApiQuery {
    #[serde(default)]
    pages: Vec<ApiPage>,
}

#[derive(Debug, Deserialize)]
struct ApiPage {
    #[serde(default)]
    pageid: Option<u64>,
    title: String,
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    extract: Option<String>,
    #[serde(default)]
    fullurl: Option<String>,
}

pub struct WikipediaContext {
    http: HttpClient,
    config: EncyclopediaConfig,
}

impl WikipediaContext {
    pub fn new(http: HttpClient, config: EncyclopediaConfig) -> Self {
        Self { http, config }
    }

    /// API endpoint for `language`. Only Wikipedia hosts are rewritten.
    fn api_url(&self, language: &str) -> Result<Url, KnowledgeError> {
        let mut url = Url::parse(&self.config.api_url).map_err(|e| {
            KnowledgeError::Fetch(FetchError::permanent(format!(
                "bad encyclopedia api_url {}: {e}",
                self.config.api_url
            )))
        })?;
        let is_wikipedia = url
            .host_str()
            .map(|h| h.ends_with(".wikipedia.org"))
            .unwrap_or(false);
        if is_wikipedia && language != self.config.language {
            let host = format!("{language}.wikipedia.org");
            url.set_host(Some(&host)).map_err(|e| KnowledgeError::InvalidParameters {
                context: "wikipedia".into(),
                reason: format!("bad language {language:?}: {e}"),
            })?;
        }
        Ok(url)
    }

    fn language<'a>(&'a self, parameters: &'a Parameters) -> &'a str {
        str_param(parameters, "language", &self.config.language)
    }
}

fn article_url(api: &Url, title: &str) -> Option<Url> {
    api.join(&format!("/wiki/{}", title.trim().replace(' ', "_")))
        .ok()
}

#[async_trait]
impl ContextHandler for WikipediaContext {
    fn name(&self) -> &'static str {
        "wikipedia"
    }

    fn description(&self) -> &'static str {
        "Encyclopedia articles with introductory extracts"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query for Wikipedia"
                },
                "language": {
                    "type": "string",
                    "description": "Language code (e.g. 'en')",
                    "default": self.config.language
                }
            },
            "required": ["query"]
        })
    }

    /// The search request itself on the API endpoint. Whether robots.txt
    /// is consulted for it is up to `robots.api_exempt`.
    fn gate_url(&self, parameters: &Parameters) -> Result<Url, KnowledgeError> {
        let mut url = self.api_url(self.language(parameters))?;
        url.query_pairs_mut()
            .append_pair("action", "query")
            .append_pair("generator", "search")
            .append_pair("gsrsearch", str_param(parameters, "query", "").trim());
        Ok(url)
    }

    async fn handle(
        &self,
        parameters: &Parameters,
        max_results: usize,
    ) -> Result<Vec<Document>, KnowledgeError> {
        let query = str_param(parameters, "query", "");
        let api = self.api_url(self.language(parameters))?;

        let params = [
            ("action", "query".to_string()),
            ("format", "json".to_string()),
            ("formatversion", "2".to_string()),
            ("generator", "search".to_string()),
            ("gsrsearch", query.to_string()),
            ("gsrlimit", max_results.to_string()),
            ("prop", "extracts|info".to_string()),
            ("exintro", "1".to_string()),
            ("explaintext", "1".to_string()),
            ("exlimit", "max".to_string()),
            ("inprop", "url".to_string()),
            ("redirects", "1".to_string()),
        ];
        let resp = self
            .http
            .get(api.as_str(), &params, self.config.timeout_ms)
            .await?
            .error_for_status("wikipedia search")?;
        let body: ApiResponse = resp.json()?;

        let mut pages = body.query.map(|q| q.pages).unwrap_or_default();
        pages.sort_by_key(|p| p.index.unwrap_or(u32::MAX));
        tracing::debug!("wikipedia returned {} page(s) for {query:?}", pages.len());

        Ok(pages
            .into_iter()
            .take(max_results)
            .map(|page| {
                let url = page
                    .fullurl
                    .clone()
                    .or_else(|| article_url(&api, &page.title).map(|u| u.to_string()))
                    .unwrap_or_default();
                let text = page.extract.unwrap_or_default();
                let snippet: String = text.chars().take(SNIPPET_CHARS).collect();
                let mut doc = Document::new(page.title, url)
                    .with_snippet(snippet)
                    .with_text(text)
                    .with_meta("source", "wikipedia");
                if let Some(id) = page.pageid {
                    doc = doc.with_meta("pageid", id.to_string());
                }
                doc
            })
            .collect())
    }
}
