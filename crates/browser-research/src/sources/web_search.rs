//! Web search adapter: DuckDuckGo HTML results or Google Custom Search.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use url::Url;

use super::{endpoint, PageVisitor, SourceAdapter};
use crate::config::{SearchEngine, WebSearchConfig};
use crate::error::FetchError;
use crate::http_client::HttpClient;
use crate::types::{Document, SourceKind, Task};

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    #[serde(default)]
    items: Vec<GoogleItem>,
}

#[derive(Debug, Deserialize)]
struct GoogleItem {
    #[serde(default)]
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
}

/// Resolve a DuckDuckGo redirect link (`//duckduckgo.com/l/?uddg=...`) to
/// its target. Direct links pass through.
fn resolve_ddg_link(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let url = Url::parse(&absolute).ok()?;
    if url.path().starts_with("/l/") {
        return url
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned());
    }
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Parse the DuckDuckGo HTML results page. Ads are skipped.
pub fn parse_duckduckgo(html: &str, max_results: usize) -> Vec<SearchHit> {
    let doc = Html::parse_document(html);
    let (Ok(result_sel), Ok(link_sel), Ok(snippet_sel)) = (
        Selector::parse("div.result"),
        Selector::parse("a.result__a"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };

    let mut hits = Vec::new();
    for result in doc.select(&result_sel) {
        let is_ad = result
            .value()
            .classes()
            .any(|c| c == "result--ad" || c == "result--ad--small");
        if is_ad {
            continue;
        }
        let Some(link) = result.select(&link_sel).next() else {
            continue;
        };
        let Some(url) = link.value().attr("href").and_then(resolve_ddg_link) else {
            continue;
        };
        if hits.iter().any(|h: &SearchHit| h.url == url) {
            continue;
        }
        let text_of = |el: scraper::ElementRef<'_>| {
            el.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ")
        };
        hits.push(SearchHit {
            title: text_of(link),
            url,
            snippet: result.select(&snippet_sel).next().map(text_of).unwrap_or_default(),
        });
        if hits.len() >= max_results {
            break;
        }
    }
    hits
}

pub struct WebSearchAdapter {
    http: HttpClient,
    config: WebSearchConfig,
    visitor: PageVisitor,
}

impl WebSearchAdapter {
    pub fn new(http: HttpClient, config: WebSearchConfig, visitor: PageVisitor) -> Self {
        Self {
            http,
            config,
            visitor,
        }
    }

    async fn search_duckduckgo(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, FetchError> {
        let resp = self
            .http
            .get(
                &self.config.duckduckgo_url,
                &[("q", query.to_string())],
                self.config.timeout_ms,
            )
            .await?
            .error_for_status("duckduckgo search")?;
        Ok(parse_duckduckgo(&resp.body, max_results))
    }

    async fn search_google(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, FetchError> {
        let (Some(key), Some(cx)) = (&self.config.api_key, &self.config.search_id) else {
            return Err(FetchError::permanent(
                "google search needs sources.web_search.api_key and search_id",
            ));
        };
        let params = [
            ("key", key.clone()),
            ("cx", cx.clone()),
            ("q", query.to_string()),
            // API maximum per request
            ("num", max_results.min(10).to_string()),
            ("safe", "active".to_string()),
        ];
        let body: GoogleResponse = self
            .http
            .get(&self.config.google_url, &params, self.config.timeout_ms)
            .await?
            .error_for_status("google search")?
            .json()?;
        Ok(body
            .items
            .into_iter()
            .take(max_results)
            .map(|item| SearchHit {
                title: item.title,
                url: item.link,
                snippet: item.snippet,
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for WebSearchAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::WebSearch
    }

    fn timeout(&self) -> Duration {
        let visits = self.config.visit_top as u64;
        Duration::from_millis(self.config.timeout_ms.saturating_mul(1 + visits))
    }

    fn gate_url(&self, _task: &Task) -> Result<Url, FetchError> {
        match self.config.engine {
            SearchEngine::Duckduckgo => endpoint(&self.config.duckduckgo_url, "duckduckgo"),
            SearchEngine::Google => endpoint(&self.config.google_url, "google"),
        }
    }

    async fn fetch(&self, task: &Task) -> Result<Vec<Document>, FetchError> {
        let max_results = task.effective_max_results();
        let hits = match self.config.engine {
            SearchEngine::Duckduckgo => self.search_duckduckgo(&task.target, max_results).await?,
            SearchEngine::Google => self.search_google(&task.target, max_results).await?,
        };
        tracing::debug!("web search {:?}: {} hit(s)", task.target, hits.len());

        let engine = match self.config.engine {
            SearchEngine::Duckduckgo => "duckduckgo",
            SearchEngine::Google => "google",
        };
        let mut docs = Vec::with_capacity(hits.len());
        for (rank, hit) in hits.into_iter().enumerate() {
            let mut doc = Document::new(hit.title, hit.url.clone())
                .with_snippet(hit.snippet.clone())
                .with_meta("source", engine)
                .with_meta("rank", (rank + 1).to_string());
            if rank < self.config.visit_top {
                if let Some(page) = self.visitor.visit(&hit.url).await {
                    if doc.title.is_empty() {
                        doc.title = page.title;
                    }
                    doc.text = page.text;
                    doc = doc.with_meta("visited", "true");
                }
            }
            if doc.text.is_empty() {
                doc.text = hit.snippet;
            }
            docs.push(doc);
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::browser::http::HttpBrowser;
    use crate::sources::OriginGate;
    use crate::config::{RateLimitConfig, RobotsConfig};
    use crate::rate_limiter::RateLimiter;
    use crate::robots::RobotsGate;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DDG: &str = r#"<html><body>
      <div class="result results_links result--ad">
        <a class="result__a" href="https://ads.example/buy">Buy now</a>
      </div>
      <div class="result results_links">
        <h2><a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust-lang.org%2F&amp;rut=abc">Rust
          Programming Language</a></h2>
        <a class="result__snippet">A language empowering everyone.</a>
      </div>
      <div class="result results_links">
        <a class="result__a" href="https://doc.rust-lang.org/book/">The Book</a>
        <div class="result__snippet">Learn Rust.</div>
      </div>
      <div class="result results_links">
        <a class="result__a" href="https://third.example/">Third</a>
      </div>
    </body></html>"#;

    #[test]
    fn test_parse_duckduckgo() {
        let hits = parse_duckduckgo(DDG, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://www.rust-lang.org/");
        assert_eq!(hits[0].title, "Rust Programming Language");
        assert_eq!(hits[0].snippet, "A language empowering everyone.");
        assert_eq!(hits[1].url, "https://doc.rust-lang.org/book/");
    }

    #[test]
    fn test_resolve_ddg_link() {
        assert_eq!(
            resolve_ddg_link("//duckduckgo.com/l/?uddg=https%3A%2F%2Fa.example%2Fx").as_deref(),
            Some("https://a.example/x")
        );
        assert_eq!(resolve_ddg_link("javascript:void(0)"), None);
    }

    fn adapter(config: WebSearchConfig) -> WebSearchAdapter {
        let http = HttpClient::new("test-agent", 5000);
        let robots = Arc::new(RobotsGate::new(
            Arc::new(http.clone()),
            RobotsConfig {
                enabled: false,
                ..RobotsConfig::default()
            },
        ));
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            requests_per_minute: 600,
            burst: 10,
            ..RateLimitConfig::default()
        }));
        let visitor = PageVisitor::new(
            Arc::new(HttpBrowser::new(http.clone())),
            OriginGate::new(robots, limiter),
            5000,
            1000,
        );
        WebSearchAdapter::new(http, config, visitor)
    }

    #[tokio::test]
    async fn test_google_requires_credentials() {
        let adapter = adapter(WebSearchConfig {
            engine: SearchEngine::Google,
            ..WebSearchConfig::default()
        });
        let err = adapter
            .fetch(&Task::new("t", SourceKind::WebSearch, "rust"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_google_search() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("q", "rust"))
            .and(query_param("cx", "engine-id"))
            .and(query_param("num", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"title": "Rust", "link": "https://www.rust-lang.org/", "snippet": "fast"},
                    {"title": "Crates", "link": "https://crates.io/", "snippet": "packages"}
                ]
            })))
            .mount(&server)
            .await;

        let adapter = adapter(WebSearchConfig {
            engine: SearchEngine::Google,
            google_url: format!("{}/customsearch/v1", server.uri()),
            api_key: Some("k".into()),
            search_id: Some("engine-id".into()),
            ..WebSearchConfig::default()
        });
        let task = Task::new("t", SourceKind::WebSearch, "rust").with_max_results(2);
        let docs = adapter.fetch(&task).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].url, "https://crates.io/");
        assert_eq!(docs[1].metadata["rank"], "2");
        assert_eq!(docs[0].text, "fast");
    }

    #[tokio::test]
    async fn test_duckduckgo_visits_top_hits() {
        let server = MockServer::start().await;
        let results = format!(
            r#"<div class="result"><a class="result__a" href="{0}/article">Article</a>
               <a class="result__snippet">short</a></div>
               <div class="result"><a class="result__a" href="{0}/other">Other</a></div>"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/html/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(results))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<article><p>Full article text.</p></article>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(WebSearchConfig {
            duckduckgo_url: format!("{}/html/", server.uri()),
            visit_top: 1,
            ..WebSearchConfig::default()
        });
        let docs = adapter
            .fetch(&Task::new("t", SourceKind::WebSearch, "rust"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].text, "Full article text.");
        assert_eq!(docs[0].metadata["visited"], "true");
        assert!(docs[1].text.is_empty());
    }
}
