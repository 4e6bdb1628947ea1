//! Browser-navigation collaborator.
//!
//! [`BrowserEngine`] and [`BrowserPage`] abstract over how a page is loaded:
//! the HTTP engine fetches and parses HTML directly, the Chromium engine
//! (behind the `chromium` feature) drives a headless browser.

pub mod extract;
pub mod http;

#[cfg(feature = "chromium")]
pub mod chromium;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{BrowserEngineKind, GenericPageConfig};
use crate::error::NavigationError;
use crate::http_client::HttpClient;

/// Result of navigating to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResult {
    /// The final URL after any redirects.
    pub final_url: String,
    pub status: u16,
    pub load_time_ms: u64,
}

/// A browser engine that hands out pages.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>, NavigationError>;
    fn name(&self) -> &'static str;
}

/// One open page (tab).
#[async_trait]
pub trait BrowserPage: Send {
    async fn navigate(&mut self, url: &str, timeout_ms: u64)
        -> Result<NavigationResult, NavigationError>;
    async fn wait_for_load(&mut self, timeout_ms: u64) -> Result<(), NavigationError>;
    async fn page_title(&self) -> Result<String, NavigationError>;
    async fn extract_main_content(&self) -> Result<String, NavigationError>;
    async fn close(self: Box<Self>);
}

/// Text content of a loaded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent {
    pub url: String,
    pub title: String,
    pub text: String,
}

/// Navigate, wait for load, read title and main content, close the page.
///
/// A page that ends up on another origin is not read; the caller gets
/// [`NavigationError::Redirected`] and decides whether to follow it.
pub async fn load_page(
    engine: &dyn BrowserEngine,
    url: &str,
    timeout_ms: u64,
) -> Result<PageContent, NavigationError> {
    let mut page = engine.new_page().await?;
    let result = read_page(page.as_mut(), url, timeout_ms).await;
    page.close().await;
    result
}

async fn read_page(
    page: &mut dyn BrowserPage,
    url: &str,
    timeout_ms: u64,
) -> Result<PageContent, NavigationError> {
    let nav = page.navigate(url, timeout_ms).await?;
    if let (Ok(requested), Ok(landed)) = (Url::parse(url), Url::parse(&nav.final_url)) {
        if requested.origin() != landed.origin() {
            return Err(NavigationError::Redirected {
                from: url.to_string(),
                to: nav.final_url,
            });
        }
    }
    page.wait_for_load(timeout_ms).await?;
    let title = page.page_title().await?;
    let text = page.extract_main_content().await?;
    tracing::debug!(
        "loaded {} ({} chars) in {}ms",
        nav.final_url,
        text.len(),
        nav.load_time_ms
    );
    Ok(PageContent {
        url: nav.final_url,
        title,
        text,
    })
}

/// Engine used when the configured browser is not available in this build.
pub struct NoopBrowser {
    reason: String,
}

impl NoopBrowser {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl BrowserEngine for NoopBrowser {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>, NavigationError> {
        Err(NavigationError::Unavailable(self.reason.clone()))
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Engine selected by `sources.generic_page.engine`.
pub fn engine_for(config: &GenericPageConfig, http: HttpClient) -> Arc<dyn BrowserEngine> {
    match config.engine {
        BrowserEngineKind::Http => Arc::new(http::HttpBrowser::new(http)),
        #[cfg(feature = "chromium")]
        BrowserEngineKind::Chromium => Arc::new(chromium::ChromiumBrowser::new()),
        #[cfg(not(feature = "chromium"))]
        BrowserEngineKind::Chromium => {
            tracing::warn!("chromium engine requested but this build lacks the `chromium` feature");
            Arc::new(NoopBrowser::new(
                "built without the `chromium` feature",
            ))
        }
    }
}
