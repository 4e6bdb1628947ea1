//! HTTP-only browser engine: GET the page and parse the HTML.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use url::Url;

use super::extract::{extract_main_content, extract_title};
use super::{BrowserEngine, BrowserPage, NavigationResult};
use crate::error::{FetchError, NavigationError};
use crate::http_client::HttpClient;
use crate::normalize::is_web_url;

/// Redirects are followed only within the requested origin; a hop to
/// another origin surfaces as [`NavigationError::Redirected`].
pub struct HttpBrowser {
    client: HttpClient,
}

impl HttpBrowser {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client: client.same_origin_redirects(),
        }
    }
}

#[async_trait]
impl BrowserEngine for HttpBrowser {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>, NavigationError> {
        Ok(Box::new(HttpPage {
            client: self.client.clone(),
            html: None,
        }))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// A page whose content is the fetched HTML body.
pub struct HttpPage {
    client: HttpClient,
    html: Option<String>,
}

impl HttpPage {
    fn html(&self) -> Result<&str, NavigationError> {
        self.html.as_deref().ok_or(NavigationError::NoPage)
    }
}

#[async_trait]
impl BrowserPage for HttpPage {
    async fn navigate(
        &mut self,
        url: &str,
        timeout_ms: u64,
    ) -> Result<NavigationResult, NavigationError> {
        let parsed =
            Url::parse(url).map_err(|e| NavigationError::InvalidUrl(format!("{url}: {e}")))?;
        if !is_web_url(&parsed) {
            return Err(NavigationError::InvalidUrl(format!(
                "{url}: unsupported scheme {}",
                parsed.scheme()
            )));
        }
        let start = Instant::now();

        let resp = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.client.get(url, &[], timeout_ms),
        )
        .await
        .map_err(|_| NavigationError::Timeout(timeout_ms))?
        .map_err(|e| match e {
            FetchError::Transient(msg) => NavigationError::Network(msg),
            FetchError::Permanent(msg) => NavigationError::Extraction(msg),
        })?;

        if let Some(location) = resp.location.as_deref().filter(|_| resp.is_redirect()) {
            let to = Url::parse(&resp.final_url)
                .and_then(|base| base.join(location))
                .map_err(|e| NavigationError::InvalidUrl(format!("redirect to {location}: {e}")))?;
            return Err(NavigationError::Redirected {
                from: resp.final_url,
                to: to.to_string(),
            });
        }
        if !resp.is_success() {
            return Err(NavigationError::Status {
                status: resp.status,
            });
        }

        let result = NavigationResult {
            final_url: resp.final_url.clone(),
            status: resp.status,
            load_time_ms: start.elapsed().as_millis() as u64,
        };
        self.html = Some(resp.body);
        Ok(result)
    }

    async fn wait_for_load(&mut self, _timeout_ms: u64) -> Result<(), NavigationError> {
        self.html().map(|_| ())
    }

    async fn page_title(&self) -> Result<String, NavigationError> {
        Ok(extract_title(self.html()?))
    }

    async fn extract_main_content(&self) -> Result<String, NavigationError> {
        Ok(extract_main_content(self.html()?))
    }

    async fn close(self: Box<Self>) {}
}
