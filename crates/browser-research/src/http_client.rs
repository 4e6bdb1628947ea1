//! Async HTTP client wrapping reqwest.
//!
//! Not a browser, just HTTP requests with a fixed user agent, redirects and
//! per-call timeouts. Retrying is the scheduler's job, so every call is made
//! exactly once and failures come back classified as [`FetchError`].

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FetchError;

/// Response from an HTTP request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Original requested URL.
    pub url: String,
    /// Final URL after redirects.
    pub final_url: String,
    /// HTTP status code.
    pub status: u16,
    /// Content-Type header, if any.
    pub content_type: Option<String>,
    /// Location header of a redirect that was not followed.
    pub location: Option<String>,
    /// Response body as text.
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Fail with a classified error unless the status is 2xx.
    pub fn error_for_status(self, context: &str) -> Result<Self, FetchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FetchError::from_status(self.status, context))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_str(&self.body)
            .map_err(|e| FetchError::permanent(format!("invalid JSON from {}: {e}", self.url)))
    }
}

/// HTTP client shared by robots fetching, adapters and the HTTP browser engine.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    /// HTTP/1.1-only fallback client for sites that reject HTTP/2.
    h1_client: reqwest::Client,
    user_agent: String,
    timeout_ms: u64,
}

const MAX_REDIRECTS: usize = 5;

fn redirect_policy(same_origin: bool) -> reqwest::redirect::Policy {
    if !same_origin {
        return reqwest::redirect::Policy::limited(MAX_REDIRECTS);
    }
    reqwest::redirect::Policy::custom(|attempt| {
        let start = attempt.previous().first().map(|u| u.origin());
        if start != Some(attempt.url().origin()) {
            attempt.stop()
        } else if attempt.previous().len() > MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else {
            attempt.follow()
        }
    })
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout_ms: u64) -> Self {
        Self::build(user_agent, timeout_ms, false)
    }

    /// Same settings, but redirects are only followed within the origin of
    /// the request. A cross-origin redirect comes back as the 3xx response
    /// with its `location`.
    pub fn same_origin_redirects(&self) -> Self {
        Self::build(&self.user_agent, self.timeout_ms, true)
    }

    fn build(user_agent: &str, timeout_ms: u64, same_origin: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(redirect_policy(same_origin))
            .user_agent(user_agent)
            .build()
            .unwrap_or_default();

        let h1_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(redirect_policy(same_origin))
            .user_agent(user_agent)
            .http1_only()
            .build()
            .unwrap_or_default();

        Self {
            client,
            h1_client,
            user_agent: user_agent.to_string(),
            timeout_ms,
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// GET with query parameters.
    ///
    /// Falls back to HTTP/1.1 on protocol errors (some CDNs reject HTTP/2).
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout_ms: u64,
    ) -> Result<HttpResponse, FetchError> {
        match self.get_inner(&self.client, url, query, timeout_ms).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                let err_str = e.to_string();
                if err_str.contains("http2")
                    || err_str.contains("protocol")
                    || err_str.contains("connection closed")
                {
                    tracing::debug!("retrying {url} over HTTP/1.1: {err_str}");
                    self.get_inner(&self.h1_client, url, query, timeout_ms)
                        .await
                        .map_err(FetchError::from)
                } else {
                    Err(FetchError::from(e))
                }
            }
        }
    }

    async fn get_inner(
        &self,
        client: &reqwest::Client,
        url: &str,
        query: &[(&str, String)],
        timeout_ms: u64,
    ) -> Result<HttpResponse, reqwest::Error> {
        let resp = client
            .get(url)
            .query(query)
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await?;
        Self::read(url, resp).await
    }

    /// POST a JSON body.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        timeout_ms: u64,
    ) -> Result<HttpResponse, FetchError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await?;
        Ok(Self::read(url, resp).await?)
    }

    async fn read(url: &str, r: reqwest::Response) -> Result<HttpResponse, reqwest::Error> {
        let status = r.status().as_u16();
        let final_url = r.url().to_string();
        let content_type = r
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let location = r
            .status()
            .is_redirection()
            .then(|| r.headers().get("location"))
            .flatten()
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = r.text().await?;

        Ok(HttpResponse {
            url: url.to_string(),
            final_url,
            status,
            content_type,
            location,
            body,
        })
    }
}
