//! Source adapters: one per [`SourceKind`], behind a single capability.
//!
//! Adapters never see the cache or the retry budget. They turn a task into
//! documents, or into a [`FetchError`] the scheduler classifies.

pub mod academic;
pub mod encyclopedia;
pub mod generic_page;
pub mod web_search;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::browser::{self, BrowserEngine, PageContent};
use crate::config::OrchestratorConfig;
use crate::error::{FetchError, KnowledgeError, NavigationError};
use crate::http_client::HttpClient;
use crate::knowledge::remote::RemoteKnowledgeClient;
use crate::knowledge::{KnowledgeHub, KnowledgeSource};
use crate::normalize::{is_web_url, origin_of};
use crate::rate_limiter::RateLimiter;
use crate::robots::RobotsGate;
use crate::types::{Document, SourceKind, Task};

/// Retrieval capability for one source kind.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Upper bound for one `fetch` call.
    fn timeout(&self) -> Duration;

    /// URL whose origin is robots-checked and rate-limited for `task`.
    fn gate_url(&self, task: &Task) -> Result<Url, FetchError>;

    /// Whether `gate_url` is a public query API rather than a page, so
    /// `robots.api_exempt` applies.
    fn api_endpoint(&self) -> bool {
        false
    }

    async fn fetch(&self, task: &Task) -> Result<Vec<Document>, FetchError>;
}

/// Adapters keyed by source kind.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, kind: SourceKind) -> Result<&Arc<dyn SourceAdapter>, FetchError> {
        self.adapters
            .get(&kind)
            .ok_or_else(|| FetchError::permanent(format!("unsupported source kind {kind}")))
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        SourceKind::ALL
            .iter()
            .copied()
            .filter(|k| self.adapters.contains_key(k))
            .collect()
    }

    /// The four production adapters wired from configuration.
    pub fn from_config(
        config: &OrchestratorConfig,
        http: HttpClient,
        robots: Arc<RobotsGate>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, KnowledgeError> {
        let knowledge: Arc<dyn KnowledgeSource> = match &config.sources.knowledge_base_url {
            Some(base) => Arc::new(RemoteKnowledgeClient::new(
                http.clone(),
                base,
                config.sources.encyclopedia.timeout_ms,
            )?),
            None => Arc::new(KnowledgeHub::with_defaults(http.clone(), &config.sources)),
        };
        let engine = browser::engine_for(&config.sources.generic_page, http.clone());
        let gate = OriginGate::new(robots, limiter);
        let visitor = PageVisitor::new(
            engine.clone(),
            gate.clone(),
            config.sources.generic_page.timeout_ms,
            config.sources.generic_page.max_content_chars,
        );

        Ok(Self::new()
            .with(Arc::new(web_search::WebSearchAdapter::new(
                http,
                config.sources.web_search.clone(),
                visitor,
            )))
            .with(Arc::new(encyclopedia::EncyclopediaAdapter::new(
                knowledge.clone(),
                &config.sources.encyclopedia,
            )))
            .with(Arc::new(academic::AcademicAdapter::new(
                knowledge,
                &config.sources.academic,
            )))
            .with(Arc::new(
                generic_page::GenericPageAdapter::new(engine, &config.sources.generic_page)
                    .with_redirect_gate(gate),
            )))
    }
}

/// Robots gate and rate limiter for origins an adapter reaches on its own,
/// outside the scheduler's admission of the task.
#[derive(Clone)]
pub struct OriginGate {
    robots: Arc<RobotsGate>,
    limiter: Arc<RateLimiter>,
}

impl OriginGate {
    pub fn new(robots: Arc<RobotsGate>, limiter: Arc<RateLimiter>) -> Self {
        Self { robots, limiter }
    }

    /// Wait for a rate-limit token for `url`'s origin, or return the reason
    /// robots refuses it.
    pub async fn admit(&self, url: &Url) -> Result<(), String> {
        if !is_web_url(url) {
            return Err(format!("unsupported url scheme {:?}", url.scheme()));
        }
        let decision = self.robots.check(url).await;
        if !decision.allowed {
            return Err(decision.reason);
        }
        self.limiter.acquire(&origin_of(url)).await;
        Ok(())
    }
}

/// Most cross-origin hops followed for one page.
const MAX_ORIGIN_HOPS: usize = 3;

/// Load `url`, following redirects to other origins only through `gate`.
/// Without a gate such a redirect is a permanent failure.
pub(crate) async fn load_gated(
    engine: &dyn BrowserEngine,
    gate: Option<&OriginGate>,
    url: &str,
    timeout_ms: u64,
) -> Result<PageContent, FetchError> {
    let mut target = url.to_string();
    for _ in 0..=MAX_ORIGIN_HOPS {
        let to = match browser::load_page(engine, &target, timeout_ms).await {
            Err(NavigationError::Redirected { to, .. }) => to,
            other => return Ok(other?),
        };
        let Some(gate) = gate else {
            return Err(FetchError::permanent(format!(
                "{target} redirects to another origin: {to}"
            )));
        };
        let next = Url::parse(&to)
            .map_err(|e| FetchError::permanent(format!("bad redirect target {to}: {e}")))?;
        gate.admit(&next)
            .await
            .map_err(|reason| FetchError::permanent(format!("redirect to {to} refused: {reason}")))?;
        tracing::debug!("following {target} to {to}");
        target = to;
    }
    Err(FetchError::permanent(format!(
        "{url} redirects across more than {MAX_ORIGIN_HOPS} origins"
    )))
}

/// Loads pages discovered inside an adapter (search hits), honouring
/// robots rules and per-origin rate limits like any scheduled task.
#[derive(Clone)]
pub struct PageVisitor {
    engine: Arc<dyn BrowserEngine>,
    gate: OriginGate,
    timeout_ms: u64,
    max_chars: usize,
}

impl PageVisitor {
    pub fn new(
        engine: Arc<dyn BrowserEngine>,
        gate: OriginGate,
        timeout_ms: u64,
        max_chars: usize,
    ) -> Self {
        Self {
            engine,
            gate,
            timeout_ms,
            max_chars,
        }
    }

    /// Page content, or `None` when robots denies it or loading fails.
    pub async fn visit(&self, url: &str) -> Option<PageContent> {
        let parsed = Url::parse(url).ok()?;
        if let Err(reason) = self.gate.admit(&parsed).await {
            tracing::debug!("skipping {url}: {reason}");
            return None;
        }
        match load_gated(self.engine.as_ref(), Some(&self.gate), url, self.timeout_ms).await {
            Ok(mut page) => {
                page.text = browser::extract::truncate_chars(&page.text, self.max_chars);
                Some(page)
            }
            Err(e) => {
                tracing::debug!("could not visit {url}: {e}");
                None
            }
        }
    }
}

/// First `n` characters, for snippets.
pub(crate) fn snippet_of(text: &str, n: usize) -> String {
    browser::extract::truncate_chars(text, n)
}

/// Parse an endpoint URL from configuration.
pub(crate) fn endpoint(raw: &str, what: &str) -> Result<Url, FetchError> {
    Url::parse(raw).map_err(|e| FetchError::permanent(format!("bad {what} url {raw}: {e}")))
}
