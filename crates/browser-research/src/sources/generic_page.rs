//! Generic page adapter: loads an arbitrary URL through the browser engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::{load_gated, snippet_of, OriginGate, SourceAdapter};
use crate::browser::{extract::truncate_chars, BrowserEngine};
use crate::config::GenericPageConfig;
use crate::error::FetchError;
use crate::normalize::{is_web_url, normalize_url};
use crate::types::{Document, SourceKind, Task};

const SNIPPET_CHARS: usize = 300;

pub struct GenericPageAdapter {
    engine: Arc<dyn BrowserEngine>,
    redirects: Option<OriginGate>,
    timeout_ms: u64,
    max_chars: usize,
}

impl GenericPageAdapter {
    pub fn new(engine: Arc<dyn BrowserEngine>, config: &GenericPageConfig) -> Self {
        Self {
            engine,
            redirects: None,
            timeout_ms: config.timeout_ms,
            max_chars: config.max_content_chars,
        }
    }

    /// Follow redirects to other origins once `gate` admits them. Without
    /// one, a page that redirects off its origin fails permanently.
    pub fn with_redirect_gate(mut self, gate: OriginGate) -> Self {
        self.redirects = Some(gate);
        self
    }
}

#[async_trait]
impl SourceAdapter for GenericPageAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::GenericPage
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn gate_url(&self, task: &Task) -> Result<Url, FetchError> {
        let url = normalize_url(&task.target)
            .map_err(|e| FetchError::permanent(format!("invalid url {:?}: {e}", task.target)))?;
        if !is_web_url(&url) {
            return Err(FetchError::permanent(format!(
                "unsupported url scheme {:?} in {}",
                url.scheme(),
                task.target
            )));
        }
        Ok(url)
    }

    async fn fetch(&self, task: &Task) -> Result<Vec<Document>, FetchError> {
        let url = self.gate_url(task)?;
        let page = load_gated(
            self.engine.as_ref(),
            self.redirects.as_ref(),
            url.as_str(),
            self.timeout_ms,
        )
        .await?;
        if page.text.is_empty() {
            return Err(FetchError::permanent(format!(
                "no readable content at {}",
                page.url
            )));
        }
        let text = truncate_chars(&page.text, self.max_chars);
        Ok(vec![Document::new(page.title, page.url)
            .with_snippet(snippet_of(&text, SNIPPET_CHARS))
            .with_text(text)
            .with_meta("source", self.engine.name())])
    }
}
