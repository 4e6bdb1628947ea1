//! Chromium engine using chromiumoxide. The browser is launched on first use.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use super::extract::{clean_text, extract_main_content};
use super::{BrowserEngine, BrowserPage, NavigationResult};
use crate::error::NavigationError;

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. BROWSER_RESEARCH_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("BROWSER_RESEARCH_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.browser-research/chromium/
    if let Some(home) = dirs::home_dir() {
        let base = home.join(".browser-research/chromium");
        let candidates = if cfg!(target_os = "macos") {
            vec![
                base.join("chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                base.join("chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
            ]
        } else {
            vec![base.join("chrome-linux64/chrome"), base.join("chrome")]
        };
        if let Some(found) = candidates.into_iter().find(|c| c.exists()) {
            return Some(found);
        }
    }

    // 3. System PATH
    ["google-chrome", "chromium", "chromium-browser"]
        .iter()
        .find_map(|bin| which::which(bin).ok())
}

pub struct ChromiumBrowser {
    browser: OnceCell<Browser>,
}

impl ChromiumBrowser {
    pub fn new() -> Self {
        Self {
            browser: OnceCell::new(),
        }
    }

    async fn launch() -> Result<Browser, NavigationError> {
        let chrome_path = find_chromium().ok_or_else(|| {
            NavigationError::Unavailable(
                "Chromium not found; set BROWSER_RESEARCH_CHROMIUM_PATH".into(),
            )
        })?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .build()
            .map_err(|e| NavigationError::Unavailable(format!("bad browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| NavigationError::Unavailable(format!("failed to launch Chromium: {e}")))?;

        tokio::spawn(async move { while handler.next().await.is_some() {} });
        tracing::info!("launched headless Chromium");
        Ok(browser)
    }
}

impl Default for ChromiumBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserEngine for ChromiumBrowser {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>, NavigationError> {
        let browser = self.browser.get_or_try_init(Self::launch).await?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| NavigationError::Unavailable(format!("failed to open page: {e}")))?;
        Ok(Box::new(ChromiumPage { page }))
    }

    fn name(&self) -> &'static str {
        "chromium"
    }
}

pub struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    async fn eval_string(&self, script: &str) -> Result<String, NavigationError> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| NavigationError::Extraction(e.to_string()))?
            .into_value::<String>()
            .map_err(|e| NavigationError::Extraction(format!("{e:?}")))
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn navigate(
        &mut self,
        url: &str,
        timeout_ms: u64,
    ) -> Result<NavigationResult, NavigationError> {
        let start = Instant::now();
        tokio::time::timeout(Duration::from_millis(timeout_ms), self.page.goto(url))
            .await
            .map_err(|_| NavigationError::Timeout(timeout_ms))?
            .map_err(|e| NavigationError::Network(e.to_string()))?;

        let final_url = self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .map(|u| u.to_string())
            .unwrap_or_else(|| url.to_string());

        Ok(NavigationResult {
            final_url,
            // chromiumoxide does not expose the document status
            status: 200,
            load_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn wait_for_load(&mut self, timeout_ms: u64) -> Result<(), NavigationError> {
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.page.wait_for_navigation(),
        )
        .await
        .map_err(|_| NavigationError::Timeout(timeout_ms))?
        .map_err(|e| NavigationError::Network(e.to_string()))?;
        Ok(())
    }

    async fn page_title(&self) -> Result<String, NavigationError> {
        Ok(clean_text(&self.eval_string("document.title").await?))
    }

    async fn extract_main_content(&self) -> Result<String, NavigationError> {
        let html = self
            .eval_string("document.documentElement.outerHTML")
            .await?;
        Ok(extract_main_content(&html))
    }

    async fn close(self: Box<Self>) {
        let _ = self.page.close().await;
    }
}
