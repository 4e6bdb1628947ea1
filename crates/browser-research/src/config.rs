//! Orchestrator configuration: TOML file, then environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_USER_AGENT: &str =
    "BrowserResearch/0.1 (+https://agentralabs.tech/bot; for research purposes)";

const ENV_PREFIX: &str = "BROWSER_RESEARCH_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub robots: RobotsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_max_in_flight() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Per origin.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Token bucket capacity. Clamped to `1..=requests_per_minute`.
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Buckets idle for longer than this may be evicted.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_requests_per_minute() -> u32 {
    10
}
fn default_burst() -> u32 {
    1
}
fn default_stale_after_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: default_cache_ttl(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

fn default_true() -> bool {
    true
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_max_entries() -> usize {
    1000
}
fn default_sweep_interval() -> u64 {
    300
}

/// What the robots gate answers when the rules document cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotsPolicy {
    #[default]
    Permit,
    Deny,
}

impl std::str::FromStr for RobotsPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permit" | "allow" => Ok(Self::Permit),
            "deny" | "disallow" => Ok(Self::Deny),
            other => Err(format!("unknown robots policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub default_policy: RobotsPolicy,
    #[serde(default = "default_robots_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_robots_timeout")]
    pub fetch_timeout_ms: u64,
    /// Skip robots checks for encyclopedia and academic tasks, whose
    /// requests go to documented public query APIs rather than pages.
    /// Origins contacted under this are listed in the result.
    #[serde(default = "default_true")]
    pub api_exempt: bool,
    /// Further origins (`scheme://host[:port]`) never checked against
    /// robots.txt.
    #[serde(default)]
    pub exempt_origins: Vec<String>,
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_policy: RobotsPolicy::Permit,
            cache_ttl_seconds: default_robots_ttl(),
            user_agent: default_user_agent(),
            fetch_timeout_ms: default_robots_timeout(),
            api_exempt: true,
            exempt_origins: Vec::new(),
        }
    }
}

fn default_robots_ttl() -> u64 {
    3600
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_robots_timeout() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per task, first attempt included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Cancel the plan after this many seconds.
    #[serde(default)]
    pub plan_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub encyclopedia: EncyclopediaConfig,
    #[serde(default)]
    pub academic: AcademicConfig,
    #[serde(default)]
    pub generic_page: GenericPageConfig,
    /// Base URL of a remote knowledge-source server. When unset the
    /// built-in contexts are served locally.
    #[serde(default)]
    pub knowledge_base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchEngine {
    #[default]
    Duckduckgo,
    Google,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    #[serde(default)]
    pub engine: SearchEngine,
    #[serde(default = "default_ddg_url")]
    pub duckduckgo_url: String,
    #[serde(default = "default_google_url")]
    pub google_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Google Custom Search engine id.
    #[serde(default)]
    pub search_id: Option<String>,
    /// Fetch full page content for this many top hits.
    #[serde(default)]
    pub visit_top: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            engine: SearchEngine::Duckduckgo,
            duckduckgo_url: default_ddg_url(),
            google_url: default_google_url(),
            api_key: None,
            search_id: None,
            visit_top: 0,
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_ddg_url() -> String {
    "https://html.duckduckgo.com/html/".to_string()
}
fn default_google_url() -> String {
    "https://www.googleapis.com/customsearch/v1".to_string()
}
fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncyclopediaConfig {
    #[serde(default = "default_wiki_url")]
    pub api_url: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EncyclopediaConfig {
    fn default() -> Self {
        Self {
            api_url: default_wiki_url(),
            language: default_language(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_wiki_url() -> String {
    "https://en.wikipedia.org/w/api.php".to_string()
}
fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcademicConfig {
    #[serde(default = "default_arxiv_url")]
    pub api_url: String,
    #[serde(default = "default_max_per_query")]
    pub max_results_per_query: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AcademicConfig {
    fn default() -> Self {
        Self {
            api_url: default_arxiv_url(),
            max_results_per_query: default_max_per_query(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_arxiv_url() -> String {
    "https://export.arxiv.org/api/query".to_string()
}
fn default_max_per_query() -> usize {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserEngineKind {
    #[default]
    Http,
    Chromium,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericPageConfig {
    #[serde(default)]
    pub engine: BrowserEngineKind,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Characters of extracted text kept per page.
    #[serde(default = "default_max_chars")]
    pub max_content_chars: usize,
}

impl Default for GenericPageConfig {
    fn default() -> Self {
        Self {
            engine: BrowserEngineKind::Http,
            timeout_ms: default_timeout_ms(),
            max_content_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    20_000
}

impl OrchestratorConfig {
    /// Load from a TOML file if it exists, apply environment overrides,
    /// then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let parsed = Self::from_toml_str(&raw)?;
            tracing::info!("loaded configuration from {}", path.display());
            parsed
        } else {
            tracing::warn!(
                "configuration file {} not found, using defaults",
                path.display()
            );
            Self::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `BROWSER_RESEARCH_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(v) = get("MAX_IN_FLIGHT") {
            self.concurrency.max_in_flight = parse_env("MAX_IN_FLIGHT", &v)?;
        }
        if let Some(v) = get("REQUESTS_PER_MINUTE") {
            self.rate_limit.requests_per_minute = parse_env("REQUESTS_PER_MINUTE", &v)?;
        }
        if let Some(v) = get("CACHE_TTL_SECS") {
            self.cache.ttl_seconds = parse_env("CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = get("CACHE_ENABLED") {
            self.cache.enabled = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y"
            );
        }
        if let Some(v) = get("ROBOTS_POLICY") {
            self.robots.default_policy = v.parse().map_err(ConfigError::Invalid)?;
        }
        if let Some(v) = get("ROBOTS_API_EXEMPT") {
            self.robots.api_exempt = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y"
            );
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("SEARCH_API_KEY") {
            self.sources.web_search.api_key = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "concurrency.max_in_flight must be at least 1".into(),
            ));
        }
        if self.rate_limit.requests_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.requests_per_minute must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be at least 1 when the cache is enabled".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{ENV_PREFIX}{name}: cannot parse {value:?}")))
}
