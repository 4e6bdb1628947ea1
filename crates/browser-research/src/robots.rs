//! Crawl-permission gate backed by per-origin robots.txt rules.
//!
//! Rules are fetched once per origin and reused for `cache_ttl_seconds`.
//! A missing document (404/410) permits everything, 401/403 denies
//! everything, and any other failure falls back to the configured default
//! policy and marks the origin as degraded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::config::{RobotsConfig, RobotsPolicy};
use crate::http_client::HttpClient;
use crate::normalize::{is_web_url, origin_of};

/// Outcome of fetching a robots document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotsFetch {
    Found(String),
    /// 404 / 410.
    Missing,
    /// 401 / 403.
    Forbidden,
    Failed(String),
}

/// Source of robots documents.
#[async_trait]
pub trait RobotsFetcher: Send + Sync {
    async fn fetch_robots(&self, robots_url: &Url, timeout_ms: u64) -> RobotsFetch;
}

#[async_trait]
impl RobotsFetcher for HttpClient {
    async fn fetch_robots(&self, robots_url: &Url, timeout_ms: u64) -> RobotsFetch {
        match self.get(robots_url.as_str(), &[], timeout_ms).await {
            Ok(resp) => match resp.status {
                200..=299 => RobotsFetch::Found(resp.body),
                404 | 410 => RobotsFetch::Missing,
                401 | 403 => RobotsFetch::Forbidden,
                status => RobotsFetch::Failed(format!("HTTP {status}")),
            },
            Err(e) => RobotsFetch::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    allow: bool,
    pattern: String,
}

#[derive(Debug, Clone, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
}

/// Parsed robots.txt.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    groups: Vec<Group>,
}

impl RobotsRules {
    pub fn parse(body: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current: Option<Group> = None;
        let mut in_rules = false;

        for raw in body.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    if in_rules {
                        if let Some(g) = current.take() {
                            groups.push(g);
                        }
                        in_rules = false;
                    }
                    current
                        .get_or_insert_with(Group::default)
                        .agents
                        .push(value.to_ascii_lowercase());
                }
                "allow" | "disallow" => {
                    if let Some(g) = current.as_mut() {
                        g.rules.push(Rule {
                            allow: field == "allow",
                            pattern: value.to_string(),
                        });
                        in_rules = true;
                    }
                }
                _ => {}
            }
        }
        if let Some(g) = current {
            groups.push(g);
        }
        Self { groups }
    }

    /// Rules that apply to `user_agent`: the groups naming the longest
    /// matching product token, else the `*` groups.
    fn rules_for(&self, user_agent: &str) -> Vec<&Rule> {
        let ua = user_agent.to_ascii_lowercase();
        let best = self
            .groups
            .iter()
            .flat_map(|g| g.agents.iter())
            .filter(|a| a.as_str() != "*" && !a.is_empty() && ua.contains(a.as_str()))
            .max_by_key(|a| a.len())
            .cloned();

        let wanted = best.unwrap_or_else(|| "*".to_string());
        self.groups
            .iter()
            .filter(|g| g.agents.iter().any(|a| *a == wanted))
            .flat_map(|g| g.rules.iter())
            .collect()
    }

    /// Longest matching pattern wins; `Allow` wins ties; no match allows.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let mut best: Option<(usize, bool)> = None;
        for rule in self.rules_for(user_agent) {
            if rule.pattern.is_empty() || !pattern_matches(&rule.pattern, path) {
                continue;
            }
            let len = rule.pattern.len();
            best = match best {
                Some((best_len, best_allow))
                    if best_len > len || (best_len == len && best_allow) =>
                {
                    Some((best_len, best_allow))
                }
                _ => Some((len, rule.allow)),
            };
        }
        best.map(|(_, allow)| allow).unwrap_or(true)
    }
}

/// robots.txt path pattern: prefix match, `*` wildcard, trailing `$` anchor.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pat, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    let parts: Vec<&str> = pat.split('*').collect();
    let first = parts[0];
    if !path.starts_with(first) {
        return false;
    }
    let mut pos = first.len();
    if parts.len() == 1 {
        return !anchored || path.len() == pos;
    }
    for part in &parts[1..parts.len() - 1] {
        match path[pos..].find(part) {
            Some(i) => pos += i + part.len(),
            None => return false,
        }
    }
    let last = parts[parts.len() - 1];
    if anchored {
        path[pos..].ends_with(last)
    } else {
        path[pos..].contains(last)
    }
}

#[derive(Debug, Clone)]
enum RuleSet {
    Parsed(RobotsRules),
    AllowAll,
    DenyAll,
    Fallback(RobotsPolicy),
}

#[derive(Debug, Clone)]
struct CachedRules {
    rules: RuleSet,
    fetched_at: Instant,
}

/// Decision for one URL, with the reason a denial is reported under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotsDecision {
    pub allowed: bool,
    pub reason: String,
}

/// Robots exclusion gate with a TTL-bound per-origin rule cache.
pub struct RobotsGate {
    fetcher: Arc<dyn RobotsFetcher>,
    rules: DashMap<String, Arc<Mutex<Option<CachedRules>>>>,
    degraded: DashMap<String, String>,
    config: RobotsConfig,
    fetches: AtomicU64,
}

impl RobotsGate {
    pub fn new(fetcher: Arc<dyn RobotsFetcher>, config: RobotsConfig) -> Self {
        Self {
            fetcher,
            rules: DashMap::new(),
            degraded: DashMap::new(),
            config,
            fetches: AtomicU64::new(0),
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.config.user_agent
    }

    /// Whether `url`'s origin is listed in `exempt_origins`.
    pub fn is_exempt(&self, url: &Url) -> bool {
        let origin = origin_of(url);
        self.config.exempt_origins.iter().any(|o| *o == origin)
    }

    /// Whether `user_agent` may fetch `url`.
    pub async fn permits(&self, url: &Url, user_agent: &str) -> bool {
        self.decide(url, user_agent).await.allowed
    }

    /// Decision for `url` under the configured user agent.
    pub async fn check(&self, url: &Url) -> RobotsDecision {
        let ua = self.config.user_agent.clone();
        self.decide(url, &ua).await
    }

    async fn decide(&self, url: &Url, user_agent: &str) -> RobotsDecision {
        if !self.config.enabled {
            return RobotsDecision {
                allowed: true,
                reason: "robots checks disabled".into(),
            };
        }
        if !is_web_url(url) {
            return RobotsDecision {
                allowed: false,
                reason: format!("no robots.txt applies to {} urls", url.scheme()),
            };
        }
        let origin = origin_of(url);
        if self.is_exempt(url) {
            return RobotsDecision {
                allowed: true,
                reason: format!("{origin} is exempt"),
            };
        }

        let rules = self.rules_for_origin(&origin, url).await;
        let mut path = url.path().to_string();
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }

        match rules {
            RuleSet::Parsed(r) => {
                let allowed = r.is_allowed(user_agent, &path);
                RobotsDecision {
                    allowed,
                    reason: if allowed {
                        "allowed by robots.txt".into()
                    } else {
                        format!("robots.txt at {origin} disallows {path}")
                    },
                }
            }
            RuleSet::AllowAll => RobotsDecision {
                allowed: true,
                reason: "no robots.txt".into(),
            },
            RuleSet::DenyAll => RobotsDecision {
                allowed: false,
                reason: format!("robots.txt at {origin} is access-restricted"),
            },
            RuleSet::Fallback(policy) => RobotsDecision {
                allowed: policy == RobotsPolicy::Permit,
                reason: format!("robots.txt unavailable at {origin}, default policy {policy:?}"),
            },
        }
    }

    async fn rules_for_origin(&self, origin: &str, url: &Url) -> RuleSet {
        let slot = self
            .rules
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut guard = slot.lock().await;

        let ttl = Duration::from_secs(self.config.cache_ttl_seconds);
        if let Some(cached) = guard.as_ref() {
            if cached.fetched_at.elapsed() < ttl {
                return cached.rules.clone();
            }
        }

        let rules = self.fetch_rules(origin, url).await;
        *guard = Some(CachedRules {
            rules: rules.clone(),
            fetched_at: Instant::now(),
        });
        rules
    }

    async fn fetch_rules(&self, origin: &str, url: &Url) -> RuleSet {
        let mut robots_url = url.clone();
        robots_url.set_path("/robots.txt");
        robots_url.set_query(None);
        robots_url.set_fragment(None);

        self.fetches.fetch_add(1, Ordering::Relaxed);
        match self
            .fetcher
            .fetch_robots(&robots_url, self.config.fetch_timeout_ms)
            .await
        {
            RobotsFetch::Found(body) => {
                self.degraded.remove(origin);
                RuleSet::Parsed(RobotsRules::parse(&body))
            }
            RobotsFetch::Missing => {
                self.degraded.remove(origin);
                RuleSet::AllowAll
            }
            RobotsFetch::Forbidden => {
                self.degraded.remove(origin);
                RuleSet::DenyAll
            }
            RobotsFetch::Failed(reason) => {
                tracing::warn!(
                    "could not fetch robots.txt for {origin}: {reason}; applying {:?}",
                    self.config.default_policy
                );
                self.degraded.insert(origin.to_string(), reason);
                RuleSet::Fallback(self.config.default_policy)
            }
        }
    }

    /// Origins whose rules could not be fetched, with the failure reason.
    pub fn degraded_origins(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .degraded
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort();
        out
    }

    /// Number of robots documents requested so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Forget every cached rule set.
    pub fn clear_cache(&self) {
        self.rules.clear();
    }
}
