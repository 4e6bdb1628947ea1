//! Scheduler integration tests with scripted adapters.
//!
//! Every test runs on paused tokio time, so rate-limit waits, backoff and
//! plan deadlines advance instantly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use browser_research::config::RobotsPolicy;
use browser_research::*;

// ─────────────────────── helpers ───────────────────────

/// Adapter that replays a script of outcomes, then succeeds.
struct Scripted {
    kind: SourceKind,
    host: String,
    script: Mutex<VecDeque<Result<Vec<Document>, FetchError>>>,
    delay: Duration,
    timeout: Duration,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    panics: bool,
    api: bool,
}

impl Scripted {
    fn new(kind: SourceKind, host: &str) -> Self {
        Self {
            kind,
            host: host.to_string(),
            script: Mutex::new(VecDeque::new()),
            delay: Duration::from_millis(10),
            timeout: Duration::from_secs(30),
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            panics: false,
            api: false,
        }
    }

    fn then(self, outcome: Result<Vec<Document>, FetchError>) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    fn failing_transiently(self, times: usize) -> Self {
        (0..times).fold(self, |s, i| {
            s.then(Err(FetchError::transient(format!("connection reset #{i}"))))
        })
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    fn as_api(mut self) -> Self {
        self.api = true;
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for Scripted {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn gate_url(&self, task: &Task) -> Result<Url, FetchError> {
        Url::parse(&format!("https://{}/search?q={}", self.host, task.target))
            .map_err(|e| FetchError::permanent(e.to_string()))
    }

    fn api_endpoint(&self) -> bool {
        self.api
    }

    async fn fetch(&self, task: &Task) -> Result<Vec<Document>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.panics {
            panic!("scripted adapter panic");
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(vec![Document::new(
                format!("{} result", task.target),
                format!("https://{}/doc/{}", self.host, task.id),
            )
            .with_text(format!("about {}", task.target))])
        })
    }
}

/// Robots documents by origin; anything unlisted has no robots.txt.
#[derive(Default)]
struct ScriptedRobots {
    documents: HashMap<String, RobotsFetch>,
}

impl ScriptedRobots {
    fn with(mut self, origin: &str, fetch: RobotsFetch) -> Self {
        self.documents.insert(origin.to_string(), fetch);
        self
    }
}

#[async_trait]
impl RobotsFetcher for ScriptedRobots {
    async fn fetch_robots(&self, origin: &Url, _timeout_ms: u64) -> RobotsFetch {
        let key = origin.origin().ascii_serialization();
        self.documents
            .get(&key)
            .cloned()
            .unwrap_or(RobotsFetch::Missing)
    }
}

/// Unusable cache: every operation fails.
struct BrokenCache;

impl TaskCache for BrokenCache {
    fn get(&self, _key: &CacheKey) -> Result<Option<TaskResult>, CacheError> {
        Err(CacheError::Unavailable("disk gone".into()))
    }
    fn put(&self, _key: CacheKey, _value: TaskResult, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("disk gone".into()))
    }
    fn sweep_expired(&self) -> Result<usize, CacheError> {
        Err(CacheError::Unavailable("disk gone".into()))
    }
    fn len(&self) -> usize {
        0
    }
}

fn config() -> OrchestratorConfig {
    let mut cfg = OrchestratorConfig::default();
    cfg.concurrency.max_in_flight = 2;
    cfg.rate_limit.requests_per_minute = 60;
    cfg.robots.default_policy = RobotsPolicy::Permit;
    cfg
}

fn build(
    cfg: OrchestratorConfig,
    robots: ScriptedRobots,
    adapters: Vec<Arc<Scripted>>,
) -> (Orchestrator, Arc<RateLimiter>) {
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limit));
    let gate = Arc::new(RobotsGate::new(Arc::new(robots), cfg.robots.clone()));
    let mut builder = Orchestrator::builder(cfg)
        .robots(gate)
        .rate_limiter(limiter.clone());
    for adapter in adapters {
        builder = builder.adapter(adapter);
    }
    (builder.build(), limiter)
}

fn drain(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

fn retry_delays(events: &[OrchestratorEvent], id: &str) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::RetryScheduled {
                task_id, delay_ms, ..
            } if task_id == id => Some(*delay_ms),
            _ => None,
        })
        .collect()
}

fn admissions(events: &[OrchestratorEvent]) -> Vec<(String, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::TaskAdmitted {
                task_id, attempt, ..
            } => Some((task_id.clone(), *attempt)),
            _ => None,
        })
        .collect()
}

fn three_source_plan() -> ResearchPlan {
    ResearchPlan::new(
        "how do transformers work",
        vec![
            Task::new("academic-1", SourceKind::Academic, "transformer architecture"),
            Task::new("encyclopedia-1", SourceKind::Encyclopedia, "transformer model"),
            Task::new("web_search-1", SourceKind::WebSearch, "transformers explained"),
        ],
        vec![
            SourceKind::WebSearch,
            SourceKind::Encyclopedia,
            SourceKind::Academic,
        ],
    )
}

// ─────────────────────── scenarios ───────────────────────

#[tokio::test(start_paused = true)]
async fn test_three_sources_all_succeed_web_first() {
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test"));
    let wiki = Arc::new(Scripted::new(SourceKind::Encyclopedia, "wiki.test"));
    let arxiv = Arc::new(Scripted::new(SourceKind::Academic, "arxiv.test"));
    let (orch, _) = build(
        config(),
        ScriptedRobots::default(),
        vec![web.clone(), wiki.clone(), arxiv.clone()],
    );
    let mut rx = orch.events().subscribe();

    let result = orch.execute(&three_source_plan()).await.unwrap();

    assert_eq!(result.stats.succeeded, 3);
    assert!(result.manifest.is_empty());
    assert!(!result.cancelled);
    assert_eq!((web.calls(), wiki.calls(), arxiv.calls()), (1, 1, 1));

    let admitted = admissions(&drain(&mut rx));
    assert_eq!(admitted[0].0, "web_search-1");
    assert_eq!(admitted[1].0, "encyclopedia-1");

    // Successes keep plan order.
    let ids: Vec<_> = result.results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["academic-1", "encyclopedia-1", "web_search-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_task_served_from_cache() {
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test"));
    let (orch, limiter) = build(config(), ScriptedRobots::default(), vec![web.clone()]);
    let plan = ResearchPlan::new(
        "q",
        vec![
            Task::new("first", SourceKind::WebSearch, "Rust ownership"),
            Task::new("second", SourceKind::WebSearch, "  rust   OWNERSHIP "),
        ],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();
    assert_eq!(web.calls(), 1);
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.result_for("first").unwrap().status, TaskStatus::Succeeded);
    let cached = result.result_for("second").unwrap();
    assert_eq!(cached.status, TaskStatus::Cached);
    assert_eq!(cached.documents, result.result_for("first").unwrap().documents);
    // The hit spent no rate-limit token.
    assert_eq!(limiter.grants(), 1);

    // A later plan inside the TTL is served from cache too.
    let again = orch
        .execute(&ResearchPlan::new(
            "q",
            vec![Task::new("third", SourceKind::WebSearch, "rust ownership")],
            vec![],
        ))
        .await
        .unwrap();
    assert_eq!(again.results[0].status, TaskStatus::Cached);
    assert_eq!(web.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_expires_after_ttl() {
    let mut cfg = config();
    cfg.cache.ttl_seconds = 60;
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test"));
    let (orch, _) = build(cfg, ScriptedRobots::default(), vec![web.clone()]);
    let plan = ResearchPlan::new("q", vec![Task::new("t", SourceKind::WebSearch, "x")], vec![]);

    orch.execute(&plan).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    let result = orch.execute(&plan).await.unwrap();

    assert_eq!(result.results[0].status, TaskStatus::Succeeded);
    assert_eq!(web.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_robots_denial_skips_adapter_and_limiter() {
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test"));
    let wiki = Arc::new(Scripted::new(SourceKind::Encyclopedia, "wiki.test"));
    let robots = ScriptedRobots::default().with(
        "https://wiki.test",
        RobotsFetch::Found("User-agent: *\nDisallow: /search\n".into()),
    );
    let (orch, limiter) = build(config(), robots, vec![web.clone(), wiki.clone()]);
    let mut rx = orch.events().subscribe();
    let plan = ResearchPlan::new(
        "q",
        vec![
            Task::new("w", SourceKind::WebSearch, "a"),
            Task::new("e", SourceKind::Encyclopedia, "a"),
        ],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();

    let denied = result.manifest_entry("e").unwrap();
    assert_eq!(denied.status, TaskStatus::Denied);
    assert!(denied.reason.contains("robots"), "reason: {}", denied.reason);
    assert_eq!(wiki.calls(), 0);
    assert_eq!(limiter.grants(), 1);
    assert!(limiter.available_tokens("https://wiki.test").is_none());

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::TaskDenied { task_id, .. } if task_id == "e")));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success() {
    let mut cfg = config();
    cfg.retry.max_attempts = 3;
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test").failing_transiently(2));
    let (orch, _) = build(cfg, ScriptedRobots::default(), vec![web.clone()]);
    let mut rx = orch.events().subscribe();
    let plan = ResearchPlan::new("q", vec![Task::new("t", SourceKind::WebSearch, "x")], vec![]);

    let result = orch.execute(&plan).await.unwrap();

    let r = result.result_for("t").unwrap();
    assert_eq!(r.status, TaskStatus::Succeeded);
    assert_eq!(r.attempts, 3);
    assert_eq!(web.calls(), 3);
    let events = drain(&mut rx);
    assert_eq!(retry_delays(&events, "t"), vec![500, 1000]);
    assert_eq!(
        admissions(&events),
        vec![("t".to_string(), 1), ("t".to_string(), 2), ("t".to_string(), 3)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    let mut cfg = config();
    cfg.retry.max_attempts = 4;
    cfg.retry.base_delay_ms = 1000;
    cfg.retry.max_delay_ms = 3000;
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test").failing_transiently(10));
    let (orch, _) = build(cfg, ScriptedRobots::default(), vec![web.clone()]);
    let mut rx = orch.events().subscribe();
    let plan = ResearchPlan::new("q", vec![Task::new("t", SourceKind::WebSearch, "x")], vec![]);

    let result = orch.execute(&plan).await.unwrap();

    let entry = result.manifest_entry("t").unwrap();
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.attempts, 4);
    assert!(entry.reason.contains("connection reset #3"));
    assert_eq!(web.calls(), 4);
    assert_eq!(retry_delays(&drain(&mut rx), "t"), vec![1000, 2000, 3000]);
}

#[tokio::test(start_paused = true)]
async fn test_task_budget_overrides_config() {
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test").failing_transiently(5));
    let (orch, _) = build(config(), ScriptedRobots::default(), vec![web.clone()]);
    let plan = ResearchPlan::new(
        "q",
        vec![Task::new("t", SourceKind::WebSearch, "x").with_max_attempts(1)],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();
    assert_eq!(result.manifest_entry("t").unwrap().attempts, 1);
    assert_eq!(web.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_not_retried() {
    let web = Arc::new(
        Scripted::new(SourceKind::WebSearch, "search.test")
            .then(Err(FetchError::permanent("malformed query"))),
    );
    let (orch, _) = build(config(), ScriptedRobots::default(), vec![web.clone()]);
    let plan = ResearchPlan::new("q", vec![Task::new("t", SourceKind::WebSearch, "x")], vec![]);

    let result = orch.execute(&plan).await.unwrap();
    let entry = result.manifest_entry("t").unwrap();
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.attempts, 1);
    assert_eq!(web.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_keeps_successes() {
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test"));
    let wiki = Arc::new(
        Scripted::new(SourceKind::Encyclopedia, "wiki.test")
            .then(Err(FetchError::permanent("bad parameters"))),
    );
    let arxiv = Arc::new(Scripted::new(SourceKind::Academic, "arxiv.test"));
    let robots = ScriptedRobots::default().with("https://arxiv.test", RobotsFetch::Forbidden);
    let (orch, _) = build(
        config(),
        robots,
        vec![web.clone(), wiki.clone(), arxiv.clone()],
    );
    let plan = ResearchPlan::new(
        "q",
        vec![
            Task::new("w1", SourceKind::WebSearch, "a"),
            Task::new("e1", SourceKind::Encyclopedia, "a"),
            Task::new("a1", SourceKind::Academic, "a"),
            Task::new("w2", SourceKind::WebSearch, "b"),
        ],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();

    let ids: Vec<_> = result.results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["w1", "w2"]);
    let gaps: Vec<_> = result
        .manifest
        .iter()
        .map(|m| (m.task_id.as_str(), m.status))
        .collect();
    assert_eq!(gaps, vec![("e1", TaskStatus::Failed), ("a1", TaskStatus::Denied)]);
    assert_eq!(result.stats.total, 4);
    assert_eq!(result.handoff().gaps.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_bound_is_respected() {
    let mut cfg = config();
    cfg.concurrency.max_in_flight = 2;
    cfg.rate_limit.requests_per_minute = 6000;
    let web = Arc::new(
        Scripted::new(SourceKind::WebSearch, "search.test").with_delay(Duration::from_secs(1)),
    );
    let (orch, _) = build(cfg, ScriptedRobots::default(), vec![web.clone()]);
    let tasks = (0..6)
        .map(|i| Task::new(format!("t{i}"), SourceKind::WebSearch, format!("query {i}")))
        .collect();

    let result = orch
        .execute(&ResearchPlan::new("q", tasks, vec![]))
        .await
        .unwrap();

    assert_eq!(result.stats.succeeded, 6);
    assert_eq!(web.peak_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rolling_window_never_exceeds_rpm() {
    let mut cfg = config();
    cfg.concurrency.max_in_flight = 4;
    cfg.rate_limit.requests_per_minute = 3;
    cfg.rate_limit.burst = 3;
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test"));
    let (orch, _) = build(cfg, ScriptedRobots::default(), vec![web.clone()]);
    let tasks = (0..8)
        .map(|i| Task::new(format!("t{i}"), SourceKind::WebSearch, format!("query {i}")))
        .collect();

    orch.execute(&ResearchPlan::new("q", tasks, vec![]))
        .await
        .unwrap();

    let times = web.call_times.lock().unwrap().clone();
    assert_eq!(times.len(), 8);
    for (i, start) in times.iter().enumerate() {
        let in_window = times[i..]
            .iter()
            .filter(|t| t.duration_since(*start) < Duration::from_secs(60))
            .count();
        assert!(in_window <= 3, "{in_window} calls within 60s of call {i}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_releases_worker_slot() {
    let mut cfg = config();
    cfg.concurrency.max_in_flight = 1;
    cfg.retry.base_delay_ms = 10_000;
    cfg.retry.max_delay_ms = 10_000;
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test").failing_transiently(1));
    let wiki = Arc::new(Scripted::new(SourceKind::Encyclopedia, "wiki.test"));
    let (orch, _) = build(cfg, ScriptedRobots::default(), vec![web.clone(), wiki.clone()]);
    let mut rx = orch.events().subscribe();
    let plan = ResearchPlan::new(
        "q",
        vec![
            Task::new("w", SourceKind::WebSearch, "x"),
            Task::new("e", SourceKind::Encyclopedia, "x"),
        ],
        vec![SourceKind::WebSearch, SourceKind::Encyclopedia],
    );

    let result = orch.execute(&plan).await.unwrap();
    assert_eq!(result.stats.succeeded, 2);

    let order: Vec<_> = admissions(&drain(&mut rx));
    assert_eq!(
        order,
        vec![
            ("w".to_string(), 1),
            ("e".to_string(), 1),
            ("w".to_string(), 2)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_adapter_timeout_is_transient() {
    let mut cfg = config();
    cfg.retry.max_attempts = 2;
    let web = Arc::new(
        Scripted::new(SourceKind::WebSearch, "search.test")
            .with_delay(Duration::from_secs(60))
            .with_timeout(Duration::from_secs(5)),
    );
    let (orch, _) = build(cfg, ScriptedRobots::default(), vec![web.clone()]);
    let plan = ResearchPlan::new("q", vec![Task::new("t", SourceKind::WebSearch, "x")], vec![]);

    let result = orch.execute(&plan).await.unwrap();
    let entry = result.manifest_entry("t").unwrap();
    assert_eq!(entry.attempts, 2);
    assert!(entry.reason.contains("timed out"), "reason: {}", entry.reason);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_adapter_fails_only_its_task() {
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test").panicking());
    let wiki = Arc::new(Scripted::new(SourceKind::Encyclopedia, "wiki.test"));
    let (orch, _) = build(config(), ScriptedRobots::default(), vec![web.clone(), wiki]);
    let plan = ResearchPlan::new(
        "q",
        vec![
            Task::new("w", SourceKind::WebSearch, "x"),
            Task::new("e", SourceKind::Encyclopedia, "x"),
        ],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();
    let entry = result.manifest_entry("w").unwrap();
    assert_eq!(entry.status, TaskStatus::Failed);
    assert!(entry.reason.contains("panicked"));
    assert_eq!(web.calls(), 1);
    assert_eq!(result.result_for("e").unwrap().status, TaskStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_cache_falls_back_to_fetch() {
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test"));
    let cfg = config();
    let gate = Arc::new(RobotsGate::new(
        Arc::new(ScriptedRobots::default()),
        cfg.robots.clone(),
    ));
    let orch = Orchestrator::builder(cfg)
        .robots(gate)
        .cache(Arc::new(BrokenCache))
        .adapter(web.clone())
        .build();
    let plan = ResearchPlan::new(
        "q",
        vec![
            Task::new("a", SourceKind::WebSearch, "same"),
            Task::new("b", SourceKind::WebSearch, "same"),
        ],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();
    assert_eq!(result.stats.succeeded, 2);
    assert_eq!(web.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_plan_keeps_finished_results() {
    let mut cfg = config();
    cfg.concurrency.max_in_flight = 1;
    let fast = Arc::new(
        Scripted::new(SourceKind::WebSearch, "search.test").with_delay(Duration::from_secs(1)),
    );
    let slow = Arc::new(
        Scripted::new(SourceKind::Encyclopedia, "wiki.test")
            .with_delay(Duration::from_secs(600))
            .with_timeout(Duration::from_secs(900)),
    );
    let (orch, _) = build(cfg, ScriptedRobots::default(), vec![fast, slow.clone()]);
    let mut rx = orch.events().subscribe();
    let plan = ResearchPlan::new(
        "q",
        vec![
            Task::new("w", SourceKind::WebSearch, "x"),
            Task::new("e", SourceKind::Encyclopedia, "x"),
            Task::new("a", SourceKind::Encyclopedia, "y"),
        ],
        vec![],
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let result = orch.execute_with_cancel(&plan, cancel).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(result.cancelled);
    assert_eq!(result.result_for("w").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(result.manifest_entry("e").unwrap().status, TaskStatus::Cancelled);
    assert_eq!(result.manifest_entry("a").unwrap().status, TaskStatus::Cancelled);
    assert_eq!(slow.calls(), 1);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::PlanCancelled { unfinished: 2, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let mut cfg = config();
    cfg.retry.base_delay_ms = 10_000;
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test").failing_transiently(1));
    let (orch, _) = build(cfg, ScriptedRobots::default(), vec![web.clone()]);
    let plan = ResearchPlan::new("q", vec![Task::new("t", SourceKind::WebSearch, "x")], vec![]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });
    let result = orch.execute_with_cancel(&plan, cancel).await.unwrap();

    let entry = result.manifest_entry("t").unwrap();
    assert_eq!(entry.status, TaskStatus::Cancelled);
    assert_eq!(entry.attempts, 1);
    assert_eq!(web.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_plan_timeout_cancels_remaining_tasks() {
    let mut cfg = config();
    cfg.execution.plan_timeout_secs = Some(5);
    let web = Arc::new(
        Scripted::new(SourceKind::WebSearch, "search.test")
            .with_delay(Duration::from_secs(120))
            .with_timeout(Duration::from_secs(300)),
    );
    let (orch, _) = build(cfg, ScriptedRobots::default(), vec![web]);
    let mut rx = orch.events().subscribe();
    let plan = ResearchPlan::new("q", vec![Task::new("t", SourceKind::WebSearch, "x")], vec![]);

    let result = orch.execute(&plan).await.unwrap();

    assert!(result.cancelled);
    assert_eq!(result.stats.cancelled, 1);
    let reason = drain(&mut rx).into_iter().find_map(|e| match e {
        OrchestratorEvent::PlanCancelled { reason, .. } => Some(reason),
        _ => None,
    });
    assert!(reason.unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_degraded_robots_origin_is_reported() {
    let mut cfg = config();
    cfg.robots.default_policy = RobotsPolicy::Deny;
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "search.test"));
    let robots = ScriptedRobots::default().with(
        "https://search.test",
        RobotsFetch::Failed("HTTP 503".into()),
    );
    let (orch, _) = build(cfg, robots, vec![web.clone()]);
    let plan = ResearchPlan::new("q", vec![Task::new("t", SourceKind::WebSearch, "x")], vec![]);

    let result = orch.execute(&plan).await.unwrap();

    assert_eq!(result.manifest_entry("t").unwrap().status, TaskStatus::Denied);
    assert_eq!(web.calls(), 0);
    assert_eq!(result.degraded_origins.len(), 1);
    assert_eq!(result.degraded_origins[0].origin, "https://search.test");
}

#[tokio::test(start_paused = true)]
async fn test_degraded_origins_are_scoped_to_the_plan() {
    let flaky = Arc::new(Scripted::new(SourceKind::WebSearch, "flaky.test"));
    let good = Arc::new(Scripted::new(SourceKind::Encyclopedia, "good.test"));
    let robots = ScriptedRobots::default().with(
        "https://flaky.test",
        RobotsFetch::Failed("HTTP 503".into()),
    );
    let (orch, _) = build(config(), robots, vec![flaky.clone(), good.clone()]);

    let first = ResearchPlan::new("q", vec![Task::new("a", SourceKind::WebSearch, "x")], vec![]);
    let result = orch.execute(&first).await.unwrap();
    assert_eq!(result.degraded_origins.len(), 1);
    assert_eq!(result.degraded_origins[0].origin, "https://flaky.test");

    // The gate still remembers flaky.test, but this plan never went there.
    let second = ResearchPlan::new("q", vec![Task::new("b", SourceKind::Encyclopedia, "y")], vec![]);
    let result = orch.execute(&second).await.unwrap();
    assert_eq!(result.results[0].status, TaskStatus::Succeeded);
    assert!(result.degraded_origins.is_empty());
    assert_eq!(orch.robots().degraded_origins().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_api_endpoints_skip_robots_and_are_listed() {
    let api = Arc::new(Scripted::new(SourceKind::Academic, "api.test").as_api());
    let web = Arc::new(Scripted::new(SourceKind::WebSearch, "web.test"));
    let robots = || {
        ScriptedRobots::default()
            .with("https://api.test", RobotsFetch::Forbidden)
            .with("https://web.test", RobotsFetch::Missing)
    };
    let plan = ResearchPlan::new(
        "q",
        vec![
            Task::new("paper", SourceKind::Academic, "attention"),
            Task::new("web", SourceKind::WebSearch, "attention"),
        ],
        vec![],
    );

    let (orch, _) = build(config(), robots(), vec![api.clone(), web.clone()]);
    let result = orch.execute(&plan).await.unwrap();
    assert_eq!(result.result_for("paper").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(result.robots_exempt_origins, vec!["https://api.test".to_string()]);

    let mut cfg = config();
    cfg.robots.api_exempt = false;
    let (orch, _) = build(cfg, robots(), vec![api.clone(), web]);
    let result = orch.execute(&plan).await.unwrap();
    assert_eq!(result.manifest_entry("paper").unwrap().status, TaskStatus::Denied);
    assert!(result.robots_exempt_origins.is_empty());
    assert_eq!(api.calls(), 1);
}
