//! Plan executor.
//!
//! Every task walks robots gate, cache, rate limiter and adapter in that
//! order. Attempts run on a [`JoinSet`] capped at `max_in_flight`; a task
//! waiting out its backoff sits in a separate timer set and holds no
//! worker slot. Tasks that share a cache key are single-flighted: the
//! first one fetches, the rest are parked until it is terminal and then
//! re-checked against the cache.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::aggregator::{DegradedOrigin, ResearchResult};
use crate::cache::{spawn_sweeper, CacheKey, ResultCache, TaskCache};
use crate::config::OrchestratorConfig;
use crate::error::{FetchError, OrchestratorError};
use crate::events::{EventBus, OrchestratorEvent};
use crate::http_client::HttpClient;
use crate::normalize::origin_of;
use crate::rate_limiter::{spawn_evictor, RateLimiter};
use crate::retry::RetryPolicy;
use crate::robots::RobotsGate;
use crate::sources::{AdapterSet, SourceAdapter};
use crate::types::{Document, ResearchPlan, Task, TaskResult};

/// Runs research plans against a fixed set of collaborators.
pub struct Orchestrator {
    config: OrchestratorConfig,
    robots: Arc<RobotsGate>,
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<dyn TaskCache>>,
    adapters: AdapterSet,
    events: Arc<EventBus>,
    retry: RetryPolicy,
}

/// Assembles an [`Orchestrator`]; anything not supplied is built from the
/// configuration.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    robots: Option<Arc<RobotsGate>>,
    limiter: Option<Arc<RateLimiter>>,
    cache: Option<Option<Arc<dyn TaskCache>>>,
    adapters: AdapterSet,
    events: Option<Arc<EventBus>>,
}

impl OrchestratorBuilder {
    /// Use a shared robots gate instead of one over a fresh HTTP client.
    pub fn robots(mut self, robots: Arc<RobotsGate>) -> Self {
        self.robots = Some(robots);
        self
    }

    /// Use a shared limiter, e.g. one an adapter also draws from.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Use `cache` for results, even when `cache.enabled` is false.
    pub fn cache(mut self, cache: Arc<dyn TaskCache>) -> Self {
        self.cache = Some(Some(cache));
        self
    }

    /// Run every task against its adapter, whatever `cache.enabled` says.
    pub fn without_cache(mut self) -> Self {
        self.cache = Some(None);
        self
    }

    /// Register one adapter, replacing any other of its kind.
    pub fn adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.register(adapter);
        self
    }

    /// Replace every registered adapter with `adapters`.
    pub fn adapters(mut self, adapters: AdapterSet) -> Self {
        self.adapters = adapters;
        self
    }

    /// Publish events on an existing bus.
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Fill in the missing collaborators from the configuration.
    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let robots = self.robots.unwrap_or_else(|| {
            let http = HttpClient::new(&config.robots.user_agent, config.robots.fetch_timeout_ms);
            Arc::new(RobotsGate::new(Arc::new(http), config.robots.clone()))
        });
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::new(&config.rate_limit)));
        let cache = self.cache.unwrap_or_else(|| default_cache(&config));
        Orchestrator {
            retry: RetryPolicy::from_config(&config.retry),
            robots,
            limiter,
            cache,
            adapters: self.adapters,
            events: self.events.unwrap_or_default(),
            config,
        }
    }
}

fn default_cache(config: &OrchestratorConfig) -> Option<Arc<dyn TaskCache>> {
    config
        .cache
        .enabled
        .then(|| Arc::new(ResultCache::new(config.cache.max_entries)) as Arc<dyn TaskCache>)
}

impl Orchestrator {
    /// Start assembling an orchestrator with no adapters registered.
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            robots: None,
            limiter: None,
            cache: None,
            adapters: AdapterSet::new(),
            events: None,
        }
    }

    /// Production wiring: shared HTTP client, robots gate over HTTP, and
    /// the four configured source adapters.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let http = HttpClient::new(&config.robots.user_agent, config.robots.fetch_timeout_ms);
        let robots = Arc::new(RobotsGate::new(
            Arc::new(http.clone()),
            config.robots.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let adapters =
            AdapterSet::from_config(&config, http, robots.clone(), limiter.clone())
                .map_err(|e| OrchestratorError::Internal(format!("adapter setup: {e}")))?;
        Ok(Self::builder(config)
            .robots(robots)
            .rate_limiter(limiter)
            .adapters(adapters)
            .build())
    }

    /// The configuration this orchestrator was built from.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Event bus; subscribe before calling `execute`.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Robots gate shared by every plan.
    pub fn robots(&self) -> &Arc<RobotsGate> {
        &self.robots
    }

    /// Per-origin limiter shared by every plan.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Result cache, unless caching is off.
    pub fn cache(&self) -> Option<&Arc<dyn TaskCache>> {
        self.cache.as_ref()
    }

    /// Start the cache sweeper and the stale-bucket evictor. Both stop when
    /// `cancel` fires.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![spawn_evictor(
            self.limiter.clone(),
            Duration::from_secs(self.config.rate_limit.stale_after_secs),
            cancel.clone(),
        )];
        if let Some(cache) = &self.cache {
            handles.push(spawn_sweeper(
                cache.clone(),
                Duration::from_secs(self.config.cache.sweep_interval_secs),
                cancel,
            ));
        }
        handles
    }

    /// Run `plan` to completion.
    pub async fn execute(&self, plan: &ResearchPlan) -> Result<ResearchResult, OrchestratorError> {
        self.execute_with_cancel(plan, CancellationToken::new()).await
    }

    /// Run `plan` until every task is terminal or `cancel` fires. On
    /// cancellation (or plan timeout) unfinished tasks become `Cancelled`
    /// and the results gathered so far are still returned.
    pub async fn execute_with_cancel(
        &self,
        plan: &ResearchPlan,
        cancel: CancellationToken,
    ) -> Result<ResearchResult, OrchestratorError> {
        plan.validate()?;
        let started = Instant::now();
        tracing::info!(
            "executing plan for {:?}: {} task(s), max {} in flight",
            plan.query(),
            plan.len(),
            self.config.concurrency.max_in_flight
        );
        self.events.emit(OrchestratorEvent::PlanStarted {
            query: plan.query().to_string(),
            tasks: plan.len(),
        });

        let mut run = PlanRun::new(self, plan);
        let deadline = self
            .config
            .execution
            .plan_timeout_secs
            .map(Duration::from_secs);
        let timeout = async move {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let mut stop_reason = None;
        loop {
            run.dispatch();
            if run.running.is_empty() && run.backoff.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stop_reason = Some("plan cancelled".to_string());
                    break;
                }
                _ = &mut timeout => {
                    stop_reason = Some(format!(
                        "plan timed out after {}s",
                        deadline.map(|d| d.as_secs()).unwrap_or_default()
                    ));
                    break;
                }
                Some(joined) = run.running.join_next(), if !run.running.is_empty() => {
                    let (index, outcome) = joined.map_err(|e| {
                        OrchestratorError::Internal(format!("attempt task failed: {e}"))
                    })?;
                    run.complete(index, outcome, true);
                }
                Some(joined) = run.backoff.join_next(), if !run.backoff.is_empty() => {
                    let index = joined.map_err(|e| {
                        OrchestratorError::Internal(format!("backoff timer failed: {e}"))
                    })?;
                    run.requeue(index);
                }
            }
        }

        let cancelled = stop_reason.is_some();
        if let Some(reason) = stop_reason {
            run.cancel(&reason).await;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut touched = std::mem::take(&mut run.touched);
        let exempt = std::mem::take(&mut run.exempt);
        let mut result = ResearchResult::from_terminal(plan, run.into_terminal(), cancelled, elapsed_ms);
        // Pages reached inside adapters (search hits, redirects) show up as
        // document URLs.
        touched.extend(
            result
                .documents
                .iter()
                .filter_map(|d| Url::parse(&d.document.url).ok())
                .map(|u| origin_of(&u)),
        );
        result.degraded_origins = self
            .robots
            .degraded_origins()
            .into_iter()
            .filter(|(origin, _)| touched.contains(origin))
            .map(|(origin, reason)| DegradedOrigin { origin, reason })
            .collect();
        result.robots_exempt_origins = exempt.into_iter().collect();

        let stats = &result.stats;
        tracing::info!(
            "plan finished in {elapsed_ms}ms: {} succeeded, {} cached, {} failed, {} denied, {} cancelled",
            stats.succeeded,
            stats.cached,
            stats.failed,
            stats.denied,
            stats.cancelled
        );
        self.events.emit(OrchestratorEvent::PlanComplete {
            succeeded: stats.succeeded + stats.cached,
            failed: stats.failed,
            denied: stats.denied,
            cancelled: stats.cancelled,
            elapsed_ms,
        });
        Ok(result)
    }
}

/// What one pass through gate, cache and adapter produced.
#[derive(Debug)]
enum AttemptOutcome {
    Denied(String),
    Cached(TaskResult),
    Fetched(Result<Vec<Document>, FetchError>),
}

/// Queue order: plan rank of the source kind, then higher task priority,
/// then plan position.
type QueueKey = Reverse<(usize, Reverse<i32>, usize)>;

/// Mutable state of one `execute` call.
struct PlanRun<'a> {
    orch: &'a Orchestrator,
    plan: &'a ResearchPlan,
    ready: BinaryHeap<QueueKey>,
    running: JoinSet<(usize, AttemptOutcome)>,
    backoff: JoinSet<usize>,
    outcomes: Vec<Option<TaskResult>>,
    /// Adapter invocations per task.
    attempts: Vec<u32>,
    keys: Vec<CacheKey>,
    /// Task currently fetching (or backing off) for each key.
    leaders: HashMap<CacheKey, usize>,
    /// Tasks waiting for the leader of their key.
    parked: HashMap<CacheKey, Vec<usize>>,
    /// Gate origins admitted during this run.
    touched: HashSet<String>,
    /// Gate origins admitted without a robots check.
    exempt: BTreeSet<String>,
}

impl<'a> PlanRun<'a> {
    fn new(orch: &'a Orchestrator, plan: &'a ResearchPlan) -> Self {
        let tasks = plan.tasks();
        let mut run = Self {
            orch,
            plan,
            ready: BinaryHeap::with_capacity(tasks.len()),
            running: JoinSet::new(),
            backoff: JoinSet::new(),
            outcomes: vec![None; tasks.len()],
            attempts: vec![0; tasks.len()],
            keys: tasks.iter().map(CacheKey::for_task).collect(),
            leaders: HashMap::new(),
            parked: HashMap::new(),
            touched: HashSet::new(),
            exempt: BTreeSet::new(),
        };
        for index in 0..tasks.len() {
            run.requeue(index);
        }
        run
    }

    fn task(&self, index: usize) -> &'a Task {
        let plan: &'a ResearchPlan = self.plan;
        &plan.tasks()[index]
    }

    fn requeue(&mut self, index: usize) {
        let task = self.task(index);
        self.ready.push(Reverse((
            self.plan.rank(task.source_kind),
            Reverse(task.priority),
            index,
        )));
    }

    /// Fill free worker slots from the ready queue.
    fn dispatch(&mut self) {
        let max = self.orch.config.concurrency.max_in_flight.max(1);
        while self.running.len() < max {
            let Some(Reverse((_, _, index))) = self.ready.pop() else {
                break;
            };
            let key = self.keys[index].clone();
            match self.leaders.get(&key) {
                Some(&leader) if leader != index => {
                    tracing::debug!(
                        "task {} waits for {} (same cache key)",
                        self.task(index).id,
                        self.task(leader).id
                    );
                    self.parked.entry(key).or_default().push(index);
                    continue;
                }
                Some(_) => {}
                None => {
                    self.leaders.insert(key.clone(), index);
                }
            }

            let task = self.task(index);
            let prepared = self
                .orch
                .adapters
                .get(task.source_kind)
                .cloned()
                .and_then(|adapter| adapter.gate_url(task).map(|url| (adapter, url)));
            let (adapter, gate) = match prepared {
                Ok(p) => p,
                Err(e) => {
                    let attempts = self.attempts[index];
                    self.fail(index, e.to_string(), attempts);
                    continue;
                }
            };

            let origin = origin_of(&gate);
            let robots = &self.orch.config.robots;
            let api_exempt = robots.api_exempt && adapter.api_endpoint();
            if robots.enabled && (api_exempt || self.orch.robots.is_exempt(&gate)) {
                self.exempt.insert(origin.clone());
            }
            self.touched.insert(origin.clone());
            let attempt = self.attempts[index] + 1;
            tracing::debug!("admitting task {} (attempt {attempt}) for {origin}", task.id);
            self.orch.events.emit(OrchestratorEvent::TaskAdmitted {
                task_id: task.id.to_string(),
                origin,
                attempt,
            });

            let fut = run_attempt(
                self.orch.robots.clone(),
                self.orch.limiter.clone(),
                self.orch.cache.clone(),
                adapter,
                task.clone(),
                key,
                gate,
                !api_exempt,
            );
            self.running.spawn(async move {
                let outcome = AssertUnwindSafe(fut).catch_unwind().await.unwrap_or_else(|_| {
                    AttemptOutcome::Fetched(Err(FetchError::permanent("adapter panicked")))
                });
                (index, outcome)
            });
        }
    }

    /// Apply an attempt's outcome. With `may_retry` false, a retryable
    /// failure is left unrecorded so it ends up `Cancelled`.
    fn complete(&mut self, index: usize, outcome: AttemptOutcome, may_retry: bool) {
        let task = self.task(index);
        let id = task.id.to_string();
        match outcome {
            AttemptOutcome::Denied(reason) => {
                tracing::info!("task {id} denied: {reason}");
                self.orch.events.emit(OrchestratorEvent::TaskDenied {
                    task_id: id,
                    reason: reason.clone(),
                });
                self.finish(index, TaskResult::denied(task, reason));
            }
            AttemptOutcome::Cached(stored) => {
                tracing::debug!("task {id} served from cache");
                self.orch.events.emit(OrchestratorEvent::CacheHit { task_id: id });
                self.finish(index, TaskResult::cached(task, &stored));
            }
            AttemptOutcome::Fetched(Ok(documents)) => {
                self.attempts[index] += 1;
                let attempts = self.attempts[index];
                let result = TaskResult::succeeded(task, documents, attempts);
                if let Some(cache) = &self.orch.cache {
                    if let Err(e) =
                        cache.put(self.keys[index].clone(), result.clone(), self.orch.config.cache.ttl())
                    {
                        tracing::warn!("cache put for task {id} failed: {e}");
                    }
                }
                tracing::debug!(
                    "task {id} succeeded with {} document(s) after {attempts} attempt(s)",
                    result.documents.len()
                );
                self.orch.events.emit(OrchestratorEvent::TaskSucceeded {
                    task_id: id,
                    documents: result.documents.len(),
                    attempts,
                });
                self.finish(index, result);
            }
            AttemptOutcome::Fetched(Err(error)) => {
                self.attempts[index] += 1;
                let attempts = self.attempts[index];
                let budget = self.orch.retry.budget(task);
                if error.is_transient() && attempts < budget {
                    if !may_retry {
                        return;
                    }
                    let delay = self.orch.retry.delay(attempts - 1);
                    let delay_ms = delay.as_millis() as u64;
                    tracing::warn!(
                        "task {id} attempt {attempts}/{budget} failed: {error}; retrying in {delay_ms}ms"
                    );
                    self.orch.events.emit(OrchestratorEvent::RetryScheduled {
                        task_id: id,
                        attempt: attempts + 1,
                        delay_ms,
                        error: error.to_string(),
                    });
                    self.backoff.spawn(async move {
                        tokio::time::sleep(delay).await;
                        index
                    });
                } else {
                    self.fail(index, error.to_string(), attempts);
                }
            }
        }
    }

    fn fail(&mut self, index: usize, error: String, attempts: u32) {
        let task = self.task(index);
        tracing::warn!("task {} failed after {attempts} attempt(s): {error}", task.id);
        self.orch.events.emit(OrchestratorEvent::TaskFailed {
            task_id: task.id.to_string(),
            error: error.clone(),
            attempts,
        });
        self.finish(index, TaskResult::failed(task, error, attempts));
    }

    /// Record a terminal result and release the task's cache key.
    fn finish(&mut self, index: usize, result: TaskResult) {
        self.outcomes[index] = Some(result);
        let key = &self.keys[index];
        if self.leaders.get(key) == Some(&index) {
            self.leaders.remove(key);
            if let Some(waiting) = self.parked.remove(key) {
                for follower in waiting {
                    self.requeue(follower);
                }
            }
        }
    }

    /// Stop in-flight work, keep attempts that already finished, and mark
    /// everything else cancelled.
    async fn cancel(&mut self, reason: &str) {
        self.running.abort_all();
        self.backoff.abort_all();
        while let Some(joined) = self.running.join_next().await {
            if let Ok((index, outcome)) = joined {
                self.complete(index, outcome, false);
            }
        }
        while self.backoff.join_next().await.is_some() {}

        let mut unfinished = 0;
        for index in 0..self.outcomes.len() {
            if self.outcomes[index].is_none() {
                unfinished += 1;
                let task = self.task(index);
                self.outcomes[index] = Some(TaskResult::cancelled(task, self.attempts[index]));
            }
        }
        tracing::warn!("{reason}: {unfinished} task(s) cancelled");
        self.orch.events.emit(OrchestratorEvent::PlanCancelled {
            reason: reason.to_string(),
            unfinished,
        });
    }

    fn into_terminal(self) -> Vec<TaskResult> {
        let tasks = self.plan.tasks();
        self.outcomes
            .into_iter()
            .zip(tasks)
            .map(|(outcome, task)| outcome.unwrap_or_else(|| TaskResult::cancelled(task, 0)))
            .collect()
    }
}

/// One pass through robots gate, cache, rate limiter and adapter.
#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    robots: Arc<RobotsGate>,
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<dyn TaskCache>>,
    adapter: Arc<dyn SourceAdapter>,
    task: Task,
    key: CacheKey,
    gate: Url,
    check_robots: bool,
) -> AttemptOutcome {
    if check_robots {
        let decision = robots.check(&gate).await;
        if !decision.allowed {
            return AttemptOutcome::Denied(decision.reason);
        }
    }

    if let Some(cache) = &cache {
        match cache.get(&key) {
            Ok(Some(stored)) if stored.status.is_success() => return AttemptOutcome::Cached(stored),
            Ok(_) => {}
            Err(e) => tracing::warn!("cache lookup for task {} failed, fetching: {e}", task.id),
        }
    }

    limiter.acquire(&origin_of(&gate)).await;

    let timeout = adapter.timeout();
    let fetched = match tokio::time::timeout(timeout, adapter.fetch(&task)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::transient(format!(
            "{} adapter timed out after {}ms",
            task.source_kind,
            timeout.as_millis()
        ))),
    };
    AttemptOutcome::Fetched(fetched)
}
