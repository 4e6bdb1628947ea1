//! Browser research orchestrator: concurrent, rate-limited, robots-aware
//! retrieval across web search, encyclopedia, academic and page sources.

pub mod aggregator;
pub mod browser;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod http_client;
pub mod knowledge;
pub mod normalize;
pub mod rate_limiter;
pub mod retry;
pub mod robots;
pub mod scheduler;
pub mod sources;
pub mod types;

pub use aggregator::{ManifestEntry, ResearchResult, SynthesisInput};
pub use cache::{CacheKey, ResultCache, TaskCache};
pub use config::OrchestratorConfig;
pub use error::{CacheError, FetchError, OrchestratorError};
pub use events::{EventBus, OrchestratorEvent};
pub use rate_limiter::RateLimiter;
pub use retry::{backoff_delay, RetryPolicy};
pub use robots::{RobotsFetch, RobotsFetcher, RobotsGate};
pub use scheduler::{Orchestrator, OrchestratorBuilder};
pub use sources::{AdapterSet, SourceAdapter};
pub use types::*;
