//! Error types for every layer of the orchestrator.
//!
//! Task-level failures are values ([`FetchError`]) that the scheduler turns
//! into `Failed` results; only [`OrchestratorError`] can end an `execute`
//! call early.

/// Failure of a single adapter call, classified for the retry policy.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network, timeout or upstream overload. Retried within the budget.
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// Malformed request, unsupported source, unrecoverable parse failure.
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, context: &str) -> Self {
        if status == 429 || status == 408 || status >= 500 {
            Self::Transient(format!("{context}: HTTP {status}"))
        } else {
            Self::Permanent(format!("{context}: HTTP {status}"))
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        // Bad URL, unsupported scheme or redirect loop: resending cannot help.
        if e.is_builder() || e.is_redirect() {
            return Self::Permanent(e.to_string());
        }
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            return Self::Transient(e.to_string());
        }
        match e.status() {
            Some(status) => Self::from_status(status.as_u16(), "request failed"),
            None if e.is_decode() => Self::Permanent(format!("decode failed: {e}")),
            None => Self::Transient(e.to_string()),
        }
    }
}

/// Failures reported by the browser-navigation collaborator.
#[derive(thiserror::Error, Debug)]
pub enum NavigationError {
    #[error("navigation timed out after {0}ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("page returned HTTP {status}")]
    Status { status: u16 },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("browser not available: {0}")]
    Unavailable(String),

    #[error("no page loaded")]
    NoPage,

    #[error("content extraction failed: {0}")]
    Extraction(String),

    /// The page redirected to another origin, which must be gated on its own.
    #[error("redirected from {from} to another origin: {to}")]
    Redirected { from: String, to: String },
}

impl From<NavigationError> for FetchError {
    fn from(e: NavigationError) -> Self {
        match &e {
            NavigationError::Timeout(_) | NavigationError::Network(_) => {
                FetchError::Transient(e.to_string())
            }
            NavigationError::Status { status } => FetchError::from_status(*status, "navigation"),
            NavigationError::InvalidUrl(_)
            | NavigationError::Unavailable(_)
            | NavigationError::NoPage
            | NavigationError::Extraction(_)
            | NavigationError::Redirected { .. } => FetchError::Permanent(e.to_string()),
        }
    }
}

/// Knowledge-source protocol failures.
#[derive(thiserror::Error, Debug)]
pub enum KnowledgeError {
    #[error("unknown context: {0}")]
    UnknownContext(String),

    #[error("invalid parameters for {context}: {reason}")]
    InvalidParameters { context: String, reason: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl From<KnowledgeError> for FetchError {
    fn from(e: KnowledgeError) -> Self {
        match e {
            KnowledgeError::Fetch(inner) => inner,
            other => FetchError::Permanent(other.to_string()),
        }
    }
}

/// Any failure of a cache operation. Never fatal.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Configuration loading and validation errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors that abort a whole `execute` call.
#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("internal scheduler fault: {0}")]
    Internal(String),
}
