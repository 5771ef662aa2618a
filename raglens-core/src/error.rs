//! Error types for the RAGLens evaluation engine.
//!
//! Uses `thiserror` for public API error types. Each concern (providers, the
//! judge, validation, persistence, configuration, runs) has its own enum, and
//! all of them nest under [`RaglensError`].
//!
//! Every error reports a stable [`kind`](RaglensError::kind) string so that
//! operators always see *which* failure happened, not just that one did.

/// Top-level error type for the RAGLens core library.
#[derive(Debug, thiserror::Error)]
pub enum RaglensError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Judge error: {0}")]
    Judge(#[from] JudgeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RaglensError {
    /// Machine-readable error kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provider(e) => e.kind(),
            Self::Judge(e) => e.kind(),
            Self::Validation(_) => "validation_error",
            Self::Store(_) => "store_error",
            Self::Config(_) => "config_error",
            Self::Run(RunError::Cancelled) => "cancelled",
            Self::Run(_) => "run_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Whether retrying the same unit of work may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::Judge(JudgeError::Provider(e)) => e.is_transient(),
            _ => false,
        }
    }
}

/// Errors from LLM providers and other network collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Unsupported provider: {name}")]
    UnsupportedProvider { name: String },
}

impl ProviderError {
    /// Network, rate-limit and server-side failures are transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::Connection { .. }
                | Self::ServerError { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        if self.is_transient() {
            "transient_provider_error"
        } else {
            "provider_error"
        }
    }
}

/// Errors from the response judge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JudgeError {
    /// The judge returned output that does not match the score schema.
    /// Triggers one stricter retry before being surfaced as [`JudgeError::Parsing`].
    #[error("Malformed judge output: {reason}")]
    MalformedOutput { reason: String, raw: String },

    /// The judge output could not be parsed even after the stricter retry.
    #[error("Judge output could not be parsed after retry: {reason}")]
    Parsing { reason: String, raw: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl JudgeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedOutput { .. } => "malformed_judge_output",
            Self::Parsing { .. } => "judge_parsing_error",
            Self::Provider(e) => e.kind(),
        }
    }

    /// The raw model text, when the failure was a schema violation.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            Self::MalformedOutput { raw, .. } | Self::Parsing { raw, .. } => Some(raw),
            Self::Provider(_) => None,
        }
    }
}

/// Errors caused by bad or missing input. Never retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("Field '{field}' must not be empty")]
    EmptyField { field: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ValidationError {
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    pub fn empty(field: impl Into<String>) -> Self {
        Self::EmptyField {
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {message}")]
    Backend { message: String },

    #[error("Stored data could not be decoded: {message}")]
    Corrupt { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },
}

/// Errors from the evaluation run lifecycle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunError {
    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Run {run_id} is not active")]
    NotActive { run_id: String },
}

/// A type alias for results using the top-level `RaglensError`.
pub type Result<T> = std::result::Result<T, RaglensError>;
