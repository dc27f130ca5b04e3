use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every component. Each variant is a kind with a
/// stable JSON-RPC code; layers wrap messages but never change the kind.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("tenancy mismatch: {0}")]
    TenancyMismatch(String),

    #[error("secret policy violation: {0}")]
    SecretPolicyViolation(String),

    #[error("invalid allowlist: {0}")]
    InvalidAllowlist(#[from] AllowlistError),

    #[error("context limit exceeded: {0}")]
    ContextLimitExceeded(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal: {0}")]
    Internal(String),
}

/// Allowlist load failures are fail-closed and must stay distinguishable
/// from ordinary scrubber failures.
#[derive(Debug, Error)]
pub enum AllowlistError {
    #[error("invalid TOML in {path}: {source}")]
    InvalidToml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid pattern {pattern:?} in {path}: {message}")]
    InvalidRegex {
        path: String,
        pattern: String,
        message: String,
    },
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }

    /// Prefix the message with `ctx` while preserving the kind.
    pub fn context(self, ctx: &str) -> Self {
        match self {
            Error::InvalidArgument(m) => Error::InvalidArgument(format!("{ctx}: {m}")),
            Error::NotFound(m) => Error::NotFound(format!("{ctx}: {m}")),
            Error::InvalidState(m) => Error::InvalidState(format!("{ctx}: {m}")),
            Error::TenancyMismatch(m) => Error::TenancyMismatch(format!("{ctx}: {m}")),
            Error::SecretPolicyViolation(m) => {
                Error::SecretPolicyViolation(format!("{ctx}: {m}"))
            }
            Error::ContextLimitExceeded(m) => Error::ContextLimitExceeded(format!("{ctx}: {m}")),
            Error::ResourceExhausted(m) => Error::ResourceExhausted(format!("{ctx}: {m}")),
            Error::Internal(m) => Error::Internal(format!("{ctx}: {m}")),
            other => other,
        }
    }

    /// Stable JSON-RPC error code for the MCP boundary.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::NotFound(_) => -32602,
            Error::ContextLimitExceeded(_) => -32001,
            Error::Cancelled => -32002,
            Error::InvalidState(_) => -32003,
            Error::ResourceExhausted(_) => -32005,
            Error::SecretPolicyViolation(_) | Error::InvalidAllowlist(_) => -32010,
            Error::TenancyMismatch(_) => -32020,
            Error::Internal(_) => -32603,
        }
    }

    /// The dispatcher retries idempotent reads at most once on these.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Internal(format!("http: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("json: {err}"))
    }
}
