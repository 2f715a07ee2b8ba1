use thiserror::Error;

/// Tier a quota check was evaluated against, for structured error payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Pro => write!(f, "pro"),
            Tier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Crate-wide error taxonomy. Library operations return `Result<T, CoreError>`;
/// `anyhow` is reserved for process-level glue that cannot act on a specific variant.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found")]
    NotFound,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("quota exceeded: tier={tier} limit={limit_name} value={limit_value} current={current_value}")]
    QuotaExceeded {
        tier: Tier,
        limit_name: &'static str,
        limit_value: i64,
        current_value: i64,
    },

    #[error("external dependency error: {0}")]
    ExternalDependencyError(String),

    #[error(transparent)]
    Repository(#[from] sqlx::Error),
}

impl CoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        CoreError::InvalidInput(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        CoreError::ExternalDependencyError(msg.into())
    }
}

/// `ConflictIdempotent` is not an error: it is a documented, successful no-op
/// result for operations covered by the IDM-* invariants. Modeling it as an
/// `Ok` variant rather than an `Err` means a caller cannot treat it as failure
/// by accident.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Applied(T),
    ConflictIdempotent(T),
}

impl<T> Outcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            Outcome::Applied(v) => v,
            Outcome::ConflictIdempotent(v) => v,
        }
    }

    pub fn is_idempotent_noop(&self) -> bool {
        matches!(self, Outcome::ConflictIdempotent(_))
    }
}
