//! The taxonomy callers must be able to branch on, plus the catch-all
//! `AnyError` used for ambient/infrastructure failures.

pub(crate) type AnyError = anyhow::Error;

/// Domain errors every C1-C9 operation returns when a caller needs to
/// distinguish the failure kind, not just log it. `http_status` gives
/// collaborators the mapping without duplicating a match statement at
/// every call site.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("no ACTIVE server satisfies the requested capacity")]
    CapacityUnsatisfiable,

    #[error("no ACTIVE server in the requested region")]
    RegionUnsatisfiable,

    #[error("live scale would overflow the current server's capacity")]
    SameServerCapacity,

    #[error("reservation conflict, retries exhausted")]
    PlacementConflict,

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("operation not legal from current state: {reason}")]
    InvalidState { reason: String },

    #[error("server '{server_id}' still has active workspaces")]
    HasActiveWorkspaces { server_id: String },

    #[error("upstream host unreachable: {detail}")]
    UpstreamUnreachable { detail: String },

    #[error("upstream host timed out")]
    UpstreamTimeout,

    #[error("local pod '{pod_id}' is not connected")]
    PodNotConnected { pod_id: String },

    #[error("local pod '{pod_id}' timed out waiting for a reply")]
    PodTimeout { pod_id: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode as S;
        match self {
            CoreError::NotFound { .. } => S::NOT_FOUND,
            CoreError::CapacityUnsatisfiable
            | CoreError::RegionUnsatisfiable
            | CoreError::SameServerCapacity
            | CoreError::PlacementConflict
            | CoreError::InvalidState { .. } => S::BAD_REQUEST,
            CoreError::AlreadyExists { .. } | CoreError::HasActiveWorkspaces { .. } => S::CONFLICT,
            CoreError::UpstreamUnreachable { .. } | CoreError::PodNotConnected { .. } => {
                S::SERVICE_UNAVAILABLE
            }
            CoreError::UpstreamTimeout | CoreError::PodTimeout { .. } => S::GATEWAY_TIMEOUT,
            CoreError::Internal(_) => S::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may usefully retry without changing inputs.
    /// Transient kinds are already retried internally with bounded
    /// backoff before they reach here; this exists for completeness at
    /// the HTTP boundary.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::PlacementConflict | CoreError::UpstreamTimeout
        )
    }
}
