use ulid::Ulid;

/// Caller-facing error classes. Cross-tenant references are reported as
/// `NotFound`, exactly like missing ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("conflict with allocation: {0}")]
    Conflict(Ulid),
    #[error("capacity {0} exceeded: all slots occupied")]
    CapacityExceeded(u32),
    #[error("intent {0} was cancelled and cannot be reserved")]
    IntentVoided(Ulid),
    #[error("allocation {id} is {status}, expected PENDING")]
    InvalidState { id: Ulid, status: &'static str },
    #[error("cycle detected at resource: {0}")]
    CycleDetected(Ulid),
    #[error("cannot delete resource {0}: has children")]
    HasChildren(Ulid),
    #[error("permission denied: {0}")]
    Forbidden(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Invalid(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::Conflict(_)
            | EngineError::CapacityExceeded(_)
            | EngineError::IntentVoided(_)
            | EngineError::InvalidState { .. }
            | EngineError::CycleDetected(_)
            | EngineError::HasChildren(_) => ErrorKind::Conflict,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}
