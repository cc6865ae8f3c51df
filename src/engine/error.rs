use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-range input.
    Validation(String),
    /// No accepted relationship, wrong owner, or view-only restriction.
    Unauthorized(String),
    NotFound(Ulid),
    /// Slot no longer open, overlapping appointment, or stale version.
    Conflict(String),
    LimitExceeded(&'static str),
    /// An external collaborator (relationship gate, purchase ledger) failed.
    Collaborator(String),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Unauthorized(msg) => write!(f, "not authorized: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Collaborator(msg) => write!(f, "collaborator error: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
