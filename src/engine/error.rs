/// Failure taxonomy for reservation operations. Every variant is a
/// synchronous rejection with a human-readable message; none of them
/// leaves the store mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    // request-malformed: rejected before any mutation
    InvalidTime(&'static str),
    MissingAccess,
    BadRequest(&'static str),
    InvalidName(String),
    DuplicateName(String),
    UnknownPartition(String),
    NoDefaultPartition,
    UnknownNode(String),
    UnknownAccount(String),
    InvalidLicenses(String),
    InvalidFeatures(String),

    // resource-unavailable
    Insufficient(&'static str),

    // conflict
    Conflict(String),
    JobConflict(u32),

    // in-use / lookup
    NotFound(String),
    Busy(String),
    AccessDenied,

    // persistence
    SaveError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidTime(msg) => write!(f, "invalid time value: {msg}"),
            EngineError::MissingAccess => {
                write!(f, "reservation needs at least one account or user")
            }
            EngineError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            EngineError::InvalidName(name) => write!(f, "invalid reservation name {name:?}"),
            EngineError::DuplicateName(name) => {
                write!(f, "reservation {name} already exists")
            }
            EngineError::UnknownPartition(name) => write!(f, "unknown partition: {name}"),
            EngineError::NoDefaultPartition => write!(f, "no default partition"),
            EngineError::UnknownNode(name) => write!(f, "unknown node: {name}"),
            EngineError::UnknownAccount(name) => write!(f, "unknown account: {name}"),
            EngineError::InvalidLicenses(msg) => write!(f, "invalid licenses: {msg}"),
            EngineError::InvalidFeatures(msg) => {
                write!(f, "invalid feature expression: {msg}")
            }
            EngineError::Insufficient(what) => {
                write!(f, "insufficient idle or available {what}")
            }
            EngineError::Conflict(name) => {
                write!(f, "overlaps reservation {name}")
            }
            EngineError::JobConflict(job_id) => {
                write!(f, "overlaps running job {job_id}")
            }
            EngineError::NotFound(name) => write!(f, "reservation {name} not found"),
            EngineError::Busy(name) => write!(f, "reservation {name} busy"),
            EngineError::AccessDenied => write!(f, "access denied by reservation ACL"),
            EngineError::SaveError(e) => write!(f, "state save error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
