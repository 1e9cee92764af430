#[derive(Debug)]
pub enum EngineError {
    /// A requested number is missing, inactive, or not bookable right now.
    ResourceUnavailable(u64),
    UnknownKey(String),
    InvalidKey(String),
    UnknownCategory(u32),
    UnknownProvider(u32),
    AlreadyExists(String),
    Unauthorized(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ResourceUnavailable(id) => {
                write!(f, "number not available: {id}")
            }
            EngineError::UnknownKey(key) => write!(f, "unknown number: {key}"),
            EngineError::InvalidKey(key) => write!(f, "invalid number: {key}"),
            EngineError::UnknownCategory(id) => write!(f, "unknown category: {id}"),
            EngineError::UnknownProvider(id) => write!(f, "unknown provider: {id}"),
            EngineError::AlreadyExists(key) => write!(f, "already exists: {key}"),
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
