use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Cannot find a node matching the requested capabilities: {0}")]
    CapabilityNotPresent(String),

    #[error("Timed out after {0}ms waiting for a free node")]
    NewSessionTimeout(u64),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Node communication error: {0}")]
    NodeCommunication(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Hub is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GridError {
    /// Errors caused by talking to a node rather than by the request itself.
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            GridError::NodeCommunication(_) | GridError::Timeout(_) | GridError::Transport(_)
        )
    }
}

impl From<url::ParseError> for GridError {
    fn from(err: url::ParseError) -> Self {
        GridError::InvalidRegistration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
