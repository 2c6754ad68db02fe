use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse parameter file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid combination bounds: {0}")]
    InvalidBounds(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Unknown task type tag '{0}'")]
    UnknownTaskTag(String),

    #[error("Task transfer aborted: {0}")]
    TaskTransfer(String),

    #[error("Task has no initialized grid")]
    TaskNotInitialized,

    #[error("Grid layout mismatch: {0}")]
    GridLayout(String),

    #[error("Communicator failure: {0}")]
    Comm(String),

    #[error("Process group {0} failed")]
    GroupFailed(usize),

    #[error("Third-level protocol violation: {0}")]
    Protocol(String),

    #[error("Third-level channel timed out: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;
