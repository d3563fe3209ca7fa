//! Error types for gateway-dataplane

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    /// A sender for this cluster is already registered. Callers usually
    /// treat this as success, see [`Error::is_duplicate`].
    #[error("sender for cluster {0} already exists")]
    DuplicateSender(String),

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("sender for cluster {0} is already running")]
    SenderAlreadyRunning(String),

    #[error("no mark assigned to {0}")]
    MarkNotFound(String),

    #[error("mark pool exhausted: every mark in [1, {0}] is in use")]
    MarkPoolExhausted(u32),

    #[error("mark pool has {0} marks in use before initialization")]
    MarkPoolInUse(usize),

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("table id {id} for {requested} is already registered as {existing}")]
    TableIdCollision {
        id: u32,
        existing: String,
        requested: String,
    },
}

impl Error {
    /// True for the benign double-registration error returned by
    /// [`crate::conncheck::ConnChecker::add_sender`].
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateSender(_))
    }
}
