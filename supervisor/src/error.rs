use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot open data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Notice sink already registered")]
    SinkAlreadyRegistered,

    #[error("Cannot serve metrics on {addr}: {source}")]
    MetricsServer {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Common(#[from] common::CommonError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
