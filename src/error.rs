use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StackjoinError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("Cluster control error: {0}")]
    Cluster(String),

    #[error("Consensus store error: {0}")]
    Store(String),

    #[error("Load balancer error: {0}")]
    LoadBalancer(String),

    #[error("Failover state error: {0}")]
    Failover(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Control error: {0}")]
    Control(String),
}

pub type Result<T> = std::result::Result<T, StackjoinError>;

impl StackjoinError {
    pub fn config(msg: impl Into<String>) -> Self {
        StackjoinError::Config(msg.into())
    }

    pub fn cluster(msg: impl Into<String>) -> Self {
        StackjoinError::Cluster(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        StackjoinError::Store(msg.into())
    }

    pub fn load_balancer(msg: impl Into<String>) -> Self {
        StackjoinError::LoadBalancer(msg.into())
    }

    pub fn failover(msg: impl Into<String>) -> Self {
        StackjoinError::Failover(msg.into())
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        StackjoinError::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

impl From<ctrlc::Error> for StackjoinError {
    fn from(e: ctrlc::Error) -> Self {
        StackjoinError::Control(e.to_string())
    }
}
