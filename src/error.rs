use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Malformed hierarchy: {0}")]
    Hierarchy(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("SQL generation error: {0}")]
    Generation(String),

    #[error("SQL execution error: {0}")]
    Execution(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
