// crates/salesmart-core/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("request to {endpoint} failed: {message}")]
    UpstreamRequest { endpoint: String, message: String },

    #[error("report for task {task_id} not ready after {attempts} polls")]
    PollTimeout { task_id: String, attempts: u32 },

    #[error("increment for report {report_id} on {date} is empty")]
    EmptyIncrement { report_id: String, date: String },

    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },

    #[error("staging load failed: {0}")]
    Load(String),

    #[error("transformation {name} failed: {message}")]
    Transformation { name: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Database query failed: {0}")]
    Database(#[from] sqlx::Error),
}

impl PipelineError {
    pub(crate) fn upstream(endpoint: &str, message: impl ToString) -> Self {
        Self::UpstreamRequest {
            endpoint: endpoint.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn load(message: impl ToString) -> Self {
        Self::Load(message.to_string())
    }

    pub(crate) fn transformation(name: &str, message: impl ToString) -> Self {
        Self::Transformation {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
