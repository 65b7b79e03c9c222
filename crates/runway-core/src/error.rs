use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunwayError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("json parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("invalid batch configuration: {0}")]
    Config(String),

    #[error("unknown batch or alias `{name}` and no database root to treat it as an input glob")]
    UnknownBatch { name: String },

    #[error("{runner} rejected job `{job}`: {reason}")]
    Submission {
        runner: &'static str,
        job: String,
        reason: String,
    },

    #[error("status api error: {0}")]
    Api(String),

    #[error("cancelled")]
    Cancelled,
}

pub type RunwayResult<T> = Result<T, RunwayError>;
