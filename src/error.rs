use std::path::PathBuf;

use thiserror::Error;

/// Failure to fetch or parse the task catalog. Surfaced to the panel; no task can start.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read task catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse task catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("task '{task}' is invalid: {source}")]
    InvalidTask {
        task: String,
        #[source]
        source: StepError,
    },
}

/// A step definition that cannot be armed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step '{step}' needs an `expected` value for its action type")]
    MissingExpected { step: String },

    #[error("step '{step}' has an invalid pattern: {source}")]
    BadPattern {
        step: String,
        #[source]
        source: regex::Error,
    },

    #[error("step '{step}' has an empty selector")]
    EmptySelector { step: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store contents are not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// The page context cannot host an engine. Logged and swallowed at the coordinator boundary.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("page '{0}' is protected")]
    Protected(String),

    #[error("agent injection failed: {0}")]
    Injection(String),

    #[error("no page context for tab '{0}'")]
    NoContext(String),
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("navigation to '{url}' failed: {reason}")]
    Navigation { url: String, reason: String },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("progress sink request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("progress sink rejected the report: {0}")]
    Rejected(String),
}

/// Why a resume attempt on a freshly loaded page did not go through.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine's page context was destroyed before it could answer.
    #[error("engine is gone")]
    Gone,
}
