//! Error types for publish-and-run variations

use std::path::PathBuf;

use thiserror::Error;

use crate::orchestrator::Stage;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Deployment failed to start: {0}")]
    DeploymentStartupFailed(String),

    #[error("Deployment unreachable after {attempts} attempt(s): {reason}")]
    DeploymentUnreachable { attempts: u32, reason: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("publishExclude rules not honored, found: {}", display_paths(.files))]
    PublishExclusionViolation { files: Vec<PathBuf> },

    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("Invalid deployer state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Port {0} is unavailable")]
    PortUnavailable(u16),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Variation {variation} failed during {stage}: {source}")]
    Variation {
        variation: String,
        stage: Stage,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

fn display_paths(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
