//! Orchestrator-level errors and their process exit codes

use thiserror::Error;

use crate::config::ConfigError;

/// Fatal errors of the orchestrator process
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{component} failed to bind: {source}")]
    Bind {
        component: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("no cell started")]
    NoCellStarted,

    #[error("interrupted")]
    Interrupted,
}

impl OrchestratorError {
    /// The exit code contract of the orchestrator binary
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Bind { .. } => 2,
            Self::NoCellStarted => 3,
            Self::Interrupted => 130,
        }
    }
}
