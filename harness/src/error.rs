//! Runner error types and their exit statuses.

use crate::bundle_process::BundleError;
use harness_common::{ConfigError, ExitStatus};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    BadArgs(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no bundles matched by {0:?}")]
    NoBundles(String),

    #[error("no tests matched by pattern(s) {0:?}")]
    NoTests(Vec<String>),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error("bundle task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),
}

impl RunnerError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::BadArgs(_) | Self::Config(_) => ExitStatus::BadArgs,
            Self::NoBundles(_) => ExitStatus::NoBundles,
            Self::NoTests(_) => ExitStatus::NoTests,
            Self::Bundle(BundleError::Interrupted) => ExitStatus::Interrupted,
            Self::Bundle(BundleError::Terminated) => ExitStatus::Terminated,
            Self::Bundle(_) | Self::Task(_) | Self::Io { .. } => ExitStatus::BundleFailed,
            // Losing our own stdout means the reader went away.
            Self::Output(_) => ExitStatus::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(RunnerError::BadArgs("x".into()).exit_status().code(), 1);
        assert_eq!(RunnerError::NoBundles("/x/*".into()).exit_status().code(), 2);
        assert_eq!(RunnerError::NoTests(vec![]).exit_status().code(), 3);
        assert_eq!(
            RunnerError::Bundle(BundleError::Interrupted).exit_status(),
            ExitStatus::Interrupted
        );
        assert_eq!(
            RunnerError::Bundle(BundleError::Terminated).exit_status(),
            ExitStatus::Terminated
        );
        let exited = BundleError::Exited {
            path: PathBuf::from("/b/cros"),
            code: Some(3),
            stderr: "boom".into(),
        };
        assert_eq!(RunnerError::Bundle(exited).exit_status(), ExitStatus::BundleFailed);
    }
}
