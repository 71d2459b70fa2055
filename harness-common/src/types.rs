//! Common types used across harness components.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process exit status shared by the runner and bundles.
///
/// Each status has its own exit code so calling scripts can tell
/// "nothing to do" apart from "something broke".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Everything ran (test failures in framework-driven runs still count as success).
    Success,
    /// Invalid arguments or configuration.
    BadArgs,
    /// The bundle glob matched no executable bundles.
    NoBundles,
    /// No bundle had tests matching the request.
    NoTests,
    /// A bundle failed to start, broke the protocol, or exited non-zero.
    BundleFailed,
    /// One or more tests failed during a manual run.
    TestFailed,
    /// Broken output pipe or SIGINT.
    Interrupted,
    /// SIGTERM, typically from a newer runner instance.
    Terminated,
}

impl ExitStatus {
    /// Numeric process exit code.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::BadArgs => 1,
            Self::NoBundles => 2,
            Self::NoTests => 3,
            Self::BundleFailed => 4,
            Self::TestFailed => 5,
            Self::Interrupted => 6,
            Self::Terminated => 7,
        }
    }

    /// Inverse of [`ExitStatus::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::BadArgs,
            2 => Self::NoBundles,
            3 => Self::NoTests,
            4 => Self::BundleFailed,
            5 => Self::TestFailed,
            6 => Self::Interrupted,
            7 => Self::Terminated,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::BadArgs => write!(f, "bad_args"),
            Self::NoBundles => write!(f, "no_bundles"),
            Self::NoTests => write!(f, "no_tests"),
            Self::BundleFailed => write!(f, "bundle_failed"),
            Self::TestFailed => write!(f, "test_failed"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        // Codes are all in 0..=7.
        std::process::ExitCode::from(status.code() as u8)
    }
}

/// Kind of entity exposed by enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    #[default]
    Test,
    Fixture,
}

/// Serializable description of a test as seen outside its bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    /// Fully resolved name, `category.FuncName[.param]`.
    pub name: String,
    /// Defining package (the test category).
    pub pkg: String,
    /// Name of the bundle that registered the test.
    pub bundle: String,
    #[serde(default)]
    pub kind: EntityType,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub attr: Vec<String>,
    #[serde(default)]
    pub data: Vec<String>,
    #[serde(default)]
    pub software_deps: Vec<String>,
    #[serde(default)]
    pub service_deps: Vec<String>,
    /// Name of the precondition, if any.
    #[serde(default)]
    pub precondition: Option<String>,
    pub timeout: Duration,
    /// Overhead beyond `timeout` a scheduler should budget for.
    #[serde(default)]
    pub additional_time: Duration,
}

/// An error reported by a test, with its source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub reason: String,
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub stack: String,
}
