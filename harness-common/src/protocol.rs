//! Runner ↔ bundle wire format.
//!
//! The runner writes exactly one [`BundleRequest`] as JSON to the bundle's
//! stdin and closes it. The bundle answers on stdout: a single
//! [`ListEntitiesResponse`] for a list request, or one [`RunTestsResponse`]
//! JSON object per line for a run request.

use crate::types::{EntityInfo, ErrorRecord};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message {line:?}: {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("{0}")]
    Order(String),
}

/// Request sent by the runner to a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BundleRequest {
    List(ListEntitiesRequest),
    Run(RunTestsRequest),
}

/// Enumerate the bundle's tests matching `patterns` (all when empty).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListEntitiesRequest {
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListEntitiesResponse {
    pub entities: Vec<EntityInfo>,
}

/// Run the bundle's tests matching `patterns`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTestsRequest {
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Base directory for per-test output; each test gets `<out_dir>/<name>`.
    #[serde(default)]
    pub out_dir: Option<PathBuf>,
    /// Base directory for data files; each test reads from `<data_dir>/<pkg>`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Skip tests whose software dependencies are not available.
    #[serde(default)]
    pub check_deps: bool,
    #[serde(default)]
    pub available_software_features: Vec<String>,
    #[serde(default)]
    pub unavailable_software_features: Vec<String>,
    /// Replaces each test's grace period after its timeout, when set.
    #[serde(default)]
    pub exit_timeout: Option<Duration>,
}

/// One streamed record of a run, in the order the bundle produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTestsResponse {
    RunLog {
        time: DateTime<Utc>,
        text: String,
    },
    EntityStart {
        time: DateTime<Utc>,
        entity: EntityInfo,
        #[serde(default)]
        out_dir: Option<PathBuf>,
    },
    EntityLog {
        time: DateTime<Utc>,
        entity_name: String,
        text: String,
    },
    EntityError {
        time: DateTime<Utc>,
        entity_name: String,
        error: ErrorRecord,
    },
    EntityEnd {
        time: DateTime<Utc>,
        entity_name: String,
        #[serde(default)]
        skip_reasons: Vec<String>,
    },
}

/// Write `msg` as one JSON line and flush.
pub fn write_json_line<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<(), ProtocolError> {
    let mut line = serde_json::to_vec(msg).map_err(ProtocolError::Encode)?;
    line.push(b'\n');
    w.write_all(&line)?;
    w.flush()?;
    Ok(())
}

/// Parse one JSON line.
pub fn parse_json_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(line.trim_end()).map_err(|source| ProtocolError::Decode {
        line: line.trim_end().to_string(),
        source,
    })
}

/// Read every non-empty JSON line from `r` until EOF.
pub fn read_json_lines<R: BufRead, T: DeserializeOwned>(r: R) -> Result<Vec<T>, ProtocolError> {
    let mut out = Vec::new();
    for line in r.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(parse_json_line(&line)?);
    }
    Ok(out)
}
