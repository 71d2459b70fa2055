//! Control-message stream the runner writes to its stdout.
//!
//! A run is framed by [`ControlMessage::RunStart`] and either
//! [`ControlMessage::RunEnd`] or [`ControlMessage::RunError`]. Between them
//! the runner relays each bundle's [`RunTestsResponse`] records, translated
//! one-to-one by [`ControlTranslator`].

use crate::protocol::{ProtocolError, RunTestsResponse};
use crate::types::{EntityInfo, ErrorRecord, ExitStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// One record of the runner's control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    RunStart {
        time: DateTime<Utc>,
        test_names: Vec<String>,
        num_tests: usize,
    },
    RunLog {
        time: DateTime<Utc>,
        text: String,
    },
    EntityStart {
        time: DateTime<Utc>,
        info: EntityInfo,
        #[serde(default)]
        out_dir: Option<PathBuf>,
    },
    EntityLog {
        time: DateTime<Utc>,
        name: String,
        text: String,
    },
    EntityError {
        time: DateTime<Utc>,
        name: String,
        error: ErrorRecord,
    },
    EntityEnd {
        time: DateTime<Utc>,
        name: String,
        #[serde(default)]
        skip_reasons: Vec<String>,
    },
    RunEnd {
        time: DateTime<Utc>,
        out_dir: PathBuf,
    },
    RunError {
        time: DateTime<Utc>,
        status: ExitStatus,
        reason: String,
    },
}

impl ControlMessage {
    /// True for the records that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunEnd { .. } | Self::RunError { .. })
    }
}

impl From<RunTestsResponse> for ControlMessage {
    fn from(resp: RunTestsResponse) -> Self {
        match resp {
            RunTestsResponse::RunLog { time, text } => Self::RunLog { time, text },
            RunTestsResponse::EntityStart {
                time,
                entity,
                out_dir,
            } => Self::EntityStart {
                time,
                info: entity,
                out_dir,
            },
            RunTestsResponse::EntityLog {
                time,
                entity_name,
                text,
            } => Self::EntityLog {
                time,
                name: entity_name,
                text,
            },
            RunTestsResponse::EntityError {
                time,
                entity_name,
                error,
            } => Self::EntityError {
                time,
                name: entity_name,
                error,
            },
            RunTestsResponse::EntityEnd {
                time,
                entity_name,
                skip_reasons,
            } => Self::EntityEnd {
                time,
                name: entity_name,
                skip_reasons,
            },
        }
    }
}

impl TryFrom<ControlMessage> for RunTestsResponse {
    type Error = ControlMessage;

    /// Run framing records have no bundle-side counterpart and come back
    /// unchanged as the error.
    fn try_from(msg: ControlMessage) -> Result<Self, Self::Error> {
        Ok(match msg {
            ControlMessage::RunLog { time, text } => Self::RunLog { time, text },
            ControlMessage::EntityStart { time, info, out_dir } => Self::EntityStart {
                time,
                entity: info,
                out_dir,
            },
            ControlMessage::EntityLog { time, name, text } => Self::EntityLog {
                time,
                entity_name: name,
                text,
            },
            ControlMessage::EntityError { time, name, error } => Self::EntityError {
                time,
                entity_name: name,
                error,
            },
            ControlMessage::EntityEnd {
                time,
                name,
                skip_reasons,
            } => Self::EntityEnd {
                time,
                entity_name: name,
                skip_reasons,
            },
            other => return Err(other),
        })
    }
}

/// Translates one bundle's response stream, checking entity framing.
///
/// An entity's logs and errors must come after its start and before its
/// end; anything else means the bundle is broken.
#[derive(Debug, Default)]
pub struct ControlTranslator {
    active: HashSet<String>,
    finished: usize,
}

impl ControlTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, resp: RunTestsResponse) -> Result<ControlMessage, ProtocolError> {
        match &resp {
            RunTestsResponse::RunLog { .. } => {}
            RunTestsResponse::EntityStart { entity, .. } => {
                if !self.active.insert(entity.name.clone()) {
                    return Err(ProtocolError::Order(format!(
                        "entity {} started twice",
                        entity.name
                    )));
                }
            }
            RunTestsResponse::EntityLog { entity_name, .. }
            | RunTestsResponse::EntityError { entity_name, .. } => {
                if !self.active.contains(entity_name) {
                    return Err(ProtocolError::Order(format!(
                        "output for entity {entity_name} outside its start/end"
                    )));
                }
            }
            RunTestsResponse::EntityEnd { entity_name, .. } => {
                if !self.active.remove(entity_name) {
                    return Err(ProtocolError::Order(format!(
                        "end of entity {entity_name} without a start"
                    )));
                }
                self.finished += 1;
            }
        }
        Ok(resp.into())
    }

    /// Check the stream ended with every started entity finished.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if let Some(name) = self.active.iter().next() {
            return Err(ProtocolError::Order(format!(
                "stream ended before entity {name} finished"
            )));
        }
        Ok(())
    }

    pub fn finished_entities(&self) -> usize {
        self.finished
    }
}
