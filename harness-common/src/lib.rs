//! Shared building blocks for the test harness.
//!
//! This crate holds everything both sides of the runner/bundle boundary need:
//! test definitions and the per-bundle registry, the per-test stage
//! lifecycle, the control-message stream format, and the ambient
//! configuration and logging setup.

pub mod bundle;
pub mod config;
pub mod control;
pub mod expr;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod render;
pub mod test_def;
pub mod testing;
pub mod types;

pub use config::{ConfigError, EnvError, EnvParser, RunnerConfig};
pub use control::{ControlMessage, ControlTranslator};
pub use expr::{AttrExpr, ExprError};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use protocol::{
    BundleRequest, ListEntitiesRequest, ListEntitiesResponse, ProtocolError, RunTestsRequest,
    RunTestsResponse,
};
pub use registry::{Registry, RegistryError};
pub use render::HumanRenderer;
pub use test_def::{Param, Test, TestFunc, TestInstance};
pub use testing::{Context, Output, OutputSink, PreState, PreValue, Precondition, State};
pub use types::{EntityInfo, EntityType, ErrorRecord, ExitStatus};
