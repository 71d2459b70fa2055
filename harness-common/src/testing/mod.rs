//! In-bundle test execution: contexts, per-test state, preconditions, and
//! the staged lifecycle every test goes through.

mod context;
mod precondition;
mod run;
mod stage;
mod state;

pub use context::{CancelHandle, Context, ContextError};
pub use precondition::{PreValue, Precondition, PreconditionSlot, same_precondition};
pub use run::{
    CLEANUP_TIMEOUT, DEFAULT_EXIT_TIMEOUT, DEFAULT_TEST_TIMEOUT, EXTERNAL_ERROR_SUFFIX, HookFn,
    RunConfig, SETUP_TIMEOUT, additional_time, run_test,
};
pub use stage::{Stage, StageFn, StageTimeout, run_stages};
pub use state::{Output, OutputSink, PreState, State};
