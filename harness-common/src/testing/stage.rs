//! Sequential runner for time-boxed stages.
//!
//! Each stage runs on its own thread under a derived context. The runner
//! waits for the stage's completion signal up to `run_timeout`; a stage that
//! misses it is abandoned, not killed, and no further stages are started.

use crate::testing::context::Context;
use crate::testing::state::{FatalUnwind, State};
use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Body of a stage.
pub type StageFn = Box<dyn FnOnce(&Context, &State) + Send + 'static>;

/// One time-boxed unit of work.
pub struct Stage {
    /// Human-readable name used in timeout reports ("Test", "Setup", ...).
    pub name: &'static str,
    pub f: StageFn,
    /// Deadline of the context passed to `f`. Zero means no deadline.
    pub ctx_timeout: Duration,
    /// How long to wait for `f` to return; must exceed `ctx_timeout`.
    pub run_timeout: Duration,
}

impl Stage {
    pub fn new(
        name: &'static str,
        ctx_timeout: Duration,
        run_timeout: Duration,
        f: impl FnOnce(&Context, &State) + Send + 'static,
    ) -> Self {
        Self {
            name,
            f: Box::new(f),
            ctx_timeout,
            run_timeout,
        }
    }
}

/// A stage did not return within its run timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} did not return on timeout ({run_timeout:?})")]
pub struct StageTimeout {
    pub stage: &'static str,
    pub run_timeout: Duration,
}

thread_local! {
    static PANIC_SITE: RefCell<Option<(String, u32)>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook that remembers where the last panic on this thread happened,
/// so a recovered panic can be reported at its real source location.
fn install_panic_site_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                PANIC_SITE.with(|site| {
                    *site.borrow_mut() = Some((location.file().to_string(), location.line()));
                });
            }
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Run `stages` in order.
///
/// Returns `Err` as soon as a stage misses its run timeout; its thread keeps
/// running in the background and may still write to `state` afterwards.
/// Panics are reported as a single `"Panic: <value>"` error and do not stop
/// later stages. `fatal` ends only its own stage.
pub fn run_stages(ctx: &Context, state: &State, stages: Vec<Stage>) -> Result<(), StageTimeout> {
    install_panic_site_hook();

    for stage in stages {
        let (stage_ctx, cancel) = ctx.with_timeout(stage.ctx_timeout);
        let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
        let stage_state = state.clone();
        let f = stage.f;

        let spawned = thread::Builder::new()
            .name(format!("stage-{}", stage.name.to_lowercase().replace(' ', "-")))
            .spawn(move || {
                PANIC_SITE.with(|site| site.borrow_mut().take());
                let result = panic::catch_unwind(AssertUnwindSafe(|| f(&stage_ctx, &stage_state)));
                if let Err(payload) = result
                    && !payload.is::<FatalUnwind>()
                {
                    let (file, line) = PANIC_SITE
                        .with(|site| site.borrow_mut().take())
                        .unwrap_or_else(|| (file!().to_string(), line!()));
                    stage_state.error_from(format!("Panic: {}", panic_message(&*payload)), &file, line);
                }
                let _ = done_tx.send(());
            });

        if let Err(err) = spawned {
            state.error_from(
                format!("Failed to start {} stage: {err}", stage.name),
                file!(),
                line!(),
            );
            cancel.cancel();
            continue;
        }

        match done_rx.recv_timeout(stage.run_timeout) {
            // Disconnected only happens if the thread died without reaching
            // the send, which catch_unwind rules out short of an abort.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                cancel.cancel();
                debug!(stage = stage.name, test = state.test_name(), "Stage finished");
            }
            Err(RecvTimeoutError::Timeout) => {
                cancel.cancel();
                warn!(
                    stage = stage.name,
                    test = state.test_name(),
                    run_timeout = ?stage.run_timeout,
                    "Stage did not return on timeout; abandoning it"
                );
                return Err(StageTimeout {
                    stage: stage.name,
                    run_timeout: stage.run_timeout,
                });
            }
        }
    }
    Ok(())
}
