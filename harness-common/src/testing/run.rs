//! Per-test lifecycle: setup, precondition prepare, body, precondition
//! close, cleanup. Every stage has its own time box.

use crate::test_def::TestInstance;
use crate::testing::context::Context;
use crate::testing::precondition::PreconditionSlot;
use crate::testing::stage::{Stage, run_stages};
use crate::testing::state::{OutputSink, State};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Window for the setup stage (out dir, data files, pre-test hook).
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Window for the cleanup stage (post-test hook).
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Grace period after a context deadline for the stage function to return.
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout used when a test does not declare one.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Suffix of the marker file explaining why a data file is absent.
pub const EXTERNAL_ERROR_SUFFIX: &str = ".external-error";

#[cfg(unix)]
const OUT_DIR_MODE: u32 = 0o777 | 0o1000;

/// Hook run before or after every test.
pub type HookFn = Arc<dyn Fn(&Context, &State) + Send + Sync>;

/// Options for a single [`run_test`] call.
#[derive(Clone)]
pub struct RunConfig {
    /// Directory for test artifacts; created world-writable with the sticky bit.
    pub out_dir: Option<PathBuf>,
    /// Directory holding the test's data files.
    pub data_dir: PathBuf,
    pub pre_test_hook: Option<HookFn>,
    pub post_test_hook: Option<HookFn>,
    /// Close the precondition after this test (next test uses another one).
    pub close_precondition: bool,
    /// Precondition state shared across the batch.
    pub precondition: PreconditionSlot,
    pub setup_timeout: Duration,
    pub cleanup_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            out_dir: None,
            data_dir: PathBuf::new(),
            pre_test_hook: None,
            post_test_hook: None,
            close_precondition: false,
            precondition: PreconditionSlot::new(),
            setup_timeout: SETUP_TIMEOUT,
            cleanup_timeout: CLEANUP_TIMEOUT,
        }
    }
}

/// Overhead a scheduler must reserve on top of `timeout + exit_timeout`.
pub fn additional_time(pre_timeout: Option<Duration>) -> Duration {
    SETUP_TIMEOUT + CLEANUP_TIMEOUT + pre_timeout.map(|t| t * 2).unwrap_or_default()
}

/// Run one test instance, sending its output to `sink`.
///
/// Returns `false` if some stage did not return within its window. In that
/// case a fatal error has already been reported and the stage's thread is
/// left running; `sink` must keep accepting (or dropping) its late writes.
pub fn run_test(
    ctx: &Context,
    test: &TestInstance,
    sink: Arc<dyn OutputSink>,
    cfg: &RunConfig,
) -> bool {
    let test = Arc::new(test.clone());
    let state = State::new(
        test.clone(),
        sink,
        cfg.out_dir.clone(),
        cfg.data_dir.clone(),
    );
    let exit_timeout = test.exit_timeout;
    let pre_value = Arc::new(Mutex::new(None));

    let mut stages = Vec::with_capacity(5);

    let setup_cfg = cfg.clone();
    stages.push(Stage::new(
        "Setup",
        cfg.setup_timeout,
        cfg.setup_timeout + exit_timeout,
        move |ctx, s| setup_stage(ctx, s, &setup_cfg),
    ));

    if let Some(pre) = test.pre.clone() {
        let slot = cfg.precondition.clone();
        let value_cell = pre_value.clone();
        stages.push(Stage::new(
            "Precondition prepare",
            pre.timeout(),
            pre.timeout() + exit_timeout,
            move |ctx, s| {
                if s.has_error() {
                    return;
                }
                if let Some(value) = slot.prepared_value(&pre) {
                    debug!(test = s.test_name(), pre = pre.name(), "Reusing prepared precondition");
                    *value_cell.lock().unwrap_or_else(|e| e.into_inner()) = value;
                    return;
                }
                s.log(format!("Preparing precondition {}", pre.name()));
                let value = pre.prepare(ctx, &s.pre_state(pre.name()));
                if !s.has_error() {
                    slot.store(&pre, value.clone());
                }
                *value_cell.lock().unwrap_or_else(|e| e.into_inner()) = value;
            },
        ));
    }

    let value_cell = pre_value.clone();
    let body = test.func.clone();
    stages.push(Stage::new(
        "Test",
        test.timeout,
        test.timeout + exit_timeout,
        move |ctx, s| {
            if s.has_error() {
                return;
            }
            let value = value_cell.lock().unwrap_or_else(|e| e.into_inner()).clone();
            body(ctx, &s.with_pre_value(value));
        },
    ));

    if let Some(pre) = test.pre.clone()
        && cfg.close_precondition
    {
        let slot = cfg.precondition.clone();
        stages.push(Stage::new(
            "Precondition close",
            pre.timeout(),
            pre.timeout() + exit_timeout,
            move |ctx, s| {
                s.log(format!("Closing precondition {}", pre.name()));
                slot.clear();
                pre.close(ctx, &s.pre_state(pre.name()));
            },
        ));
    }

    let hook = cfg.post_test_hook.clone();
    stages.push(Stage::new(
        "Cleanup",
        cfg.cleanup_timeout,
        cfg.cleanup_timeout + exit_timeout,
        move |ctx, s| {
            if let Some(hook) = hook {
                hook(ctx, s);
            }
        },
    ));

    match run_stages(ctx, &state, stages) {
        Ok(()) => {
            info!(test = %test.name, failed = state.has_error(), "Test finished");
            true
        }
        Err(timeout) => {
            let reason = if timeout.stage == "Test" {
                "Test did not return on timeout".to_string()
            } else {
                format!("{} did not return on timeout", timeout.stage)
            };
            state.error_from(reason, file!(), line!());
            false
        }
    }
}

fn setup_stage(ctx: &Context, s: &State, cfg: &RunConfig) {
    let test = s.test();
    if test.timeout.is_zero() {
        s.fatal(format!("Invalid timeout {:?}", test.timeout));
    }

    if let Some(dir) = &cfg.out_dir
        && let Err(err) = prepare_out_dir(dir)
    {
        s.fatal(format!("Failed to create output dir {}: {err}", dir.display()));
    }

    let mut missing = false;
    for name in &test.data {
        let path = s.data_dir().join(name);
        if path.exists() {
            continue;
        }
        missing = true;
        match read_external_error(&path) {
            Some(reason) => s.error(format!("Required data file {name} missing: {reason}")),
            None => s.error(format!("Required data file {name} missing")),
        }
    }
    if missing {
        return;
    }

    if let Some(hook) = &cfg.pre_test_hook {
        hook(ctx, s);
    }
}

fn read_external_error(path: &Path) -> Option<String> {
    let mut marker = path.as_os_str().to_owned();
    marker.push(EXTERNAL_ERROR_SUFFIX);
    std::fs::read_to_string(PathBuf::from(marker))
        .ok()
        .map(|s| s.trim().to_string())
}

fn prepare_out_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Tests may drop privileges, so the directory must stay writable by anyone.
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(OUT_DIR_MODE))?;
    }
    Ok(())
}
