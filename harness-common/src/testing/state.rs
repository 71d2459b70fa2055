//! Per-test state handed to stage functions, hooks, and preconditions.

use crate::test_def::TestInstance;
use crate::testing::precondition::PreValue;
use crate::types::ErrorRecord;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

/// One record produced while a test runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Log { time: DateTime<Utc>, text: String },
    Error { time: DateTime<Utc>, error: ErrorRecord },
}

/// Destination for a test's output.
///
/// Sinks must tolerate writes after the test has been given up on: a stage
/// abandoned on timeout may keep logging from its own thread.
pub trait OutputSink: Send + Sync {
    fn emit(&self, output: Output);
}

/// Sink feeding an mpsc channel. Sends after the receiver is gone are dropped.
impl OutputSink for Sender<Output> {
    fn emit(&self, output: Output) {
        let _ = self.send(output);
    }
}

/// Unwind payload used by `fatal` to end the current stage.
///
/// The stage runner recognises it and does not report it as a panic.
pub(crate) struct FatalUnwind;

struct Root {
    sink: Arc<dyn OutputSink>,
    failed: AtomicBool,
}

impl Root {
    fn log(&self, text: String) {
        self.sink.emit(Output::Log {
            time: Utc::now(),
            text,
        });
    }

    fn error_at(&self, reason: String, location: &Location<'_>) {
        self.error_at_site(reason, location.file(), location.line());
    }

    fn error_at_site(&self, reason: String, file: &str, line: u32) {
        self.failed.store(true, Ordering::SeqCst);
        let backtrace = Backtrace::capture();
        let stack = if backtrace.status() == BacktraceStatus::Captured {
            backtrace.to_string()
        } else {
            String::new()
        };
        self.sink.emit(Output::Error {
            time: Utc::now(),
            error: ErrorRecord {
                reason,
                file: file.to_string(),
                line,
                stack,
            },
        });
    }
}

/// Handle a test body (and the stages around it) uses to report progress.
#[derive(Clone)]
pub struct State {
    root: Arc<Root>,
    test: Arc<TestInstance>,
    pre_value: Option<PreValue>,
    out_dir: Option<PathBuf>,
    data_dir: PathBuf,
}

impl State {
    pub(crate) fn new(
        test: Arc<TestInstance>,
        sink: Arc<dyn OutputSink>,
        out_dir: Option<PathBuf>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            root: Arc::new(Root {
                sink,
                failed: AtomicBool::new(false),
            }),
            test,
            pre_value: None,
            out_dir,
            data_dir,
        }
    }

    /// Same test, with the prepared precondition value visible.
    pub(crate) fn with_pre_value(&self, value: Option<PreValue>) -> Self {
        let mut state = self.clone();
        state.pre_value = value;
        state
    }

    /// State handed to the test's precondition.
    pub(crate) fn pre_state(&self, pre_name: &str) -> PreState {
        PreState {
            root: self.root.clone(),
            pre_name: pre_name.to_string(),
            test_name: self.test.name.clone(),
        }
    }

    pub fn test_name(&self) -> &str {
        &self.test.name
    }

    pub(crate) fn test(&self) -> &TestInstance {
        &self.test
    }

    pub fn log(&self, text: impl Into<String>) {
        self.root.log(text.into());
    }

    /// Report an error and keep going.
    #[track_caller]
    pub fn error(&self, reason: impl Into<String>) {
        self.root.error_at(reason.into(), Location::caller());
    }

    /// Report an error and end the current stage.
    ///
    /// Later stages (precondition close, cleanup) still run.
    #[track_caller]
    pub fn fatal(&self, reason: impl Into<String>) -> ! {
        self.root.error_at(reason.into(), Location::caller());
        std::panic::resume_unwind(Box::new(FatalUnwind))
    }

    /// Record an error whose source location is supplied by the caller.
    pub(crate) fn error_from(&self, reason: String, file: &str, line: u32) {
        self.root.error_at_site(reason, file, line);
    }

    pub fn has_error(&self) -> bool {
        self.root.failed.load(Ordering::SeqCst)
    }

    /// Value returned by the precondition's `prepare`, if any.
    pub fn pre_value<T: Any>(&self) -> Option<&T> {
        self.pre_value.as_deref()?.downcast_ref::<T>()
    }

    /// Value attached to the parameter variant this instance was built from.
    pub fn param<T: Any>(&self) -> Option<&T> {
        self.test.val.as_deref()?.downcast_ref::<T>()
    }

    /// Directory the test may write artifacts into.
    pub fn out_dir(&self) -> Option<&Path> {
        self.out_dir.as_deref()
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Absolute path of a declared data file.
    ///
    /// Asking for a file the test did not declare is a test bug and is
    /// reported as an error; the returned path is still usable.
    #[track_caller]
    pub fn data_path(&self, name: &str) -> PathBuf {
        if !self.test.data.iter().any(|d| d == name) {
            self.root.error_at(
                format!("Test data {name} wasn't declared in the test's data list"),
                Location::caller(),
            );
        }
        self.data_dir.join(name)
    }
}

/// State handed to a precondition's `prepare` and `close`.
pub struct PreState {
    root: Arc<Root>,
    pre_name: String,
    test_name: String,
}

impl PreState {
    pub fn precondition_name(&self) -> &str {
        &self.pre_name
    }

    /// Test whose run triggered this call.
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn log(&self, text: impl Into<String>) {
        self.root.log(text.into());
    }

    #[track_caller]
    pub fn error(&self, reason: impl Into<String>) {
        self.root
            .error_at(format!("[Precondition failure] {}", reason.into()), Location::caller());
    }

    #[track_caller]
    pub fn fatal(&self, reason: impl Into<String>) -> ! {
        self.root
            .error_at(format!("[Precondition failure] {}", reason.into()), Location::caller());
        std::panic::resume_unwind(Box::new(FatalUnwind))
    }

    pub fn has_error(&self) -> bool {
        self.root.failed.load(Ordering::SeqCst)
    }
}
