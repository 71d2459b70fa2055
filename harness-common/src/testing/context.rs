//! Deadline and cancellation context handed to stage functions.
//!
//! Cancellation is cooperative: a stage function that never looks at its
//! context keeps running after the deadline, and the stage runner gives up
//! on it instead of stopping it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Polling granularity for [`Context::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("context canceled")]
    Canceled,
}

/// A deadline plus a chain of cancellation flags.
///
/// Children inherit every ancestor flag, so cancelling a parent cancels all
/// contexts derived from it while cancelling a child leaves the parent alone.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    flags: Vec<Arc<AtomicBool>>,
}

/// Cancels the context it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Context {
    /// Root context with no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a cancellable child context.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut flags = self.flags.clone();
        flags.push(flag.clone());
        (
            Context {
                deadline: self.deadline,
                flags,
            },
            CancelHandle(flag),
        )
    }

    /// Derive a cancellable child whose deadline is at most `timeout` from now.
    ///
    /// A zero timeout adds no deadline of its own.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        let (mut ctx, cancel) = self.with_cancel();
        if !timeout.is_zero() {
            let candidate = Instant::now() + timeout;
            ctx.deadline = Some(match self.deadline {
                Some(parent) => parent.min(candidate),
                None => candidate,
            });
        }
        (ctx, cancel)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Reason the context is done, if it is.
    pub fn err(&self) -> Option<ContextError> {
        if self.flags.iter().any(|f| f.load(Ordering::SeqCst)) {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Sleep for `duration` unless the context finishes first.
    pub fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        let end = Instant::now() + duration;
        loop {
            if let Some(err) = self.err() {
                return Err(err);
            }
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            std::thread::sleep((end - now).min(SLEEP_SLICE));
        }
    }
}
