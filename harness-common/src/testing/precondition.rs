//! Shared setup/teardown objects reused across consecutive tests.

use crate::testing::context::Context;
use crate::testing::state::PreState;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Opaque value produced by [`Precondition::prepare`].
pub type PreValue = Arc<dyn Any + Send + Sync>;

/// A named, time-boxed setup shared by every test that declares it.
///
/// Identity is the instance: two tests share a prepare/close pair only when
/// they hold the same `Arc`.
pub trait Precondition: Send + Sync {
    fn name(&self) -> &str;

    /// Budget for each of `prepare` and `close`.
    fn timeout(&self) -> Duration;

    /// Set up the shared state. Errors are reported through `s`.
    fn prepare(&self, ctx: &Context, s: &PreState) -> Option<PreValue>;

    fn close(&self, ctx: &Context, s: &PreState);
}

impl fmt::Debug for dyn Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Precondition({})", self.name())
    }
}

/// True when both sides name the same precondition instance (or both none).
pub fn same_precondition(
    a: Option<&Arc<dyn Precondition>>,
    b: Option<&Arc<dyn Precondition>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => instance_id(a) == instance_id(b),
        _ => false,
    }
}

// Compare data pointers only; vtable pointers are not unique per type.
fn instance_id(pre: &Arc<dyn Precondition>) -> *const () {
    Arc::as_ptr(pre) as *const ()
}

struct Prepared {
    id: usize,
    value: Option<PreValue>,
}

/// Remembers the currently prepared precondition across a run batch.
///
/// Cloning shares the slot. A bundle keeps one slot per run request so that a
/// contiguous run of same-precondition tests calls `prepare` once.
#[derive(Clone, Default)]
pub struct PreconditionSlot {
    inner: Arc<Mutex<Option<Prepared>>>,
}

impl PreconditionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value prepared for `pre`, if `pre` is the one currently prepared.
    pub(crate) fn prepared_value(&self, pre: &Arc<dyn Precondition>) -> Option<Option<PreValue>> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .filter(|p| p.id == instance_id(pre) as usize)
            .map(|p| p.value.clone())
    }

    pub(crate) fn store(&self, pre: &Arc<dyn Precondition>, value: Option<PreValue>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Prepared {
            id: instance_id(pre) as usize,
            value,
        });
    }

    pub(crate) fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn is_prepared(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
