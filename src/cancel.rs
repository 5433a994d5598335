use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::{PatchError, Result};

/// Cooperative pause/interrupt token threaded through every blocking
/// read/write in the engine.
///
/// All stream loops call [`checkpoint`](CancelToken::checkpoint) before each
/// chunk: it blocks while the token is paused and fails with
/// [`PatchError::Cancelled`] once interrupted. Interruption is only honored
/// at points the engine marks cancel-enabled; the two-rename swap window is
/// not one of them, so a half-swapped file pair can never be observed.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    resumed: Condvar,
    cancel_enabled: AtomicBool,
}

#[derive(Default)]
struct State {
    paused: bool,
    interrupted: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                resumed: Condvar::new(),
                cancel_enabled: AtomicBool::new(true),
            }),
        }
    }

    pub fn pause(&self) {
        self.lock_state().paused = true;
    }

    pub fn resume(&self) {
        self.lock_state().paused = false;
        self.inner.resumed.notify_all();
    }

    /// Request cancellation. Takes effect at the next cancel-enabled
    /// checkpoint; also wakes a paused worker so it can observe the flag.
    pub fn interrupt(&self) {
        self.lock_state().interrupted = true;
        self.inner.resumed.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock_state().interrupted
    }

    pub(crate) fn set_cancel_enabled(&self, enabled: bool) {
        self.inner.cancel_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Block while paused; fail if interrupted at a cancel-enabled point.
    pub fn checkpoint(&self) -> Result<()> {
        let mut state = self.lock_state();
        while state.paused && !state.interrupted {
            state = self
                .inner
                .resumed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.interrupted && self.inner.cancel_enabled.load(Ordering::SeqCst) {
            return Err(PatchError::Cancelled);
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
