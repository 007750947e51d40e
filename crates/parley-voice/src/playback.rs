//! The "current playback" slot used for barge-in.
//!
//! Whatever is speaking on a call (a playlist group or an unscripted pipe) registers its task's
//! [`AbortHandle`] here. An external barge-in trigger calls [`PlaybackSlot::cancel`]; the
//! registering code holds a [`SlotGuard`] that clears the slot on every exit path.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Default)]
struct SlotInner {
    current: Mutex<Option<(u64, AbortHandle)>>,
    generation: AtomicU64,
}

/// Cloneable handle to one call's current playback.
#[derive(Debug, Clone, Default)]
pub struct PlaybackSlot {
    inner: Arc<SlotInner>,
}

impl PlaybackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the current playback until the returned guard drops.
    pub fn install(&self, handle: AbortHandle) -> SlotGuard {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *self.inner.current.lock() = Some((generation, handle));
        SlotGuard {
            slot: self.clone(),
            generation,
        }
    }

    /// Cancel the current playback, if any. Idempotent; returns whether a task was signalled.
    pub fn cancel(&self) -> bool {
        match self.inner.current.lock().take() {
            Some((generation, handle)) => {
                debug!(generation, "cancelling current playback");
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.current.lock().is_some()
    }
}

/// Clears the slot when dropped, unless a newer playback has replaced it. A playback still
/// registered at that point is aborted, so dropping the awaiting future stops the group too.
#[derive(Debug)]
pub struct SlotGuard {
    slot: PlaybackSlot,
    generation: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut current = self.slot.inner.current.lock();
        if current.as_ref().is_some_and(|(g, _)| *g == self.generation) {
            if let Some((_, handle)) = current.take() {
                handle.abort();
            }
        }
    }
}
