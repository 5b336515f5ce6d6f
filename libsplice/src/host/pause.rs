use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

/// Cooperative stop-the-world.
///
/// Running contexts hold a [`RunGuard`] while they execute; a pause takes the
/// exclusive side, so it starts only once every context has reached a
/// checkpoint and nothing runs until it ends.
#[derive(Debug, Default)]
pub struct PauseGate {
    lock: RwLock<()>,
    paused: AtomicBool,
    pauses: AtomicUsize,
}

/// Held by a context between checkpoints
pub struct RunGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks while a pause is in progress
    pub fn enter(&self) -> RunGuard<'_> {
        RunGuard {
            _guard: self.lock.read(),
        }
    }

    pub fn pause<T>(&self, f: impl FnOnce() -> T) -> T {
        let _exclusive = self.lock.write();
        self.pauses.fetch_add(1, Ordering::Relaxed);
        self.paused.store(true, Ordering::Release);
        fence(Ordering::SeqCst);

        let result = f();

        fence(Ordering::SeqCst);
        self.paused.store(false, Ordering::Release);
        result
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Number of pauses taken so far
    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::Relaxed)
    }
}
