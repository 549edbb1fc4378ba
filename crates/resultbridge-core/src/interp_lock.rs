//! Exclusive interpreter lock.
//!
//! Every touch of a scripting-environment object, and of the environment's
//! pending-error state, happens through an [`InterpreterGuard`]. The lock is
//! an explicit handle rather than ambient global state, so code that needs it
//! has to be handed one and a test can count how often it was taken.
//!
//! The lock is reentrant: the scripting thread already holds it while a
//! script runs, and the entry point (called from that script) takes it again
//! without deadlocking. Engine threads take it from scratch.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide exclusive lock guarding interpreter state `S`.
pub struct InterpreterLock<S> {
    state: ReentrantMutex<S>,
    acquisitions: AtomicU64,
}

impl<S> InterpreterLock<S> {
    pub fn new(state: S) -> Self {
        Self {
            state: ReentrantMutex::new(state),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Block until the calling thread holds the lock.
    ///
    /// Nested acquisitions on the same thread succeed immediately. The lock
    /// is released when the outermost guard drops, on every exit path.
    pub fn acquire(&self) -> InterpreterGuard<'_, S> {
        let guard = self.state.lock();
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        InterpreterGuard { guard }
    }

    /// Total number of acquisitions, nested ones included.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.is_owned_by_current_thread()
    }

    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    /// Lock-order assertion for code that must already run under the lock.
    #[track_caller]
    pub fn assert_held(&self) {
        assert!(
            self.is_held_by_current_thread(),
            "interpreter lock must be held by the current thread"
        );
    }
}

impl<S> fmt::Debug for InterpreterLock<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpreterLock")
            .field("locked", &self.is_locked())
            .field("acquisitions", &self.acquisitions())
            .finish_non_exhaustive()
    }
}

/// Proof that the current thread holds the interpreter lock.
pub struct InterpreterGuard<'a, S> {
    guard: ReentrantMutexGuard<'a, S>,
}

impl<S> Deref for InterpreterGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.guard
    }
}
