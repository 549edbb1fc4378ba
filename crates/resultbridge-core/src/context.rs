//! Per-call ownership record carried across the engine-thread boundary.

use crate::env::ScriptEnv;
use crate::message::ResultHandle;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Retained reference to a script callable.
///
/// Moved, never copied: the reference is given back exactly once, either
/// through [`release`](Self::release) by code already holding the interpreter
/// lock, or on drop, which takes the lock itself.
pub struct CallbackRef<E: ScriptEnv> {
    env: Arc<E>,
    callable: Option<E::Callable>,
}

impl<E: ScriptEnv> CallbackRef<E> {
    /// Retain `value` when it is invocable; non-callables yield `None`.
    pub fn retain(env: &Arc<E>, state: &E::State, value: E::Value<'_>) -> Option<Self> {
        let callable = env.retain_callable(state, value)?;
        Some(Self {
            env: Arc::clone(env),
            callable: Some(callable),
        })
    }

    pub fn env(&self) -> &Arc<E> {
        &self.env
    }

    pub fn callable(&self) -> Option<&E::Callable> {
        self.callable.as_ref()
    }

    /// Give the reference back using a lock the caller already holds.
    pub fn release(mut self, state: &E::State) {
        if let Some(callable) = self.callable.take() {
            self.env.release_callable(state, callable);
        }
    }
}

impl<E: ScriptEnv> Drop for CallbackRef<E> {
    fn drop(&mut self) {
        if let Some(callable) = self.callable.take() {
            let guard = self.env.interpreter().acquire();
            self.env.release_callable(&guard, callable);
        }
    }
}

/// Result and optional callback handed from the caller to the engine thread.
///
/// Holds exactly one reference to the result for its whole life. Dropping
/// the context is its single destruction point: it releases the result and,
/// if it was never consumed, the callback.
pub struct OwnershipContext<E: ScriptEnv> {
    id: u64,
    result: ResultHandle,
    callback: Option<CallbackRef<E>>,
}

impl<E: ScriptEnv> OwnershipContext<E> {
    pub fn new(result: ResultHandle, callback: Option<CallbackRef<E>>) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            ctx = id,
            cmd_id = %result.cmd_id,
            has_callback = callback.is_some(),
            "return_result context created"
        );
        Self {
            id,
            result,
            callback,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn result(&self) -> &ResultHandle {
        &self.result
    }

    /// Move the callback out; the context no longer releases it.
    pub fn take_callback(&mut self) -> Option<CallbackRef<E>> {
        self.callback.take()
    }
}

impl<E: ScriptEnv> Drop for OwnershipContext<E> {
    fn drop(&mut self) {
        tracing::trace!(
            ctx = self.id,
            callback_unconsumed = self.callback.is_some(),
            "return_result context released"
        );
    }
}
