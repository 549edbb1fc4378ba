//! The return-result bridge.
//!
//! ```text
//! script thread                   engine owning thread         any engine thread
//! ─────────────                   ────────────────────         ─────────────────
//! return_result ──notify──► dispatch ──return_result──► (reply) ──► complete
//!   │ clone result                 │ Rejected ─► invoke_completion   │
//!   │ retain callback              │ Initiated                       ▼
//!   └ invalidate wrapper           └ drop context            invoke_completion
//! ```
//!
//! The context is dropped exactly once: inside the rejected task when the
//! engine refuses the hand-off, or at the end of [`dispatch`]. The callback
//! runs at most once whichever side ends up invoking it, because both sides
//! take it out of the same [`PendingCompletion`] slot.

use crate::context::{CallbackRef, OwnershipContext};
use crate::engine::{CompletionHook, EngineBinding, EngineEnv, EngineTask, ReturnOutcome};
use crate::env::ScriptEnv;
use crate::error::{BridgeError, EngineError, fatal_reentrancy_violation};
use crate::message::ResultSlot;
use parking_lot::Mutex;
use std::sync::Arc;

/// Hand the result in `result` back to the engine bound to `binding`.
///
/// Returns as soon as the engine has queued the work. The outcome of the
/// domain operation only reaches `callback`, invoked as
/// `callback(env, error_or_nil)`; without a callback it is never observed.
/// A `callback` that is not invocable is treated as absent.
///
/// On success the caller-side wrapper is invalidated: ownership of the
/// result moved into the in-flight context. On failure it is left intact.
pub fn return_result<E: ScriptEnv>(
    env: &Arc<E>,
    binding: &EngineBinding,
    result: &mut ResultSlot,
    callback: Option<E::Value<'_>>,
) -> Result<(), BridgeError> {
    let Some(proxy) = binding.proxy() else {
        tracing::debug!("return_result called without a live engine binding");
        return Err(BridgeError::RuntimeClosed);
    };
    let Some(handle) = result.handle() else {
        return Err(BridgeError::ResultConsumed);
    };
    let handle = Arc::clone(handle);

    let callback = match callback {
        Some(value) => {
            let guard = env.interpreter().acquire();
            CallbackRef::retain(env, &guard, value)
        }
        None => None,
    };

    let ctx = OwnershipContext::new(handle, callback);
    let ctx_id = ctx.id();
    let task: EngineTask = Box::new(move |engine: &dyn EngineEnv| dispatch(ctx, engine));

    if let Err(cause) = proxy.notify(task) {
        tracing::warn!(ctx = ctx_id, error = %cause, "engine rejected return_result submission");
        return Err(BridgeError::SubmissionFailed(cause));
    }

    // Only now: the context holds its own clone of the handle.
    result.invalidate();
    Ok(())
}

/// Engine-thread half of the hand-off.
fn dispatch<E: ScriptEnv>(mut ctx: OwnershipContext<E>, engine: &dyn EngineEnv) {
    match ctx.take_callback() {
        None => {
            if let ReturnOutcome::Rejected(cause) = engine.return_result(ctx.result(), None) {
                tracing::warn!(
                    ctx = ctx.id(),
                    error = %cause,
                    "fire-and-forget return_result rejected"
                );
            }
        }
        Some(callback) => {
            let pending = Arc::new(PendingCompletion::new(ctx.id(), callback));
            let hook_pending = Arc::clone(&pending);
            let hook: CompletionHook =
                Box::new(move |error: Option<EngineError>| hook_pending.complete(error.as_ref()));

            match engine.return_result(ctx.result(), Some(hook)) {
                ReturnOutcome::Initiated => {
                    tracing::trace!(ctx = ctx.id(), "return_result initiated");
                }
                ReturnOutcome::Rejected(cause) => {
                    let err = BridgeError::OperationRejected(cause);
                    tracing::debug!(ctx = ctx.id(), error = %err, "reporting rejection to callback");
                    pending.complete(Some(&err.to_engine_error()));
                }
            }
        }
    }

    drop(ctx);
}

/// Callback awaiting exactly one completion.
struct PendingCompletion<E: ScriptEnv> {
    ctx: u64,
    callback: Mutex<Option<CallbackRef<E>>>,
}

impl<E: ScriptEnv> PendingCompletion<E> {
    fn new(ctx: u64, callback: CallbackRef<E>) -> Self {
        Self {
            ctx,
            callback: Mutex::new(Some(callback)),
        }
    }

    fn complete(&self, error: Option<&EngineError>) {
        let Some(callback) = self.callback.lock().take() else {
            tracing::warn!(ctx = self.ctx, "duplicate return_result completion ignored");
            return;
        };
        invoke_completion(callback, error);
    }
}

/// Re-enter the scripting environment and run `callback(env, error_or_nil)`.
///
/// Safe to call from any thread: the interpreter lock is taken first and the
/// guard is released on every exit path. A script error raised by the
/// callback is cleared here and never escapes to the engine thread.
pub fn invoke_completion<E: ScriptEnv>(callback: CallbackRef<E>, error: Option<&EngineError>) {
    let env = Arc::clone(callback.env());
    let guard = env.interpreter().acquire();

    let error_object = error.map(|err| env.wrap_error(&guard, err));
    if let Some(callable) = callback.callable() {
        env.call_completion(&guard, callable, error_object.as_ref());
    }

    if env.check_and_clear_pending_error(&guard) {
        tracing::warn!("return_result callback raised; error cleared");
    }
    if env.has_pending_error(&guard) {
        fatal_reentrancy_violation("script error still pending after return_result callback");
    }

    callback.release(&guard);
    if let Some(error_object) = error_object {
        env.invalidate_error(&guard, error_object);
    }
    drop(guard);
}
