//! Binding layer of the embedded scripting environment.
//!
//! The bridge is generic over [`ScriptEnv`] so the same hand-off protocol can
//! drive any interpreter that has an exclusive lock, retainable callables and
//! a pending-error slot. Every method that touches environment objects takes
//! the interpreter state, which can only be reached through an
//! [`InterpreterGuard`](crate::interp_lock::InterpreterGuard).

use crate::error::EngineError;
use crate::interp_lock::InterpreterLock;

pub trait ScriptEnv: Send + Sync + 'static {
    /// Interpreter state guarded by the exclusive lock.
    type State: Send;

    /// Script-side value offered as a completion callback.
    type Value<'s>;

    /// Retained reference to a script-owned callable.
    type Callable: Send + 'static;

    /// Script-side wrapper of a native error.
    type ErrorObject;

    fn interpreter(&self) -> &InterpreterLock<Self::State>;

    /// Retain `value` if it can be invoked, `None` otherwise.
    fn retain_callable(&self, state: &Self::State, value: Self::Value<'_>)
    -> Option<Self::Callable>;

    /// Give back a reference taken by [`retain_callable`](Self::retain_callable).
    fn release_callable(&self, state: &Self::State, callable: Self::Callable);

    fn wrap_error(&self, state: &Self::State, error: &EngineError) -> Self::ErrorObject;

    /// Detach the wrapper from its native error; script code still holding
    /// it afterwards sees an invalid object.
    fn invalidate_error(&self, state: &Self::State, error: Self::ErrorObject);

    /// Call `callable(env, error_or_nil)` and discard the return value.
    ///
    /// A script error raised by the callable is left pending in `state`.
    fn call_completion(
        &self,
        state: &Self::State,
        callable: &Self::Callable,
        error: Option<&Self::ErrorObject>,
    );

    /// Consume a pending script error. Returns whether one was pending.
    fn check_and_clear_pending_error(&self, state: &Self::State) -> bool;

    fn has_pending_error(&self, state: &Self::State) -> bool;
}
