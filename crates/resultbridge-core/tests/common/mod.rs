//! Shared test infrastructure for resultbridge-core integration tests.
//!
//! ```ignore
//! mod common;
//! use common::{CountingEnv, StubEngine};
//! ```

#![allow(dead_code)]

use resultbridge_core::engine::{CompletionHook, EngineEnv, EngineProxy, EngineTask};
use resultbridge_core::interp_lock::{InterpreterGuard, InterpreterLock};
use resultbridge_core::message::ResultHandle;
use resultbridge_core::{EngineError, ReturnOutcome, ScriptEnv};
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::thread::ThreadId;

// ---------------------------------------------------------------------------
// CountingEnv: scripting environment that counts every reference it hands out
// ---------------------------------------------------------------------------

/// One observed callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub callable: u32,
    pub error: Option<EngineError>,
    pub thread: ThreadId,
    pub lock_held: bool,
}

#[derive(Default)]
pub struct CountingState {
    invocations: Vec<Invocation>,
    raising: HashSet<u32>,
    pending: bool,
}

/// Callables are plain ids; `None` stands for a non-callable value.
pub struct CountingEnv {
    interp: InterpreterLock<RefCell<CountingState>>,
    retained: AtomicI64,
    live_errors: AtomicI64,
}

impl CountingEnv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            interp: InterpreterLock::new(RefCell::new(CountingState::default())),
            retained: AtomicI64::new(0),
            live_errors: AtomicI64::new(0),
        })
    }

    /// Make callable `id` raise a script error when invoked.
    pub fn raise_from(&self, id: u32) {
        self.interp.acquire().borrow_mut().raising.insert(id);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.interp.acquire().borrow().invocations.clone()
    }

    pub fn invocations_of(&self, id: u32) -> usize {
        self.invocations()
            .iter()
            .filter(|invocation| invocation.callable == id)
            .count()
    }

    /// Callables retained and not yet released.
    pub fn retained(&self) -> i64 {
        self.retained.load(Ordering::SeqCst)
    }

    /// Error objects wrapped and not yet invalidated.
    pub fn live_errors(&self) -> i64 {
        self.live_errors.load(Ordering::SeqCst)
    }

    pub fn has_pending(&self) -> bool {
        self.interp.acquire().borrow().pending
    }

    /// Hold the interpreter lock the way a running script does.
    pub fn hold_lock(&self) -> InterpreterGuard<'_, RefCell<CountingState>> {
        self.interp.acquire()
    }

    pub fn acquisitions(&self) -> u64 {
        self.interp.acquisitions()
    }

    pub fn is_locked(&self) -> bool {
        self.interp.is_locked()
    }
}

impl ScriptEnv for CountingEnv {
    type State = RefCell<CountingState>;
    type Value<'s> = Option<u32>;
    type Callable = u32;
    type ErrorObject = EngineError;

    fn interpreter(&self) -> &InterpreterLock<Self::State> {
        &self.interp
    }

    fn retain_callable(&self, _state: &Self::State, value: Option<u32>) -> Option<u32> {
        let id = value?;
        self.retained.fetch_add(1, Ordering::SeqCst);
        Some(id)
    }

    fn release_callable(&self, _state: &Self::State, _callable: u32) {
        self.retained.fetch_sub(1, Ordering::SeqCst);
    }

    fn wrap_error(&self, _state: &Self::State, error: &EngineError) -> EngineError {
        self.live_errors.fetch_add(1, Ordering::SeqCst);
        error.clone()
    }

    fn invalidate_error(&self, _state: &Self::State, _error: EngineError) {
        self.live_errors.fetch_sub(1, Ordering::SeqCst);
    }

    fn call_completion(&self, state: &Self::State, callable: &u32, error: Option<&EngineError>) {
        let mut state = state.borrow_mut();
        state.invocations.push(Invocation {
            callable: *callable,
            error: error.cloned(),
            thread: std::thread::current().id(),
            lock_held: self.interp.is_held_by_current_thread(),
        });
        if state.raising.contains(callable) {
            state.pending = true;
        }
    }

    fn check_and_clear_pending_error(&self, state: &Self::State) -> bool {
        std::mem::take(&mut state.borrow_mut().pending)
    }

    fn has_pending_error(&self, state: &Self::State) -> bool {
        state.borrow().pending
    }
}

// ---------------------------------------------------------------------------
// StubEngine: engine that runs tasks inline with scripted outcomes
// ---------------------------------------------------------------------------

pub struct StubEngine {
    /// When set, `notify` refuses every task with this cause.
    pub submission: Option<EngineError>,
    /// When set, the domain operation is rejected with this cause.
    pub rejection: Option<EngineError>,
    /// Outcome reported to the hook of an initiated operation.
    pub delivery: Option<EngineError>,
    pub notified: AtomicUsize,
    pub returned: AtomicUsize,
}

impl StubEngine {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::with(None, None, None))
    }

    pub fn with(
        submission: Option<EngineError>,
        rejection: Option<EngineError>,
        delivery: Option<EngineError>,
    ) -> Self {
        Self {
            submission,
            rejection,
            delivery,
            notified: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
        }
    }
}

impl EngineProxy for StubEngine {
    fn notify(&self, task: EngineTask) -> Result<(), EngineError> {
        if let Some(cause) = &self.submission {
            return Err(cause.clone());
        }
        self.notified.fetch_add(1, Ordering::SeqCst);
        task(self);
        Ok(())
    }
}

impl EngineEnv for StubEngine {
    fn return_result(&self, _result: &ResultHandle, hook: Option<CompletionHook>) -> ReturnOutcome {
        if let Some(cause) = &self.rejection {
            return ReturnOutcome::Rejected(cause.clone());
        }
        self.returned.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = hook {
            hook(self.delivery.clone());
        }
        ReturnOutcome::Initiated
    }
}
