//! Interfaces the bridge consumes from the native engine.
//!
//! The engine owns one thread on which all engine-domain state lives. The
//! bridge only ever reaches that thread through [`EngineProxy::notify`], and
//! only touches engine-domain operations through the [`EngineEnv`] handed to
//! a task running there.

use crate::error::EngineError;
use crate::message::ResultHandle;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Work item executed on the engine's owning thread.
pub type EngineTask = Box<dyn FnOnce(&dyn EngineEnv) + Send + 'static>;

/// Hook run once the reply to a `return_result` arrives, or once sending it
/// definitively failed. Runs on a thread of the engine's choosing.
pub type CompletionHook = Box<dyn FnOnce(Option<EngineError>) + Send + 'static>;

/// Outcome of starting the domain `return_result` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// The operation started; the hook (if any) will run exactly once.
    Initiated,
    /// The operation never started; the hook was dropped without running.
    Rejected(EngineError),
}

/// Thread-safe handle used to schedule work on the engine's owning thread.
pub trait EngineProxy: Send + Sync {
    /// Queue `task` without waiting for it to run.
    ///
    /// On `Err` the task was dropped without running.
    fn notify(&self, task: EngineTask) -> Result<(), EngineError>;
}

/// Engine-domain operations, only reachable from the owning thread.
pub trait EngineEnv {
    /// Hand `result` back to whoever sent the command it answers.
    fn return_result(&self, result: &ResultHandle, hook: Option<CompletionHook>)
    -> ReturnOutcome;
}

/// Link between a scripting-environment object and a live engine.
///
/// Clones share the link, so detaching it (when the engine closes) is seen
/// by every script-side holder at once.
#[derive(Clone, Default)]
pub struct EngineBinding {
    proxy: Arc<RwLock<Option<Arc<dyn EngineProxy>>>>,
}

impl EngineBinding {
    pub fn new(proxy: Arc<dyn EngineProxy>) -> Self {
        Self {
            proxy: Arc::new(RwLock::new(Some(proxy))),
        }
    }

    /// A binding with no engine behind it.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn attach(&self, proxy: Arc<dyn EngineProxy>) {
        *self.proxy.write() = Some(proxy);
    }

    pub fn detach(&self) {
        self.proxy.write().take();
    }

    pub fn proxy(&self) -> Option<Arc<dyn EngineProxy>> {
        self.proxy.read().clone()
    }

    pub fn is_live(&self) -> bool {
        self.proxy.read().is_some()
    }
}

impl fmt::Debug for EngineBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBinding")
            .field("live", &self.is_live())
            .finish()
    }
}
