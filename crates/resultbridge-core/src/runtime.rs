//! In-process reference engine.
//!
//! One owning thread drains a `flume` queue of tasks; every piece of
//! engine-domain state (commands awaiting a result, the outbox) is only
//! touched from that thread or under the domain mutex. Completion hooks of
//! initiated `return_result` operations run on the owning thread right after
//! the task that initiated them returns, never inside it.
//!
//! Do not call [`EngineRuntime::flush`], [`EngineRuntime::settle`] or
//! [`EngineRuntime::close`] while holding the interpreter lock: queued tasks
//! may need the lock to run script callbacks.

use crate::engine::{
    CompletionHook, EngineBinding, EngineEnv, EngineProxy, EngineTask, ReturnOutcome,
};
use crate::error::{EngineError, ErrorCode};
use crate::message::{CmdResult, ResultHandle};
use flume::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

/// Engine runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name of the owning thread
    pub thread_name: String,

    /// Maximum number of queued tasks; 0 means unbounded
    pub queue_capacity: usize,

    /// When set, every initiated result fails to deliver with this reason
    pub delivery_fault: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name: "engine".to_string(),
            queue_capacity: 0,
            delivery_fault: None,
        }
    }
}

/// A result that reached the peer that sent its command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveredResult {
    pub cmd_name: String,
    pub result: CmdResult,
}

enum Job {
    Run(EngineTask),
    Barrier(Sender<()>),
}

#[derive(Default)]
struct DomainState {
    pending_cmds: BTreeMap<String, String>,
    outbox: Vec<DeliveredResult>,
    delivery_fault: Option<String>,
    next_cmd: u64,
}

struct Shared {
    tx: RwLock<Option<Sender<Job>>>,
    domain: Mutex<DomainState>,
    in_flight: AtomicUsize,
    queue_capacity: usize,
}

/// Engine with a dedicated owning thread.
pub struct EngineRuntime {
    shared: Arc<Shared>,
    bindings: Mutex<Vec<EngineBinding>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EngineRuntime {
    pub fn start(config: &RuntimeConfig) -> io::Result<Self> {
        let (tx, rx) = if config.queue_capacity == 0 {
            flume::unbounded()
        } else {
            flume::bounded(config.queue_capacity)
        };

        let shared = Arc::new(Shared {
            tx: RwLock::new(Some(tx)),
            domain: Mutex::new(DomainState {
                delivery_fault: config.delivery_fault.clone(),
                ..DomainState::default()
            }),
            in_flight: AtomicUsize::new(0),
            queue_capacity: config.queue_capacity,
        });

        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run_owning_thread(&loop_shared, &rx))?;

        tracing::debug!(
            thread = %config.thread_name,
            queue_capacity = config.queue_capacity,
            "engine runtime started"
        );

        Ok(Self {
            shared,
            bindings: Mutex::new(Vec::new()),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Handle for queueing work on the owning thread.
    pub fn proxy(&self) -> Arc<dyn EngineProxy> {
        Arc::new(RuntimeProxy {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Binding for a script-side environment object; detached on close.
    pub fn binding(&self) -> EngineBinding {
        let binding = if self.is_closed() {
            EngineBinding::detached()
        } else {
            EngineBinding::new(self.proxy())
        };
        self.bindings.lock().push(binding.clone());
        binding
    }

    /// Register an inbound command that now awaits a result.
    pub fn receive_cmd(&self, name: impl Into<String>) -> String {
        let mut domain = self.shared.domain.lock();
        domain.next_cmd += 1;
        let cmd_id = format!("cmd-{}", domain.next_cmd);
        domain.pending_cmds.insert(cmd_id.clone(), name.into());
        cmd_id
    }

    pub fn pending_cmds(&self) -> Vec<String> {
        self.shared.domain.lock().pending_cmds.keys().cloned().collect()
    }

    pub fn take_delivered(&self) -> Vec<DeliveredResult> {
        std::mem::take(&mut self.shared.domain.lock().outbox)
    }

    pub fn set_delivery_fault(&self, reason: Option<String>) {
        self.shared.domain.lock().delivery_fault = reason;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.tx.read().is_none()
    }

    /// Wait until everything queued so far, and its completions, has run.
    ///
    /// Returns `false` when the owning thread is no longer running, either
    /// because the runtime was closed or because a task panicked.
    pub fn flush(&self) -> bool {
        let Some(tx) = self.shared.tx.read().clone() else {
            return false;
        };
        let (done_tx, done_rx) = flume::bounded(1);
        let reached = tx.send(Job::Barrier(done_tx)).is_ok() && done_rx.recv().is_ok();
        if !reached {
            tracing::error!("engine owning thread stopped; queued work will not run");
        }
        reached
    }

    /// Flush until no task is queued or running, including tasks queued by
    /// callbacks of earlier tasks.
    pub fn settle(&self) {
        while self.flush() {
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
        }
    }

    /// Stop accepting work, drain the queue and join the owning thread.
    ///
    /// Every task already queued still runs, so every initiated operation
    /// still completes. Bindings handed out by [`binding`](Self::binding)
    /// are detached first.
    pub fn close(&self) {
        for binding in self.bindings.lock().drain(..) {
            binding.detach();
        }
        drop(self.shared.tx.write().take());

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            tracing::warn!("engine runtime closed from its own thread; not joining");
            return;
        }
        if handle.join().is_err() {
            tracing::error!("engine owning thread panicked");
        }
        tracing::debug!("engine runtime closed");
    }
}

impl Drop for EngineRuntime {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_owning_thread(shared: &Shared, rx: &Receiver<Job>) {
    for job in rx.iter() {
        match job {
            Job::Run(task) => {
                let _in_flight = InFlight(&shared.in_flight);
                let env = OwningThreadEnv {
                    shared,
                    deferred: RefCell::new(Vec::new()),
                };
                task(&env);
                env.run_deferred();
            }
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::trace!("engine owning thread exiting");
}

/// Counts a task as finished when dropped, unwinding included.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct RuntimeProxy {
    shared: Arc<Shared>,
}

impl EngineProxy for RuntimeProxy {
    fn notify(&self, task: EngineTask) -> Result<(), EngineError> {
        let sent = {
            let tx = self.shared.tx.read();
            let Some(tx) = tx.as_ref() else {
                return Err(EngineError::runtime_closed("engine runtime is closed"));
            };
            self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
            tx.try_send(Job::Run(task))
        };

        // A rejected job is dropped here, outside the sender lock.
        match sent {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                match err {
                    TrySendError::Full(_) => Err(EngineError::generic(format!(
                        "engine queue is full ({} tasks pending)",
                        self.shared.queue_capacity
                    ))),
                    TrySendError::Disconnected(_) => {
                        Err(EngineError::runtime_closed("engine runtime is closed"))
                    }
                }
            }
        }
    }
}

/// Engine-domain view handed to a task on the owning thread.
struct OwningThreadEnv<'a> {
    shared: &'a Shared,
    deferred: RefCell<Vec<(CompletionHook, Option<EngineError>)>>,
}

impl OwningThreadEnv<'_> {
    fn run_deferred(self) {
        for (hook, outcome) in self.deferred.into_inner() {
            hook(outcome);
        }
    }
}

impl EngineEnv for OwningThreadEnv<'_> {
    fn return_result(
        &self,
        result: &ResultHandle,
        hook: Option<CompletionHook>,
    ) -> ReturnOutcome {
        let mut domain = self.shared.domain.lock();
        let Some(cmd_name) = domain.pending_cmds.get(&result.cmd_id).cloned() else {
            return ReturnOutcome::Rejected(EngineError::new(
                ErrorCode::MsgNotConnected,
                format!("no pending command {} awaits this result", result.cmd_id),
            ));
        };

        let outcome = if let Some(reason) = domain.delivery_fault.clone() {
            Some(EngineError::generic(format!(
                "failed to deliver result for {}: {reason}",
                result.cmd_id
            )))
        } else {
            if result.is_final {
                domain.pending_cmds.remove(&result.cmd_id);
            }
            domain.outbox.push(DeliveredResult {
                cmd_name,
                result: CmdResult::clone(result),
            });
            None
        };
        drop(domain);

        if let Some(hook) = hook {
            self.deferred.borrow_mut().push((hook, outcome));
        }
        ReturnOutcome::Initiated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatusCode;
    use std::sync::mpsc;
    use std::time::Duration;

    fn submit_result(
        runtime: &EngineRuntime,
        result: CmdResult,
    ) -> mpsc::Receiver<(ReturnOutcome, Option<EngineError>)> {
        let (tx, rx) = mpsc::channel();
        let handle = Arc::new(result);
        runtime
            .proxy()
            .notify(Box::new(move |engine: &dyn EngineEnv| {
                let (hook_tx, hook_rx) = mpsc::channel();
                let hook: CompletionHook = Box::new(move |err| hook_tx.send(err).unwrap());
                let outcome = engine.return_result(&handle, Some(hook));
                // Hooks never run inside the initiating task.
                assert!(hook_rx.try_recv().is_err());
                std::thread::spawn(move || {
                    let err = hook_rx.recv_timeout(Duration::from_secs(5)).ok().flatten();
                    tx.send((outcome, err)).unwrap();
                });
            }))
            .unwrap();
        rx
    }

    #[test]
    fn final_result_is_delivered_and_retires_command() {
        let runtime = EngineRuntime::start(&RuntimeConfig::default()).unwrap();
        let cmd_id = runtime.receive_cmd("hello");

        let rx = submit_result(&runtime, CmdResult::new(StatusCode::Ok, &cmd_id));
        let (outcome, err) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(outcome, ReturnOutcome::Initiated);
        assert!(err.is_none());
        let delivered = runtime.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].cmd_name, "hello");
        assert!(runtime.pending_cmds().is_empty());
    }

    #[test]
    fn streaming_result_keeps_command_pending() {
        let runtime = EngineRuntime::start(&RuntimeConfig::default()).unwrap();
        let cmd_id = runtime.receive_cmd("stream");
        let mut partial = CmdResult::new(StatusCode::Ok, &cmd_id);
        partial.is_final = false;

        let rx = submit_result(&runtime, partial);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(runtime.pending_cmds(), vec![cmd_id]);
    }

    #[test]
    fn unknown_command_is_rejected_synchronously() {
        let runtime = EngineRuntime::start(&RuntimeConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = Arc::new(CmdResult::new(StatusCode::Ok, "cmd-404"));
        runtime
            .proxy()
            .notify(Box::new(move |engine: &dyn EngineEnv| {
                tx.send(engine.return_result(&handle, None)).unwrap();
            }))
            .unwrap();

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            ReturnOutcome::Rejected(err) => assert_eq!(err.code, ErrorCode::MsgNotConnected),
            ReturnOutcome::Initiated => panic!("expected rejection"),
        }
        assert!(runtime.take_delivered().is_empty());
    }

    #[test]
    fn delivery_fault_fails_asynchronously() {
        let runtime = EngineRuntime::start(&RuntimeConfig {
            delivery_fault: Some("peer went away".to_string()),
            ..RuntimeConfig::default()
        })
        .unwrap();
        let cmd_id = runtime.receive_cmd("hello");

        let rx = submit_result(&runtime, CmdResult::new(StatusCode::Ok, &cmd_id));
        let (outcome, err) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(outcome, ReturnOutcome::Initiated);
        let err = err.expect("delivery error");
        assert_eq!(err.code, ErrorCode::Generic);
        assert!(err.message.contains("peer went away"));
        assert!(runtime.take_delivered().is_empty());
        assert_eq!(runtime.pending_cmds(), vec![cmd_id]);
    }

    #[test]
    fn closed_runtime_rejects_notify_and_detaches_bindings() {
        let runtime = EngineRuntime::start(&RuntimeConfig::default()).unwrap();
        let binding = runtime.binding();
        let proxy = runtime.proxy();
        runtime.close();

        assert!(runtime.is_closed());
        assert!(!binding.is_live());
        let err = proxy.notify(Box::new(|_engine: &dyn EngineEnv| {})).unwrap_err();
        assert_eq!(err.code, ErrorCode::RuntimeClosed);
    }

    #[test]
    fn close_drains_queued_tasks() {
        let runtime = EngineRuntime::start(&RuntimeConfig::default()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            runtime
                .proxy()
                .notify(Box::new(move |_engine: &dyn EngineEnv| {
                    ran.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        runtime.close();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn bounded_queue_rejects_when_full() {
        let runtime = EngineRuntime::start(&RuntimeConfig {
            queue_capacity: 1,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let proxy = runtime.proxy();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        proxy
            .notify(Box::new(move |_engine: &dyn EngineEnv| {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            }))
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        proxy.notify(Box::new(|_engine: &dyn EngineEnv| {})).unwrap();
        let err = proxy
            .notify(Box::new(|_engine: &dyn EngineEnv| {}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Generic);
        assert!(err.message.contains("queue is full"));

        release_tx.send(()).unwrap();
        runtime.settle();
    }

    fn blow_up() {
        panic!("task blew up");
    }

    fn settles_within(runtime: &Arc<EngineRuntime>, timeout: Duration) -> bool {
        let (tx, rx) = mpsc::channel();
        let settling = Arc::clone(runtime);
        std::thread::spawn(move || {
            settling.settle();
            let _ = tx.send(());
        });
        rx.recv_timeout(timeout).is_ok()
    }

    #[test]
    fn settle_returns_after_task_panics() {
        let runtime = Arc::new(EngineRuntime::start(&RuntimeConfig::default()).unwrap());
        let proxy = runtime.proxy();
        proxy
            .notify(Box::new(|_engine: &dyn EngineEnv| blow_up()))
            .unwrap();
        // Queued behind the panicking task; never runs.
        let _ = proxy.notify(Box::new(|_engine: &dyn EngineEnv| {}));

        assert!(settles_within(&runtime, Duration::from_secs(5)));
        assert!(!runtime.flush());
    }

    #[test]
    fn settle_returns_after_completion_hook_panics() {
        let runtime = Arc::new(EngineRuntime::start(&RuntimeConfig::default()).unwrap());
        let cmd_id = runtime.receive_cmd("hello");
        let handle = Arc::new(CmdResult::new(StatusCode::Ok, &cmd_id));
        runtime
            .proxy()
            .notify(Box::new(move |engine: &dyn EngineEnv| {
                let hook: CompletionHook = Box::new(|_err| blow_up());
                engine.return_result(&handle, Some(hook));
            }))
            .unwrap();

        assert!(settles_within(&runtime, Duration::from_secs(5)));
        assert_eq!(runtime.take_delivered().len(), 1);
    }

    #[test]
    fn flush_reports_closed_runtime() {
        let runtime = EngineRuntime::start(&RuntimeConfig::default()).unwrap();
        assert!(runtime.flush());
        runtime.close();
        assert!(!runtime.flush());
    }

    #[test]
    fn settle_waits_for_chained_tasks() {
        let runtime = Arc::new(EngineRuntime::start(&RuntimeConfig::default()).unwrap());
        let ran = Arc::new(AtomicUsize::new(0));
        let proxy = runtime.proxy();
        let chained = Arc::clone(&proxy);
        let counter = Arc::clone(&ran);
        proxy
            .notify(Box::new(move |_engine: &dyn EngineEnv| {
                counter.fetch_add(1, Ordering::SeqCst);
                let counter = Arc::clone(&counter);
                chained
                    .notify(Box::new(move |_engine: &dyn EngineEnv| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }))
                    .unwrap();
            }))
            .unwrap();

        runtime.settle();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
