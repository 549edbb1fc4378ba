//! resultbridge-core: hand script-computed command results back to an engine
//!
//! A script running under an exclusive interpreter lock finishes a command
//! and calls `return_result(result, callback)`. The bridge moves ownership of
//! the result onto the engine's owning thread, where the engine delivers it,
//! and later re-enters the interpreter on whichever thread the engine
//! finishes on to run the callback with the outcome.
//!
//! # Architecture
//!
//! ```text
//! script (lock held) → bridge::return_result → EngineProxy::notify
//!                                                   ↓
//!                              owning thread: EngineEnv::return_result
//!                                                   ↓
//!                       completion hook → bridge::invoke_completion (lock)
//! ```
//!
//! # Modules
//!
//! - `bridge`: the entry point, engine-thread dispatcher and callback invoker
//! - `context`: per-call ownership record and retained callback
//! - `interp_lock`: reentrant exclusive interpreter lock
//! - `env`: the scripting-environment seam
//! - `engine`: the engine seam (proxy, domain env, binding)
//! - `runtime`: in-process engine with a dedicated owning thread
//! - `lua`: Lua 5.4 scripting environment (feature-gated: `lua`)
//! - `message`: command results
//! - `config`, `logging`, `error`
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod context;
pub mod engine;
pub mod env;
pub mod error;
pub mod interp_lock;
pub mod logging;
#[cfg(feature = "lua")]
pub mod lua;
pub mod message;
pub mod runtime;

pub use bridge::{invoke_completion, return_result};
pub use config::{Config, ConfigError};
pub use engine::{EngineBinding, EngineEnv, EngineProxy, ReturnOutcome};
pub use env::ScriptEnv;
pub use error::{BridgeError, EngineError, ErrorCode, ErrorKind};
pub use message::{CmdResult, ResultSlot, StatusCode};
pub use runtime::{DeliveredResult, EngineRuntime, RuntimeConfig};
