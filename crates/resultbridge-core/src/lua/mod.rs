//! Lua 5.4 scripting environment.
//!
//! Exposes two globals to scripts:
//!
//! * `ten_env` with `return_result(result, callback)`, `log(level, message)`
//!   and `is_closed()`
//! * `CmdResult.create(status, cmd_id)`
//!
//! `ten_env:return_result` returns `nil` once the engine queued the result,
//! or an error object (`err:code()`, `err:message()`) when it did not. The
//! callback is later invoked as `callback(ten_env, err_or_nil)` with the
//! interpreter lock held.

mod userdata;

pub use userdata::{LuaCmdResult, LuaTenEnv, LuaTenError};

use crate::engine::EngineBinding;
use crate::env::ScriptEnv;
use crate::error::EngineError;
use crate::interp_lock::InterpreterLock;
use mlua::{Function, Lua, RegistryKey, Value};
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Interpreter state; only reachable through the interpreter lock.
pub struct LuaState {
    lua: Lua,
    pending: RefCell<Option<mlua::Error>>,
    env_key: RefCell<Option<RegistryKey>>,
}

impl LuaState {
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    fn ten_env(&self) -> mlua::Result<Value<'_>> {
        match self.env_key.borrow().as_ref() {
            Some(key) => self.lua.registry_value(key),
            None => Ok(Value::Nil),
        }
    }

    fn invoke(&self, callable: &RegistryKey, error: Option<&LuaTenError>) -> mlua::Result<()> {
        let callable: Value = self.lua.registry_value(callable)?;
        let ten_env = self.ten_env()?;
        let error = error
            .cloned()
            .map(|error| self.lua.create_userdata(error))
            .transpose()?;
        match callable {
            Value::Function(func) => func.call::<_, ()>((ten_env, error)),
            // Tables and userdata go through Lua so their `__call` applies.
            other => self
                .lua
                .load(CALL_THROUGH)
                .set_name("=callback")
                .into_function()?
                .call::<_, ()>((other, ten_env, error)),
        }
    }
}

const CALL_THROUGH: &str = "local f = ...\nreturn f(select(2, ...))";

/// Functions, and tables or userdata whose metatable defines `__call`.
fn is_callable(value: &Value<'_>) -> bool {
    match value {
        Value::Function(_) => true,
        Value::Table(table) => table
            .get_metatable()
            .is_some_and(|meta| meta.contains_key("__call").unwrap_or(false)),
        Value::UserData(data) => data
            .get_metatable()
            .and_then(|meta| meta.contains("__call"))
            .unwrap_or(false),
        _ => false,
    }
}

pub struct LuaScriptEnv {
    interp: InterpreterLock<LuaState>,
    retained: AtomicUsize,
}

impl LuaScriptEnv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            interp: InterpreterLock::new(LuaState {
                lua: Lua::new(),
                pending: RefCell::new(None),
                env_key: RefCell::new(None),
            }),
            retained: AtomicUsize::new(0),
        })
    }

    /// Create the `ten_env` and `CmdResult` globals, bound to `binding`.
    pub fn install(self: &Arc<Self>, binding: EngineBinding) -> mlua::Result<()> {
        let state = self.interp.acquire();
        let lua = &state.lua;

        let ten_env = lua.create_userdata(LuaTenEnv::new(Arc::downgrade(self), binding))?;
        lua.globals().set("ten_env", ten_env.clone())?;
        let key = lua.create_registry_value(ten_env)?;
        if let Some(previous) = state.env_key.replace(Some(key)) {
            lua.remove_registry_value(previous)?;
        }

        let cmd_result = lua.create_table()?;
        cmd_result.set("create", lua.create_function(userdata::create_cmd_result)?)?;
        lua.globals().set("CmdResult", cmd_result)?;

        tracing::debug!("lua environment installed");
        Ok(())
    }

    /// Execute a chunk with the interpreter lock held.
    pub fn run_script(&self, name: &str, source: &str) -> mlua::Result<()> {
        let state = self.interp.acquire();
        state
            .lua
            .load(source.trim_start_matches('\u{FEFF}'))
            .set_name(name)
            .exec()
    }

    /// Call the global `handler(ten_env, cmd_id, cmd_name)`.
    pub fn call_handler(&self, handler: &str, cmd_id: &str, cmd_name: &str) -> mlua::Result<()> {
        let state = self.interp.acquire();
        let func: Function = state.lua.globals().get(handler)?;
        func.call::<_, ()>((state.ten_env()?, cmd_id, cmd_name))
    }

    /// Run `f` against the interpreter with the lock held.
    pub fn with_lua<R>(&self, f: impl FnOnce(&Lua) -> R) -> R {
        let state = self.interp.acquire();
        f(&state.lua)
    }

    /// Callables currently retained on behalf of in-flight operations.
    pub fn retained_callables(&self) -> usize {
        self.retained.load(Ordering::Acquire)
    }
}

impl ScriptEnv for LuaScriptEnv {
    type State = LuaState;
    type Value<'s> = Value<'s>;
    type Callable = RegistryKey;
    type ErrorObject = LuaTenError;

    fn interpreter(&self) -> &InterpreterLock<LuaState> {
        &self.interp
    }

    fn retain_callable(&self, state: &LuaState, value: Value<'_>) -> Option<RegistryKey> {
        if !is_callable(&value) {
            return None;
        }
        match state.lua.create_registry_value(value) {
            Ok(key) => {
                self.retained.fetch_add(1, Ordering::AcqRel);
                Some(key)
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to retain lua callback");
                None
            }
        }
    }

    fn release_callable(&self, state: &LuaState, callable: RegistryKey) {
        self.interp.assert_held();
        self.retained.fetch_sub(1, Ordering::AcqRel);
        if let Err(err) = state.lua.remove_registry_value(callable) {
            tracing::warn!(error = %err, "failed to release lua callback");
        }
    }

    fn wrap_error(&self, _state: &LuaState, error: &EngineError) -> LuaTenError {
        LuaTenError::new(error.clone())
    }

    fn invalidate_error(&self, _state: &LuaState, error: LuaTenError) {
        error.invalidate();
    }

    fn call_completion(
        &self,
        state: &LuaState,
        callable: &RegistryKey,
        error: Option<&LuaTenError>,
    ) {
        self.interp.assert_held();
        if let Err(err) = state.invoke(callable, error) {
            state.pending.replace(Some(err));
        }
    }

    fn check_and_clear_pending_error(&self, state: &LuaState) -> bool {
        match state.pending.take() {
            Some(err) => {
                tracing::debug!(error = %err, "lua completion callback raised");
                true
            }
            None => false,
        }
    }

    fn has_pending_error(&self, state: &LuaState) -> bool {
        state.pending.borrow().is_some()
    }
}
