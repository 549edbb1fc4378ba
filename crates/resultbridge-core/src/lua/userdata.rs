//! Script-visible objects: `ten_env`, command results and error objects.

use super::LuaScriptEnv;
use crate::bridge;
use crate::engine::EngineBinding;
use crate::error::{EngineError, ErrorCode};
use crate::logging::{LogLevel, emit_script_log};
use crate::message::{CmdResult, ResultSlot, StatusCode};
use mlua::{Lua, LuaSerdeExt, MetaMethod, UserData, UserDataMethods, Value};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// The `ten_env` object scripts use to talk to the engine.
pub struct LuaTenEnv {
    env: Weak<LuaScriptEnv>,
    binding: EngineBinding,
}

impl LuaTenEnv {
    pub(super) fn new(env: Weak<LuaScriptEnv>, binding: EngineBinding) -> Self {
        Self { env, binding }
    }

    fn return_result<'lua>(
        &self,
        lua: &'lua Lua,
        result: Value<'lua>,
        callback: Value<'lua>,
    ) -> mlua::Result<Value<'lua>> {
        let Value::UserData(result) = result else {
            return error_value(lua, invalid_argument("result must be a CmdResult"));
        };
        let Ok(mut result) = result.borrow_mut::<LuaCmdResult>() else {
            return error_value(lua, invalid_argument("result must be a CmdResult"));
        };
        let Some(env) = self.env.upgrade() else {
            return error_value(lua, EngineError::runtime_closed("scripting environment is gone"));
        };

        let callback = match callback {
            Value::Nil => None,
            value => Some(value),
        };
        match bridge::return_result(&env, &self.binding, &mut result.slot, callback) {
            Ok(()) => Ok(Value::Nil),
            Err(err) => error_value(lua, err.to_engine_error()),
        }
    }
}

impl UserData for LuaTenEnv {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method(
            "return_result",
            |lua, this, (result, callback): (Value, Value)| this.return_result(lua, result, callback),
        );
        methods.add_method("log", |_, _this, (level, message): (String, String)| {
            let level: LogLevel = level.parse().map_err(mlua::Error::RuntimeError)?;
            emit_script_log(level, &message);
            Ok(())
        });
        methods.add_method("is_closed", |_, this, ()| Ok(!this.binding.is_live()));
    }
}

fn invalid_argument(message: &str) -> EngineError {
    EngineError::new(ErrorCode::InvalidArgument, message)
}

fn error_value(lua: &Lua, error: EngineError) -> mlua::Result<Value<'_>> {
    lua.create_userdata(LuaTenError::new(error))
        .map(Value::UserData)
}

/// Script-side command result, owning one reference until returned.
pub struct LuaCmdResult {
    slot: ResultSlot,
}

impl LuaCmdResult {
    pub fn new(result: CmdResult) -> Self {
        Self {
            slot: ResultSlot::new(result),
        }
    }

    fn payload(&self) -> mlua::Result<&CmdResult> {
        self.slot.handle().map(|handle| &**handle).ok_or_else(consumed)
    }

    fn payload_mut(&mut self) -> mlua::Result<&mut CmdResult> {
        self.slot.get_mut().ok_or_else(consumed)
    }
}

fn consumed() -> mlua::Error {
    mlua::Error::RuntimeError("result was already returned".to_string())
}

impl UserData for LuaCmdResult {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("is_valid", |_, this, ()| Ok(this.slot.is_valid()));
        methods.add_method("cmd_id", |_, this, ()| Ok(this.payload()?.cmd_id.clone()));
        methods.add_method("status_code", |_, this, ()| {
            Ok(this.payload()?.status.as_str())
        });
        methods.add_method("is_final", |_, this, ()| Ok(this.payload()?.is_final));
        methods.add_method_mut("set_final", |_, this, is_final: bool| {
            this.payload_mut()?.is_final = is_final;
            Ok(())
        });
        methods.add_method_mut(
            "set_property",
            |lua, this, (key, value): (String, Value)| {
                let value: serde_json::Value = lua.from_value(value)?;
                this.payload_mut()?.properties.insert(key, value);
                Ok(())
            },
        );
        methods.add_method("get_property", |lua, this, key: String| {
            match this.payload()?.properties.get(&key) {
                Some(value) => lua.to_value(value),
                None => Ok(Value::Nil),
            }
        });
    }
}

/// `CmdResult.create(status, cmd_id)`
pub(super) fn create_cmd_result(
    _lua: &Lua,
    (status, cmd_id): (String, String),
) -> mlua::Result<LuaCmdResult> {
    let status: StatusCode = status.parse().map_err(mlua::Error::RuntimeError)?;
    Ok(LuaCmdResult::new(CmdResult::new(status, cmd_id)))
}

/// Script-side wrapper of an [`EngineError`].
///
/// Clones share the wrapped error, so invalidating one invalidates every
/// copy a script may have stashed away.
#[derive(Clone)]
pub struct LuaTenError {
    inner: Arc<Mutex<Option<EngineError>>>,
}

impl LuaTenError {
    pub fn new(error: EngineError) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(error))),
        }
    }

    pub fn error(&self) -> Option<EngineError> {
        self.inner.lock().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn invalidate(&self) {
        self.inner.lock().take();
    }
}

impl UserData for LuaTenError {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("is_valid", |_, this, ()| Ok(this.is_valid()));
        methods.add_method("code", |_, this, ()| {
            Ok(this.error().map(|err| err.code.as_str()))
        });
        methods.add_method("message", |_, this, ()| {
            Ok(this.error().map(|err| err.message))
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(match this.error() {
                Some(err) => err.to_string(),
                None => "invalid error".to_string(),
            })
        });
    }
}
