//! Command-result payload and its caller-side wrapper.
//!
//! The bridge treats [`CmdResult`] as opaque; it only clones and drops
//! [`ResultHandle`]s. The payload exists so the reference runtime and the Lua
//! environment have something concrete to hand around.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Reference-counted handle to a command result.
pub type ResultHandle = Arc<CmdResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Error,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for StatusCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown status code: {s}. Expected one of: ok, error")),
        }
    }
}

/// Result of a command, addressed to the command it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdResult {
    /// Id of the inbound command this result answers.
    pub cmd_id: String,
    pub status: StatusCode,
    /// A final result retires the command; earlier ones stream partial output.
    pub is_final: bool,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl CmdResult {
    pub fn new(status: StatusCode, cmd_id: impl Into<String>) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            status,
            is_final: true,
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Caller-side wrapper owning one reference to a result until invalidated.
///
/// The bridge clones the handle out of the slot and only invalidates the slot
/// once the engine accepted the hand-off, so the underlying result is never
/// referenced by an in-flight context and freed by the wrapper at once.
#[derive(Debug, Default)]
pub struct ResultSlot {
    msg: Option<ResultHandle>,
}

impl ResultSlot {
    pub fn new(result: CmdResult) -> Self {
        Self {
            msg: Some(Arc::new(result)),
        }
    }

    pub fn handle(&self) -> Option<&ResultHandle> {
        self.msg.as_ref()
    }

    /// Mutable access to the payload, copying it if the handle is shared.
    pub fn get_mut(&mut self) -> Option<&mut CmdResult> {
        self.msg.as_mut().map(Arc::make_mut)
    }

    pub fn is_valid(&self) -> bool {
        self.msg.is_some()
    }

    /// Drop this wrapper's reference; the result itself lives on wherever
    /// other handles still point at it.
    pub fn invalidate(&mut self) {
        self.msg = None;
    }
}
