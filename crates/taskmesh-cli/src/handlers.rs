//! Demonstration handlers selectable from `[[agents]]` in the config file.

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use taskmesh_core::{Payload, TaskmeshError, TaskmeshResult};
use taskmesh_orchestrator::{handler_fn, TaskHandler};

/// Which built-in handler an agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinHandler {
    /// Return the payload unchanged.
    #[default]
    Echo,
    /// Upper-case the text in the payload.
    Uppercase,
    /// Multiply the number in the payload by two.
    Double,
    /// Always fail.
    Fail,
}

impl BuiltinHandler {
    pub fn build(self) -> Arc<dyn TaskHandler> {
        match self {
            BuiltinHandler::Echo => handler_fn(|p| async move { Ok(p) }),
            BuiltinHandler::Uppercase => handler_fn(|p| async move { uppercase(&p) }),
            BuiltinHandler::Double => handler_fn(|p| async move { double(&p) }),
            BuiltinHandler::Fail => handler_fn(|_| async move {
                Err::<Payload, _>(TaskmeshError::handler("the fail handler always fails"))
            }),
        }
    }
}

/// The value a handler works on: a forwarded `input` if present, then a
/// `value` field, then the payload itself.
fn operand(payload: &Payload) -> &Payload {
    payload
        .get("input")
        .or_else(|| payload.get("value"))
        .unwrap_or(payload)
}

fn uppercase(payload: &Payload) -> TaskmeshResult<Payload> {
    let operand = operand(payload);
    let text = operand
        .as_str()
        .or_else(|| operand.get("text").and_then(Payload::as_str))
        .ok_or_else(|| TaskmeshError::handler("uppercase needs a string payload"))?;
    Ok(json!(text.to_uppercase()))
}

fn double(payload: &Payload) -> TaskmeshResult<Payload> {
    let operand = operand(payload);
    if let Some(n) = operand.as_i64() {
        return n
            .checked_mul(2)
            .map(|v| json!(v))
            .ok_or_else(|| TaskmeshError::handler("double overflowed"));
    }
    operand
        .as_f64()
        .map(|v| json!(v * 2.0))
        .ok_or_else(|| TaskmeshError::handler("double needs a numeric payload"))
}
