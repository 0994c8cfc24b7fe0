//! Handlers every `weft worker` process registers.
//!
//! - `identity(x)` returns `x`.
//! - `sleep(seconds, value=None)` blocks, then returns `value`.
//! - `fail(message, kind="ValueError")` raises.

use crate::protocol::Kwargs;
use crate::task::{HandlerError, HandlerRegistry};
use serde_json::Value;
use std::time::Duration;

pub fn identity(args: &[Value], kwargs: &Kwargs) -> Result<Value, HandlerError> {
    args.first()
        .or_else(|| kwargs.get("x"))
        .cloned()
        .ok_or_else(|| HandlerError::type_error("identity() missing argument 'x'"))
}

pub fn sleep(args: &[Value], kwargs: &Kwargs) -> Result<Value, HandlerError> {
    let seconds = args
        .first()
        .or_else(|| kwargs.get("seconds"))
        .and_then(Value::as_f64)
        .ok_or_else(|| HandlerError::type_error("sleep() needs a number of seconds"))?;
    let duration = Duration::try_from_secs_f64(seconds)
        .map_err(|_| HandlerError::value_error(format!("invalid sleep of {} seconds", seconds)))?;
    std::thread::sleep(duration);
    Ok(args
        .get(1)
        .or_else(|| kwargs.get("value"))
        .cloned()
        .unwrap_or(Value::Null))
}

pub fn fail(args: &[Value], kwargs: &Kwargs) -> Result<Value, HandlerError> {
    let text = |index: usize, key: &str| {
        args.get(index)
            .or_else(|| kwargs.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let message = text(0, "message").unwrap_or_else(|| "task failed".to_string());
    let kind = text(1, "kind").unwrap_or_else(|| "ValueError".to_string());
    Err(HandlerError::new(kind, message))
}

/// Registry with the built-in handlers.
pub fn builtin_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with("identity", identity)
        .with("sleep", sleep)
        .with("fail", fail)
}
