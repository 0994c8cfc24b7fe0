//! Task handlers and the registry workers resolve callables through.
//!
//! A task names its callable by string; the worker looks the name up in the
//! [`HandlerRegistry`] it was built with. Handlers are plain Rust values
//! implementing [`TaskHandler`], so closures work out of the box.

use crate::protocol::{Kwargs, RemoteException};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a handler. Becomes a [`RemoteException`] on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
    pub traceback: Vec<String>,
}

impl HandlerError {
    pub fn new<K: Into<String>, M: Into<String>>(kind: K, message: M) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// A `ValueError`, the usual kind for bad arguments.
    pub fn value_error<M: Into<String>>(message: M) -> Self {
        Self::new("ValueError", message)
    }

    pub fn type_error<M: Into<String>>(message: M) -> Self {
        Self::new("TypeError", message)
    }

    /// Append a frame to the traceback.
    pub fn context<S: Into<String>>(mut self, frame: S) -> Self {
        self.traceback.push(frame.into());
        self
    }

    pub fn into_remote(self) -> RemoteException {
        RemoteException::new(self.kind, self.message).with_traceback(self.traceback)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        let traceback = error.chain().skip(1).map(|cause| cause.to_string()).collect();
        Self {
            kind: "Error".to_string(),
            message: error.to_string(),
            traceback,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::type_error(error.to_string())
    }
}

/// A callable that can be executed as a task.
pub trait TaskHandler: Send + Sync {
    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value, HandlerError>;
}

impl<F> TaskHandler for F
where
    F: Fn(&[Value], &Kwargs) -> Result<Value, HandlerError> + Send + Sync,
{
    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value, HandlerError> {
        self(args, kwargs)
    }
}

/// Named handlers available to a worker. Built once at configuration time.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn register<S, H>(&mut self, name: S, handler: H) -> &mut Self
    where
        S: Into<String>,
        H: TaskHandler + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<S, H>(mut self, name: S, handler: H) -> Self
    where
        S: Into<String>,
        H: TaskHandler + 'static,
    {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Callable name plus arguments, ready to be submitted.
///
/// The builder methods never fail; the first argument that does not
/// serialize is remembered and reported when the request is submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub callable: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    error: Option<String>,
}

impl TaskRequest {
    pub fn new<S: Into<String>>(callable: S) -> Self {
        Self {
            callable: callable.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            error: None,
        }
    }

    /// Append a positional argument.
    pub fn arg<T: Serialize>(mut self, value: T) -> Self {
        let position = self.args.len();
        if let Some(value) = self.encode(value, || format!("argument {}", position)) {
            self.args.push(value);
        }
        self
    }

    pub fn args<I: IntoIterator<Item = Value>>(mut self, values: I) -> Self {
        self.args.extend(values);
        self
    }

    pub fn kwarg<K: Into<String>, T: Serialize>(mut self, key: K, value: T) -> Self {
        let key = key.into();
        if let Some(value) = self.encode(value, || format!("keyword argument '{}'", key)) {
            self.kwargs.insert(key, value);
        }
        self
    }

    /// Why the request cannot be submitted, if an argument failed to
    /// serialize.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn encode<T: Serialize>(&mut self, value: T, name: impl FnOnce() -> String) -> Option<Value> {
        match serde_json::to_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(format!(
                        "{} of {}() does not serialize: {}",
                        name(),
                        self.callable,
                        e
                    ));
                }
                None
            }
        }
    }
}

/// Moves weighted-ensemble segments forward in time.
///
/// The work manager does not interpret segments; a propagator receives and
/// returns whatever the driver serialized.
pub trait Propagator: Send + Sync {
    type Segment: Serialize + DeserializeOwned;

    fn propagate(&self, segments: Vec<Self::Segment>) -> anyhow::Result<Vec<Self::Segment>>;
}

/// Exposes a [`Propagator`] as a task handler.
///
/// The task's first positional argument (or the `segments` keyword) is the
/// list of segments; the result is the propagated list.
pub struct PropagatorHandler<P> {
    propagator: P,
}

impl<P: Propagator> PropagatorHandler<P> {
    pub fn new(propagator: P) -> Self {
        Self { propagator }
    }
}

impl<P: Propagator> TaskHandler for PropagatorHandler<P> {
    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value, HandlerError> {
        let raw = args
            .first()
            .or_else(|| kwargs.get("segments"))
            .cloned()
            .ok_or_else(|| HandlerError::type_error("propagate() missing 'segments'"))?;
        let segments: Vec<P::Segment> = serde_json::from_value(raw)?;
        let propagated = self
            .propagator
            .propagate(segments)
            .map_err(|e| HandlerError::from(e).context("propagate"))?;
        Ok(serde_json::to_value(propagated)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn double(args: &[Value], _kwargs: &Kwargs) -> Result<Value, HandlerError> {
        let x = args
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| HandlerError::value_error("expected an integer"))?;
        Ok(json!(x * 2))
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::new()
            .with("double", double)
            .with("const", |_: &[Value], _: &Kwargs| Ok::<_, HandlerError>(json!("c")));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("double"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["const", "double"]);

        let handler = registry.get("double").unwrap();
        assert_eq!(handler.call(&[json!(21)], &Kwargs::new()).unwrap(), json!(42));
        let err = handler.call(&[json!("x")], &Kwargs::new()).unwrap_err();
        assert_eq!(err.kind, "ValueError");
    }

    #[test]
    fn test_task_request_builder() {
        let request = TaskRequest::new("identity").arg(1).arg("two").kwarg("flag", true);
        assert_eq!(request.callable, "identity");
        assert_eq!(request.args, vec![json!(1), json!("two")]);
        assert_eq!(request.kwargs.get("flag"), Some(&json!(true)));
        assert!(request.error().is_none());
    }

    #[test]
    fn test_task_request_keeps_first_encoding_error() {
        let mut tuple_keys = std::collections::HashMap::new();
        tuple_keys.insert((1, 2), 3);

        let request = TaskRequest::new("identity")
            .arg(1)
            .arg(&tuple_keys)
            .kwarg("bad", &tuple_keys);
        assert_eq!(request.args, vec![json!(1)]);
        assert!(request.kwargs.is_empty());
        let error = request.error().unwrap();
        assert!(error.starts_with("argument 1 of identity()"), "{}", error);

        let request = TaskRequest::new("identity").kwarg("bad", &tuple_keys);
        assert!(request.error().unwrap().contains("keyword argument 'bad'"));
    }

    #[test]
    fn test_anyhow_chain_becomes_traceback() {
        let err = anyhow::anyhow!("disk full").context("writing restart file");
        let handler_err = HandlerError::from(err);
        assert_eq!(handler_err.message, "writing restart file");
        assert_eq!(handler_err.traceback, vec!["disk full".to_string()]);

        let remote = handler_err.context("segment 3").into_remote();
        assert_eq!(remote.kind, "Error");
        assert_eq!(remote.traceback.len(), 2);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Segment {
        n_iter: u32,
        weight: f64,
    }

    struct Advance;

    impl Propagator for Advance {
        type Segment = Segment;

        fn propagate(&self, segments: Vec<Segment>) -> anyhow::Result<Vec<Segment>> {
            if segments.iter().any(|s| s.weight < 0.0) {
                anyhow::bail!("negative weight");
            }
            Ok(segments
                .into_iter()
                .map(|s| Segment {
                    n_iter: s.n_iter + 1,
                    ..s
                })
                .collect())
        }
    }

    #[test]
    fn test_propagator_handler() {
        let handler = PropagatorHandler::new(Advance);
        let segments = json!([{"n_iter": 1, "weight": 0.5}, {"n_iter": 1, "weight": 0.5}]);

        let out = handler.call(&[segments.clone()], &Kwargs::new()).unwrap();
        let out: Vec<Segment> = serde_json::from_value(out).unwrap();
        assert!(out.iter().all(|s| s.n_iter == 2));

        let mut kwargs = Kwargs::new();
        kwargs.insert("segments".into(), segments);
        assert!(handler.call(&[], &kwargs).is_ok());

        let err = handler.call(&[], &Kwargs::new()).unwrap_err();
        assert_eq!(err.kind, "TypeError");

        let bad = json!([{"n_iter": 1, "weight": -1.0}]);
        let err = handler.call(&[bad], &Kwargs::new()).unwrap_err();
        assert_eq!(err.message, "negative weight");
        assert_eq!(err.traceback, vec!["propagate".to_string()]);
    }
}
