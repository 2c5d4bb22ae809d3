use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use exthost_protocol::{RemoteError, RemoteErrorKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::transform::{Args, CoercionError, ParamType};

/// What a handler receives for one inbound call.
pub struct Invocation {
    pub args: Args,
    /// Cancelled when the caller gives up or the session shuts down.
    pub cancel: CancellationToken,
}

pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;
pub type Handler = Arc<dyn Fn(Invocation) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    InvalidArguments(#[from] CoercionError),
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(message: impl fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }

    pub(crate) fn into_remote(self) -> RemoteError {
        let kind = match &self {
            HandlerError::InvalidArguments(_) => RemoteErrorKind::InvalidArguments,
            HandlerError::Failed(_) => RemoteErrorKind::HandlerFailed,
            HandlerError::Cancelled => RemoteErrorKind::Cancelled,
        };
        RemoteError::new(kind, self.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Failed(format!("failed to encode result: {err}"))
    }
}

/// Encodes a handler's typed result.
pub fn reply<T: Serialize>(value: T) -> Result<Value, HandlerError> {
    Ok(serde_json::to_value(value)?)
}

#[derive(Clone)]
pub struct MethodSpec {
    pub params: Vec<ParamType>,
    pub handler: Handler,
}

impl fmt::Debug for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSpec")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Method name → declared parameters + handler, for one identifier.
#[derive(Clone, Default, Debug)]
pub struct MethodTable {
    methods: HashMap<String, MethodSpec>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F, Fut>(mut self, name: &str, params: &[ParamType], handler: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |invocation| handler(invocation).boxed());
        self.methods.insert(
            name.to_string(),
            MethodSpec {
                params: params.to_vec(),
                handler,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn table_invokes_registered_handler() {
        let table = MethodTable::new().method("add", &[ParamType::Int, ParamType::Int], |inv| async move {
            reply(inv.args.i64(0)? + inv.args.i64(1)?)
        });
        let spec = table.get("add").expect("registered");
        assert_eq!(spec.params, vec![ParamType::Int, ParamType::Int]);
        let result = (spec.handler)(Invocation {
            args: Args::new(vec![json!(2), json!(40)]),
            cancel: CancellationToken::new(),
        })
        .await
        .unwrap();
        assert_eq!(result, json!(42));
        assert!(table.get("sub").is_none());
    }

    #[test]
    fn handler_errors_map_to_remote_kinds() {
        let invalid = HandlerError::from(CoercionError::NotIntegral { index: 0, value: 0.5 });
        assert_eq!(invalid.into_remote().kind, RemoteErrorKind::InvalidArguments);
        assert_eq!(
            HandlerError::failed("boom").into_remote(),
            RemoteError::new(RemoteErrorKind::HandlerFailed, "boom")
        );
        assert_eq!(HandlerError::Cancelled.into_remote().kind, RemoteErrorKind::Cancelled);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let payload: Box<dyn Any + Send> = Box::new("bad state");
        assert_eq!(panic_message(payload.as_ref()), "handler panicked: bad state");
        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(payload.as_ref()), "handler panicked");
    }
}
