//! Named request/response methods callable over the socket.
//!
//! An inbound `rpc` envelope carries `{"method": .., "params": ..}` in its
//! data and an optional correlation `id`. The hub looks the method up in its
//! [`RpcTable`], awaits the handler and answers the calling connection with an
//! `rpc_response` envelope whose data is an [`RpcResponse`].
//!
//! Any `async` closure taking a [`serde_json::Value`] is a handler:
//!
//! ```
//! use serde_json::{Value, json};
//! use wshub_core::rpc::RpcTable;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> wshub_core::Result<()> {
//! let table = RpcTable::new();
//! table.register("echo", |params: Value| async move { Ok(params) });
//!
//! assert_eq!(table.call("echo", json!({"x": 1})).await?, json!({"x": 1}));
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// A method callable through [`RpcTable::call`].
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Runs the method with the request's params.
    async fn call(&self, params: Value) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, params: Value) -> Result<Value> {
        (self)(params).await
    }
}

/// Payload of an inbound `rpc` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Registered method name.
    pub method: String,
    /// Method arguments; `null` when absent.
    #[serde(default)]
    pub params: Value,
}

/// Payload of an `rpc_response` envelope.
///
/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation id copied from the request envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Handler output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// A successful response.
    pub fn ok(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    pub fn err(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Builds the response for the outcome of a call.
    pub fn from_result(id: Option<String>, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(value) => Self::ok(id, value),
            Err(e) => Self::err(id, e.to_string()),
        }
    }
}

/// Method name to handler table. Safe to share across tasks.
#[derive(Default)]
pub struct RpcTable {
    methods: DashMap<String, Arc<dyn RpcHandler>>,
}

impl RpcTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async function under `name`, replacing any previous
    /// handler.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register_handler(name, handler);
    }

    /// Registers any [`RpcHandler`] under `name`, replacing any previous
    /// handler.
    pub fn register_handler<H: RpcHandler>(&self, name: impl Into<String>, handler: H) {
        let name = name.into();
        debug!("Registered RPC method {}", name);
        self.methods.insert(name, Arc::new(handler));
    }

    /// Removes the handler for `name`. Returns `false` if there was none.
    pub fn unregister(&self, name: &str) -> bool {
        self.methods.remove(name).is_some()
    }

    /// Returns `true` if `name` has a handler.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Invokes the handler registered under `name`.
    ///
    /// # Errors
    ///
    /// [`Error::MethodNotFound`] if nothing is registered under `name`;
    /// otherwise whatever the handler returns.
    pub async fn call(&self, name: &str, params: Value) -> Result<Value> {
        // Release the shard guard before awaiting the handler.
        let handler = self
            .methods
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::MethodNotFound(name.to_string()))?;
        handler.call(params).await
    }
}

impl std::fmt::Debug for RpcTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTable")
            .field("methods", &self.methods())
            .finish()
    }
}
