//! Method name to handler table used for local execution.

use crate::error::{MeshError, Result};
use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A type-erased handler: decoded params in, encoded reply out.
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Handlers a node can execute locally, keyed by method name.
///
/// Built once at startup and shared with the router by `Arc`.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `method`.
    ///
    /// Params that do not decode into `Req` fail with `InvalidParams` before
    /// the handler runs.
    pub fn register<Req, Resp, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let method = method.into();
        let name = method.clone();
        let erased = move |params: Value| -> BoxFuture<'static, Result<Value>> {
            match serde_json::from_value::<Req>(params) {
                Ok(req) => {
                    let fut = handler(req);
                    async move { Ok(serde_json::to_value(fut.await?)?) }.boxed()
                }
                Err(e) => future::ready(Err(MeshError::InvalidParams {
                    message: format!("{}: {}", name, e),
                }))
                .boxed(),
            }
        };
        self.register_raw(method, Arc::new(erased))
    }

    /// Register an already type-erased handler.
    pub fn register_raw(&mut self, method: impl Into<String>, handler: Handler) -> &mut Self {
        self.handlers.insert(method.into(), handler);
        self
    }

    pub fn get(&self, method: &str) -> Option<&Handler> {
        self.handlers.get(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("methods", &self.methods())
            .finish()
    }
}
