//! Local-or-remote dispatch of mesh requests.
//!
//! Every request names the node that should execute it. The router compares
//! that destination with its own advertised address: a match runs the handler
//! in place, anything else goes to the [`RemoteInvoker`]. The receiving node
//! runs the same decision on its own router, so callers never need to know
//! where a method executes.

use super::invoker::RemoteInvoker;
use super::pool::PoolStats;
use super::protocol::{Envelope, RequestArgs};
use super::registry::HandlerTable;
use super::server::MeshDispatch;
use crate::address::NodeAddress;
use crate::error::{MeshError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Where a request will execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote(NodeAddress),
}

#[derive(Debug)]
pub struct Router {
    local: NodeAddress,
    handlers: Arc<HandlerTable>,
    invoker: RemoteInvoker,
}

impl Router {
    pub fn new(local: NodeAddress, handlers: Arc<HandlerTable>, invoker: RemoteInvoker) -> Self {
        Self {
            local,
            handlers,
            invoker,
        }
    }

    /// The address this node advertises and answers to.
    pub fn local_address(&self) -> &NodeAddress {
        &self.local
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.invoker.pool().stats()
    }

    /// Decide where a request addressed by `envelope` executes.
    pub fn route<E: Envelope + ?Sized>(&self, envelope: &E) -> Route {
        let dest = envelope.destination();
        if *dest == self.local {
            Route::Local
        } else {
            Route::Remote(dest.clone())
        }
    }

    /// Execute `method` wherever the `dest` field of `params` says.
    ///
    /// Local execution returns the handler's result untouched, with no
    /// timeout applied. Remote execution returns whatever the invoker returns.
    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        let args = RequestArgs::from_params(&params)?;
        match self.route(&args) {
            Route::Local => {
                debug!("{}: executing locally for {}", method, args.source);
                self.execute_local(method, params).await
            }
            Route::Remote(dest) => self.invoker.invoke(&dest, method, params).await,
        }
    }

    /// Typed form of [`Router::dispatch`].
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Envelope + Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let params = serde_json::to_value(request)?;
        let reply = self.dispatch(method, params).await?;
        Ok(serde_json::from_value(reply)?)
    }

    async fn execute_local(&self, method: &str, params: Value) -> Result<Value> {
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| MeshError::MethodNotFound(method.to_string()))?;
        handler(params).await
    }
}

#[async_trait::async_trait]
impl MeshDispatch for Router {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        Router::dispatch(self, method, params).await
    }
}
