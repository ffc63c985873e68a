//! Execution substrate abstraction.
//!
//! A [`Substrate`] runs one handler invocation: JSON payload in, JSON
//! response out, with failures classified into the three categories the
//! driver acts on (timeout, crash, everything else). The concrete local
//! subprocess binding lives in [`crate::substrate_local`]; remote bindings
//! plug in through the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::{self, InvocationEvent, Pid, Request, Seqno};

/// Where a process's invocations execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeTarget {
    /// In a subprocess on the coordinator host, with no time limit.
    OnCoordinator,
    /// On the remote substrate, subject to its wall-clock budget.
    OnLambda,
}

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("handler \"{name}\" exceeded the time limit of {timeout_secs} sec")]
    Timeout { name: String, timeout_secs: u64 },
    #[error("handler \"{name}\" crashed with error message:\n{message}")]
    Crashed { name: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A single-shot handler executor. Must be safe for concurrent `invoke`.
#[async_trait]
pub trait Substrate: Send + Sync {
    fn name(&self) -> &str;

    fn timeout_secs(&self) -> u64;

    /// Execute one invocation with the given JSON payload.
    async fn invoke(&self, payload: Vec<u8>) -> Result<Vec<u8>, SubstrateError>;

    /// Release resources. Errors are logged, not surfaced.
    async fn finalize(&self);
}

/// The pair of substrate handlers a workload invokes against, one per
/// [`InvokeTarget`].
#[derive(Clone)]
pub struct HandlerSet {
    on_coordinator: Arc<dyn Substrate>,
    on_lambda: Arc<dyn Substrate>,
}

impl HandlerSet {
    pub fn new(on_coordinator: Arc<dyn Substrate>, on_lambda: Arc<dyn Substrate>) -> Self {
        HandlerSet {
            on_coordinator,
            on_lambda,
        }
    }

    /// A set that routes both targets to the same handler.
    pub fn single(handler: Arc<dyn Substrate>) -> Self {
        HandlerSet {
            on_coordinator: Arc::clone(&handler),
            on_lambda: handler,
        }
    }

    fn select(&self, target: InvokeTarget) -> &Arc<dyn Substrate> {
        match target {
            InvokeTarget::OnCoordinator => &self.on_coordinator,
            InvokeTarget::OnLambda => &self.on_lambda,
        }
    }

    /// Start an invocation on a background task; the receiver yields the
    /// parsed request or a classified failure.
    pub(crate) fn invoke_async(
        &self,
        pid: Pid,
        seqno: Seqno,
        chk_id: String,
        coord_call_result: Value,
        app_event: Value,
        target: InvokeTarget,
    ) -> oneshot::Receiver<Result<Request, SubstrateError>> {
        let handler = Arc::clone(self.select(target));
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let event = InvocationEvent {
                pid,
                seqno,
                chk_id,
                coord_call_result,
                app_event,
            };
            let _ = tx.send(invoke_once(handler.as_ref(), &event).await);
        });
        rx
    }

    pub async fn finalize(&self) {
        self.on_coordinator.finalize().await;
        if !Arc::ptr_eq(&self.on_coordinator, &self.on_lambda) {
            self.on_lambda.finalize().await;
        }
        debug!("substrate handlers finalized");
    }
}

async fn invoke_once(
    handler: &dyn Substrate,
    event: &InvocationEvent,
) -> Result<Request, SubstrateError> {
    let payload =
        serde_json::to_vec(event).map_err(|err| SubstrateError::Other(anyhow::Error::new(err)))?;

    let response = handler.invoke(payload).await?;

    protocol::parse_wrapped_request(&response)
        .map_err(|err| SubstrateError::Other(anyhow::Error::new(err)))
}
