//! Test scaffolding: a programmable substrate for exercising the driver
//! without subprocesses.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::protocol::{InvocationEvent, Pid, Seqno};
use crate::substrate::{Substrate, SubstrateError};

/// What a scripted invocation does.
pub enum ScriptedResponse {
    /// Return this request object, double-encoded onto the wire the way a
    /// real handler return is.
    Reply(Value),
    /// Fail the invocation as a wall-clock timeout.
    Timeout,
    /// Fail the invocation as a crash with the given message.
    Crash(String),
    /// Fail the invocation with an unclassified error.
    Fail(String),
    /// Park until the notify fires, then produce the inner response. Lets a
    /// test hold an invocation open while it drives the RPC path.
    AfterNotified(Arc<Notify>, Box<ScriptedResponse>),
}

/// A [`Substrate`] whose behavior is a closure over the decoded invocation
/// event and the running invocation count. Every invocation is recorded.
pub struct ScriptedSubstrate {
    name: String,
    script: Box<dyn Fn(InvocationEvent, usize) -> ScriptedResponse + Send + Sync>,
    invocations: Mutex<Vec<InvocationEvent>>,
}

impl ScriptedSubstrate {
    pub fn new(
        name: &str,
        script: impl Fn(InvocationEvent, usize) -> ScriptedResponse + Send + Sync + 'static,
    ) -> Self {
        ScriptedSubstrate {
            name: name.to_string(),
            script: Box::new(script),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// A substrate for tests that must never invoke anything.
    pub fn unreachable(name: &str) -> Self {
        ScriptedSubstrate::new(name, |event, _| {
            panic!("unexpected invocation for pid {}", event.pid)
        })
    }

    /// Every invocation event seen so far, in order.
    pub fn invocations(&self) -> Vec<InvocationEvent> {
        self.invocations
            .lock()
            .expect("invocation log lock poisoned")
            .clone()
    }
}

#[async_trait]
impl Substrate for ScriptedSubstrate {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout_secs(&self) -> u64 {
        300
    }

    async fn invoke(&self, payload: Vec<u8>) -> Result<Vec<u8>, SubstrateError> {
        let event: InvocationEvent = serde_json::from_slice(&payload)
            .map_err(|err| SubstrateError::Other(anyhow::Error::new(err)))?;

        let count = {
            let mut log = self
                .invocations
                .lock()
                .expect("invocation log lock poisoned");
            log.push(event.clone());
            log.len() - 1
        };

        let mut response = (self.script)(event, count);
        let response = loop {
            match response {
                ScriptedResponse::AfterNotified(notify, inner) => {
                    notify.notified().await;
                    response = *inner;
                }
                other => break other,
            }
        };

        match response {
            ScriptedResponse::Reply(request) => {
                let inner = serde_json::to_string(&request)
                    .map_err(|err| SubstrateError::Other(anyhow::Error::new(err)))?;
                serde_json::to_vec(&inner)
                    .map_err(|err| SubstrateError::Other(anyhow::Error::new(err)))
            }
            ScriptedResponse::Timeout => Err(SubstrateError::Timeout {
                name: self.name.clone(),
                timeout_secs: self.timeout_secs(),
            }),
            ScriptedResponse::Crash(message) => Err(SubstrateError::Crashed {
                name: self.name.clone(),
                message,
            }),
            ScriptedResponse::Fail(message) => {
                Err(SubstrateError::Other(anyhow::anyhow!(message)))
            }
            ScriptedResponse::AfterNotified(_, _) => {
                unreachable!("resolved by the loop above")
            }
        }
    }

    async fn finalize(&self) {}
}

/// Build a request object for a scripted reply.
pub fn request(pid: Pid, seqno: Seqno, chk_id: &str, calls: Vec<Value>) -> Value {
    json!({
        "pid": pid,
        "seqno": seqno,
        "chk_id": chk_id,
        "calls": calls,
        "blocked": false,
        "err": null,
    })
}

/// Build the request a handler returns when it suspends on an earlier
/// asynchronous call.
pub fn blocked_request(pid: Pid, seqno: Seqno) -> Value {
    json!({
        "pid": pid,
        "seqno": seqno,
        "chk_id": "",
        "calls": [],
        "blocked": true,
        "err": null,
    })
}

/// Build a single coordinator call for a scripted reply.
pub fn call(seqno: Seqno, op: &str, params: Value) -> Value {
    json!({ "seqno": seqno, "op": op, "params": params })
}
