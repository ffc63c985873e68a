//! Process records and the per-process driver loop.
//!
//! A process is a logical thread of control carried by a sequence of handler
//! invocations. Its driver alternates between two events: completion of the
//! outstanding invocation, and arrival of an asynchronous coordinator-call
//! request over the RPC intake. Both paths funnel into
//! [`crate::coord_call::dispatch_request`]; the seqno discipline in
//! [`RunState::update`] is what makes a call delivered on both paths take
//! effect exactly once.

use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::coord_call::{dispatch_request, CallCtx, CallReply, DispatchError};
use crate::protocol::{Pid, ProcessResult, Request, Seqno};
use crate::rpc::{RpcCall, RpcReply};
use crate::substrate::{InvokeTarget, SubstrateError};
use crate::workload::Workload;

/// A handler crash is fatal after this many consecutive retries.
pub const CRASH_RETRIES: u32 = 3;

pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub target: InvokeTarget,

    rpc_tx: mpsc::Sender<RpcCall>,
    /// Taken by the driver when the process starts running.
    rpc_rx: Mutex<Option<mpsc::Receiver<RpcCall>>>,

    done: watch::Sender<bool>,
    /// Written by `exit` before the completion signal closes; read only
    /// after [`Process::wait_done`] returns.
    ret: OnceLock<ProcessResult>,
}

impl Process {
    pub(crate) fn new(pid: Pid, name: String, target: InvokeTarget) -> Arc<Self> {
        let (rpc_tx, rpc_rx) = mpsc::channel(1);
        let (done, _) = watch::channel(false);
        Arc::new(Process {
            pid,
            name,
            target,
            rpc_tx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            done,
            ret: OnceLock::new(),
        })
    }

    pub(crate) fn rpc_sender(&self) -> mpsc::Sender<RpcCall> {
        self.rpc_tx.clone()
    }

    /// Suspend until the process's completion signal closes.
    pub async fn wait_done(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// The process return value. Meaningful only after [`Self::wait_done`].
    pub fn return_value(&self) -> ProcessResult {
        self.ret.get().cloned().unwrap_or_default()
    }

    /// Record the return value and close the completion signal.
    pub(crate) fn complete(&self, result: ProcessResult) {
        let _ = self.ret.set(result);
        // send_replace updates the value even when nobody subscribed yet.
        self.done.send_replace(true);
    }

    fn take_rpc_receiver(&self) -> mpsc::Receiver<RpcCall> {
        self.rpc_rx
            .lock()
            .expect("rpc receiver lock poisoned")
            .take()
            .expect("process driver started twice")
    }
}

/// Driver-private run-state.
#[derive(Debug)]
pub(crate) struct RunState {
    /// Result of the last accepted coordinator call, fed into the next
    /// invocation.
    pub result: Value,
    /// Sequence number the next accepted coordinator call must carry.
    pub next_seqno: Seqno,
    /// Checkpoint id the next invocation resumes from.
    pub chk_id: String,
}

impl RunState {
    /// Advance after `req` was handled with result `result`. Requests whose
    /// seqno already passed never move the state; this is the at-most-once
    /// rule for duplicate delivery across the sync and RPC paths.
    pub(crate) fn update(&mut self, req: &Request, result: Value) {
        if req.seqno < self.next_seqno {
            return;
        }
        *self = RunState {
            result,
            next_seqno: req.seqno.next(),
            chk_id: req.chk_id.clone(),
        };
    }
}

enum DriverEvent {
    Invocation(Result<Request, SubstrateError>),
    Rpc(RpcCall),
}

/// Drive a process to completion. Returns when the process exits or after
/// reporting a fatal error to the workload.
pub(crate) async fn run(
    workload: Arc<Workload>,
    process: Arc<Process>,
    starting_chk_id: String,
    app_event: Value,
    call_result: Value,
) {
    let mut rpc_rx = process.take_rpc_receiver();
    let ctx = CallCtx {
        workload: Arc::clone(&workload),
        process: Arc::clone(&process),
    };

    let mut state = RunState {
        result: call_result,
        next_seqno: Seqno(0),
        chk_id: starting_chk_id,
    };
    let mut crashes: u32 = 0;
    let mut inflight: Option<oneshot::Receiver<Result<Request, SubstrateError>>> = None;

    loop {
        if inflight.is_none() {
            // With no invocation running, every call made so far has
            // seqno < state.next_seqno, so future calls sort after it.
            inflight = Some(workload.handler().invoke_async(
                process.pid,
                state.next_seqno,
                state.chk_id.clone(),
                state.result.clone(),
                app_event.clone(),
                process.target,
            ));
            debug!(process = %process.name, seqno = %state.next_seqno, "begin invocation");
        }

        let event = {
            let invoke_rx = inflight.as_mut().expect("invocation in flight");
            tokio::select! {
                outcome = invoke_rx => DriverEvent::Invocation(outcome.unwrap_or_else(|_| {
                    Err(SubstrateError::Other(anyhow::anyhow!(
                        "invocation task dropped without a result"
                    )))
                })),
                Some(call) = rpc_rx.recv() => DriverEvent::Rpc(call),
            }
        };

        let (req, reply) = match event {
            DriverEvent::Invocation(outcome) => {
                inflight = None;
                debug!(process = %process.name, seqno = %state.next_seqno, "end invocation");

                let req = match outcome {
                    Err(SubstrateError::Crashed { message, .. }) => {
                        crashes += 1;
                        if crashes > CRASH_RETRIES {
                            workload.process_fatal(
                                &process,
                                state.next_seqno,
                                format!("handler crashed: {message}"),
                            );
                            return;
                        }
                        warn!(
                            process = %process.name,
                            seqno = %state.next_seqno,
                            attempt = crashes,
                            error = %message,
                            "handler crashed, restarting"
                        );
                        continue;
                    }
                    Err(SubstrateError::Timeout { .. }) => {
                        crashes = 0;
                        info!(
                            process = %process.name,
                            seqno = %state.next_seqno,
                            "handler timed out, restarting"
                        );
                        continue;
                    }
                    Err(err) => {
                        workload.process_fatal(&process, state.next_seqno, err);
                        return;
                    }
                    Ok(req) => req,
                };
                crashes = 0;

                if req.blocked {
                    // The handler suspended awaiting an earlier async call.
                    debug!(process = %process.name, seqno = %state.next_seqno, "handler blocked");
                    continue;
                }

                if req.seqno < state.next_seqno {
                    // Duplicate of a request already resolved via RPC.
                    debug!(
                        process = %process.name,
                        seqno = %state.next_seqno,
                        request_seqno = %req.seqno,
                        request = %req.summary(),
                        "outdated synchronous request"
                    );
                    continue;
                }

                let result_rx =
                    match dispatch_request(ctx.clone(), &req.calls, state.next_seqno) {
                        Ok(rx) => rx,
                        Err(err) => {
                            workload.process_fatal(&process, state.next_seqno, err);
                            return;
                        }
                    };
                match await_dispatch(result_rx).await {
                    Ok(reply) => (req, reply),
                    Err(err) => {
                        workload.process_fatal(&process, state.next_seqno, err);
                        return;
                    }
                }
            }

            DriverEvent::Rpc(RpcCall { req, reply }) => {
                // Always answer, whatever happens, so the RPC task never
                // hangs.
                if req.seqno < state.next_seqno {
                    warn!(
                        process = %process.name,
                        seqno = %state.next_seqno,
                        request_seqno = %req.seqno,
                        request = %req.summary(),
                        "outdated RPC"
                    );
                    let _ = reply.send(RpcReply::Ok(Value::Null));
                    continue;
                }

                let mut result_rx =
                    match dispatch_request(ctx.clone(), &req.calls, state.next_seqno) {
                        Ok(rx) => rx,
                        Err(err) => {
                            let _ = reply.send(RpcReply::Err(err.to_string()));
                            workload.process_fatal(&process, state.next_seqno, err);
                            return;
                        }
                    };

                let outcome =
                    match tokio::time::timeout(workload.rpc_timeout(), &mut result_rx).await {
                        Ok(received) => {
                            let outcome = flatten_dispatch(received);
                            match &outcome {
                                Ok(r) => {
                                    let _ = reply.send(RpcReply::Ok(r.result.clone()));
                                }
                                Err(err) => {
                                    let _ = reply.send(RpcReply::Err(err.to_string()));
                                }
                            }
                            outcome
                        }
                        Err(_elapsed) => {
                            // The call is blocking; tell the handler to
                            // checkpoint and release the lambda, then keep
                            // waiting for the authoritative result.
                            let _ = reply.send(RpcReply::WouldBlock);
                            debug!(
                                process = %process.name,
                                seqno = %state.next_seqno,
                                "rpc would block"
                            );
                            flatten_dispatch((&mut result_rx).await)
                        }
                    };

                match outcome {
                    Ok(reply) => (req, reply),
                    Err(err) => {
                        workload.process_fatal(&process, state.next_seqno, err);
                        return;
                    }
                }
            }
        };

        // A coordinator call was handled on one of the two paths; fold its
        // outcome into the run-state.
        if reply.done {
            return;
        }
        state.update(&req, reply.result);
    }
}

async fn await_dispatch(
    rx: oneshot::Receiver<Result<CallReply, DispatchError>>,
) -> anyhow::Result<CallReply> {
    flatten_dispatch(rx.await)
}

fn flatten_dispatch(
    received: Result<Result<CallReply, DispatchError>, oneshot::error::RecvError>,
) -> anyhow::Result<CallReply> {
    match received {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(err)) => Err(anyhow::Error::new(err)),
        Err(_) => Err(anyhow::anyhow!("dispatch task dropped without a result")),
    }
}
