//! Coordinator-call dispatch.
//!
//! Each request from a handler carries an ordered batch of calls, each with
//! its own seqno, an op tag, and raw JSON parameters. The tag selects one of
//! a closed set of variants, each with its own parameter struct so that a
//! missing field is a decode error rather than a stale value inherited from
//! an earlier call.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::process::Process;
use crate::protocol::{CoordCall, Pid, ProcessResult, Qid, Seqno};
use crate::substrate::InvokeTarget;
use crate::workload::Workload;

/// Everything a call may touch: the workload tables and the issuing process.
#[derive(Clone)]
pub(crate) struct CallCtx {
    pub workload: Arc<Workload>,
    pub process: Arc<Process>,
}

/// Result of one handled coordinator call. `done` is true only for `exit`.
#[derive(Debug)]
pub(crate) struct CallReply {
    pub result: Value,
    pub done: bool,
}

impl CallReply {
    fn result(result: Value) -> Self {
        CallReply {
            result,
            done: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unrecognized coordinator call: {op}({params})")]
    UnrecognizedOp { op: String, params: String },
    #[error("{op}: malformed parameters: {source}")]
    BadParams {
        op: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{op}: no process exists with pid {pid}")]
    UnknownPid { op: &'static str, pid: Pid },
    #[error("{op}: no queue exists with qid {qid}")]
    UnknownQueue { op: &'static str, qid: Qid },
    #[error("remap_store: {0}")]
    Store(#[source] anyhow::Error),
}

#[derive(Debug, Deserialize)]
struct ExitParams {
    result: ProcessResult,
}

#[derive(Debug, Deserialize)]
struct SpawnParams {
    name: String,
    child_chk_id: String,
    /// Processes whose return values the children consume.
    future_pids: Vec<Pid>,
    /// Processes that must merely finish before the children start.
    await_pids: Vec<Pid>,
    blocking: bool,
    copies: u64,
    on_coordinator: bool,
}

#[derive(Debug, Deserialize)]
struct MapSpawnParams {
    name: String,
    child_chk_id: String,
    future_pids: Vec<Pid>,
    elems: Vec<String>,
    await_pids: Vec<Pid>,
    on_coordinator: bool,
}

#[derive(Debug, Deserialize)]
struct WaitParams {
    pid: Pid,
}

#[derive(Debug, Deserialize)]
struct CreateQueueParams {
    max_size: usize,
    /// -1 creates a single queue; otherwise a list of `copies` queues.
    copies: i64,
}

#[derive(Debug, Deserialize)]
struct EnqueueParams {
    qid: Qid,
    /// Serialized objects, treated as opaque blobs.
    objs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DequeueParams {
    qid: Qid,
}

#[derive(Debug, Deserialize)]
struct RemapStoreParams {
    tmp_bucket: String,
    tmp_key: String,
    bucket: String,
    key: String,
}

#[derive(Debug)]
enum ParsedCall {
    Exit(ExitParams),
    Checkpoint,
    Spawn(SpawnParams),
    MapSpawn(MapSpawnParams),
    Wait(WaitParams),
    CreateQueue(CreateQueueParams),
    Enqueue(EnqueueParams),
    Dequeue(DequeueParams),
    RemapStore(RemapStoreParams),
}

fn parse_params<'a, T: Deserialize<'a>>(op: &str, raw: &'a str) -> Result<T, DispatchError> {
    serde_json::from_str(raw).map_err(|source| DispatchError::BadParams {
        op: op.to_string(),
        source,
    })
}

fn parse_call(cc: &CoordCall) -> Result<ParsedCall, DispatchError> {
    let raw = cc.params.get();
    match cc.op.as_str() {
        "exit" => Ok(ParsedCall::Exit(parse_params(&cc.op, raw)?)),
        // The checkpoint itself is taken by virtue of calling; nothing to do.
        "checkpoint" => Ok(ParsedCall::Checkpoint),
        "spawn" => Ok(ParsedCall::Spawn(parse_params(&cc.op, raw)?)),
        "map_spawn" => Ok(ParsedCall::MapSpawn(parse_params(&cc.op, raw)?)),
        "wait" => Ok(ParsedCall::Wait(parse_params(&cc.op, raw)?)),
        "create_queue" => Ok(ParsedCall::CreateQueue(parse_params(&cc.op, raw)?)),
        "enqueue" => Ok(ParsedCall::Enqueue(parse_params(&cc.op, raw)?)),
        "dequeue" => Ok(ParsedCall::Dequeue(parse_params(&cc.op, raw)?)),
        "remap_store" => Ok(ParsedCall::RemapStore(parse_params(&cc.op, raw)?)),
        _ => Err(DispatchError::UnrecognizedOp {
            op: cc.op.clone(),
            params: raw.to_string(),
        }),
    }
}

fn spawn_target(on_coordinator: bool) -> InvokeTarget {
    if on_coordinator {
        InvokeTarget::OnCoordinator
    } else {
        InvokeTarget::OnLambda
    }
}

/// Wait for every pid in `await_pids` to finish, then collect the return
/// values of `future_pids` (waiting on them too).
async fn gather_dependencies(
    op: &'static str,
    workload: &Workload,
    await_pids: &[Pid],
    future_pids: &[Pid],
) -> Result<BTreeMap<u64, ProcessResult>, DispatchError> {
    for pid in await_pids {
        let p = workload
            .process(*pid)
            .ok_or(DispatchError::UnknownPid { op, pid: *pid })?;
        p.wait_done().await;
    }

    let mut pred_res = BTreeMap::new();
    for pid in future_pids {
        let p = workload
            .process(*pid)
            .ok_or(DispatchError::UnknownPid { op, pid: *pid })?;
        p.wait_done().await;
        pred_res.insert(pid.0, p.return_value());
    }
    Ok(pred_res)
}

impl ParsedCall {
    async fn run(self, ctx: &CallCtx) -> Result<CallReply, DispatchError> {
        match self {
            ParsedCall::Exit(p) => {
                ctx.process.complete(p.result);
                Ok(CallReply {
                    result: Value::Null,
                    done: true,
                })
            }

            ParsedCall::Checkpoint => Ok(CallReply::result(Value::Null)),

            ParsedCall::Spawn(p) => {
                let target = spawn_target(p.on_coordinator);
                let mut children = Vec::with_capacity(p.copies as usize);
                for _ in 0..p.copies {
                    let child = ctx.workload.create_process(&p.name, target);
                    children.push(Arc::clone(&child));

                    // The child is visible (and waitable) immediately, but
                    // doesn't start until everything it depends on finished.
                    let workload = Arc::clone(&ctx.workload);
                    let chk_id = p.child_chk_id.clone();
                    let await_pids = p.await_pids.clone();
                    let future_pids = p.future_pids.clone();
                    tokio::spawn(async move {
                        match gather_dependencies(
                            "spawn",
                            &workload,
                            &await_pids,
                            &future_pids,
                        )
                        .await
                        {
                            Ok(pred_res) => {
                                let pred_res =
                                    serde_json::to_value(pred_res).unwrap_or(Value::Null);
                                workload.start_process(child, chk_id, Value::Null, pred_res);
                            }
                            Err(err) => workload.report_fatal(anyhow::Error::new(err)),
                        }
                    });
                }

                if p.blocking {
                    let mut rets = Vec::with_capacity(children.len());
                    for child in &children {
                        child.wait_done().await;
                        rets.push(child.return_value());
                    }
                    Ok(CallReply::result(json!({ "rets": rets })))
                } else {
                    let pids: Vec<Pid> = children.iter().map(|c| c.pid).collect();
                    Ok(CallReply::result(json!({ "child_pids": pids })))
                }
            }

            ParsedCall::MapSpawn(p) => {
                let target = spawn_target(p.on_coordinator);
                let children: Vec<Arc<Process>> = p
                    .elems
                    .iter()
                    .map(|_| ctx.workload.create_process(&p.name, target))
                    .collect();
                let pids: Vec<Pid> = children.iter().map(|c| c.pid).collect();

                // One waiter gathers the shared dependencies, then releases
                // every child with its own element.
                let workload = Arc::clone(&ctx.workload);
                let chk_id = p.child_chk_id;
                let await_pids = p.await_pids;
                let future_pids = p.future_pids;
                let elems = p.elems;
                tokio::spawn(async move {
                    let pred_res = async {
                        let mut pred_res = BTreeMap::new();
                        for pid in &future_pids {
                            let proc = workload.process(*pid).ok_or(DispatchError::UnknownPid {
                                op: "map_spawn",
                                pid: *pid,
                            })?;
                            proc.wait_done().await;
                            pred_res.insert(pid.0, proc.return_value());
                        }
                        for pid in &await_pids {
                            let proc = workload.process(*pid).ok_or(DispatchError::UnknownPid {
                                op: "map_spawn",
                                pid: *pid,
                            })?;
                            proc.wait_done().await;
                        }
                        Ok::<_, DispatchError>(pred_res)
                    }
                    .await;

                    match pred_res {
                        Ok(pred_res) => {
                            let pred_res = serde_json::to_value(pred_res).unwrap_or(Value::Null);
                            for (child, elem) in children.into_iter().zip(elems) {
                                workload.start_process(
                                    child,
                                    chk_id.clone(),
                                    Value::Null,
                                    json!([pred_res, elem]),
                                );
                            }
                        }
                        Err(err) => workload.report_fatal(anyhow::Error::new(err)),
                    }
                });

                Ok(CallReply::result(json!(pids)))
            }

            ParsedCall::Wait(p) => {
                // The runtime can only issue wait against a pid it received
                // from spawn, so a miss is a protocol violation.
                let target = ctx
                    .workload
                    .process(p.pid)
                    .ok_or(DispatchError::UnknownPid {
                        op: "wait",
                        pid: p.pid,
                    })?;
                target.wait_done().await;
                Ok(CallReply::result(Value::String(target.return_value())))
            }

            ParsedCall::CreateQueue(p) => {
                if p.copies == -1 {
                    let qid = ctx.workload.create_queue(p.max_size);
                    Ok(CallReply::result(json!(qid)))
                } else {
                    let qids: Vec<Qid> = (0..p.copies)
                        .map(|_| ctx.workload.create_queue(p.max_size))
                        .collect();
                    Ok(CallReply::result(json!(qids)))
                }
            }

            ParsedCall::Enqueue(p) => {
                let queue =
                    ctx.workload
                        .queue(p.qid)
                        .ok_or(DispatchError::UnknownQueue {
                            op: "enqueue",
                            qid: p.qid,
                        })?;
                for obj in p.objs {
                    queue.push(obj).await;
                }
                Ok(CallReply::result(Value::Null))
            }

            ParsedCall::Dequeue(p) => {
                let queue =
                    ctx.workload
                        .queue(p.qid)
                        .ok_or(DispatchError::UnknownQueue {
                            op: "dequeue",
                            qid: p.qid,
                        })?;
                let obj = queue.pop().await;
                Ok(CallReply::result(Value::String(obj)))
            }

            ParsedCall::RemapStore(p) => {
                ctx.workload
                    .store()
                    .rename(&p.tmp_bucket, &p.tmp_key, &p.bucket, &p.key)
                    .await
                    .map_err(DispatchError::Store)?;
                Ok(CallReply::result(Value::Null))
            }
        }
    }
}

/// Run a request's calls against the issuing process.
///
/// Calls whose seqno is below `process_seqno` are stale duplicates and are
/// skipped. The remaining calls execute in order on a background task;
/// execution stops at the first call that completes the process or fails,
/// and the receiver yields the outcome of the last executed call.
///
/// Parse failures are reported synchronously; they are fatal for the
/// workload.
pub(crate) fn dispatch_request(
    ctx: CallCtx,
    calls: &[CoordCall],
    process_seqno: Seqno,
) -> Result<oneshot::Receiver<Result<CallReply, DispatchError>>, DispatchError> {
    let mut parsed = Vec::with_capacity(calls.len());
    for cc in calls {
        if cc.seqno < process_seqno {
            debug!(
                process = %ctx.process.name,
                seqno = %process_seqno,
                call_seqno = %cc.seqno,
                call = %cc,
                "skipping outdated call"
            );
            continue;
        }
        debug!(process = %ctx.process.name, seqno = %cc.seqno, call = %cc, "coordinator call");
        parsed.push(parse_call(cc)?);
    }

    let (tx, rx) = oneshot::channel();

    if parsed.is_empty() {
        warn!(
            process = %ctx.process.name,
            seqno = %process_seqno,
            "entire request is outdated"
        );
        let _ = tx.send(Ok(CallReply {
            result: Value::Null,
            done: false,
        }));
        return Ok(rx);
    }

    tokio::spawn(async move {
        let mut outcome = Ok(CallReply {
            result: Value::Null,
            done: false,
        });
        for call in parsed {
            outcome = call.run(&ctx).await;
            match &outcome {
                Ok(reply) if !reply.done => {}
                _ => break,
            }
        }
        let _ = tx.send(outcome);
    });

    Ok(rx)
}
