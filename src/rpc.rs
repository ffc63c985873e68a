//! HTTP RPC endpoint for asynchronous coordinator calls.
//!
//! Handlers POST a request to `/` to resolve a coordinator call without
//! releasing the lambda; `/ping` answers `pong` so the controller can tell
//! when the listener is reachable. The endpoint only routes: the bounded
//! RPC wait happens inside the process driver, which always replies.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::protocol::{self, Request};
use crate::workload::Workload;

/// A coordinator-call request delivered to a process over its RPC intake.
pub(crate) struct RpcCall {
    pub req: Request,
    pub reply: oneshot::Sender<RpcReply>,
}

/// The driver's answer to an RPC.
#[derive(Debug)]
pub(crate) enum RpcReply {
    Ok(Value),
    /// The dispatched call is blocking; the caller should checkpoint and
    /// release the lambda.
    WouldBlock,
    Err(String),
}

pub fn router(workload: Arc<Workload>) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/ping", get(ping))
        .with_state(workload)
}

/// Serve the RPC endpoint until the process exits.
pub async fn serve(listener: TcpListener, workload: Arc<Workload>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "launching RPC server");
    axum::serve(listener, router(workload))
        .await
        .context("RPC server exited")
}

/// Poll `/ping` until the listener answers, so handlers launched afterwards
/// can always reach the coordinator.
pub async fn wait_until_ready(addr: SocketAddr) -> Result<()> {
    const POLL_INTERVAL: Duration = Duration::from_millis(500);
    let url = format!("http://{addr}/ping");
    loop {
        match reqwest::get(&url).await {
            Ok(resp) => {
                let body = resp.text().await.unwrap_or_default();
                if body == "pong" {
                    info!("RPC server is up");
                    return Ok(());
                }
                warn!(body = %body, "unexpected ping response, retrying");
            }
            Err(err) => {
                debug!(error = %err, "RPC server not ready, retrying");
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn ping() -> &'static str {
    "pong"
}

async fn handle_rpc(State(workload): State<Arc<Workload>>, body: String) -> Response {
    let req = match protocol::parse_request(body.as_bytes()) {
        Ok(req) => req,
        Err(err) => {
            return rpc_error(StatusCode::BAD_REQUEST, format!("parse body: {err}"));
        }
    };

    let Some(process) = workload.process(req.pid) else {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            format!("process not found: {}", req.pid),
        );
    };

    let seqno = req.seqno;
    let (reply_tx, reply_rx) = oneshot::channel();
    if process
        .rpc_sender()
        .send(RpcCall {
            req,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        // The driver already returned; the process can no longer accept
        // calls.
        return rpc_error(
            StatusCode::BAD_REQUEST,
            format!("process {} is no longer running", process.name),
        );
    }

    match reply_rx.await {
        Ok(RpcReply::Ok(result)) => {
            debug!(process = %process.name, seqno = %seqno, "rpc resolved");
            (StatusCode::OK, Json(result)).into_response()
        }
        Ok(RpcReply::WouldBlock) => {
            debug!(process = %process.name, seqno = %seqno, "rpc would block");
            StatusCode::ACCEPTED.into_response()
        }
        Ok(RpcReply::Err(message)) => rpc_error(
            StatusCode::BAD_REQUEST,
            format!("coordinator call failed: {message}"),
        ),
        Err(_) => rpc_error(
            StatusCode::BAD_REQUEST,
            format!("process {} stopped before replying", process.name),
        ),
    }
}

fn rpc_error(status: StatusCode, message: String) -> Response {
    warn!(status = %status, message = %message, "rpc rejected");
    (status, message).into_response()
}
