//! Wire protocol between the coordinator and handler invocations.
//!
//! Both directions are JSON. The coordinator sends an [`InvocationEvent`] as
//! the invocation payload; the handler answers with a [`Request`] carrying a
//! batch of coordinator calls. The same [`Request`] shape is POSTed to the
//! RPC endpoint when a handler issues a call asynchronously.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::warn;

/// Workload-local process identifier, assigned in creation order from 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Pid(pub u64);

/// Workload-local queue identifier, assigned in creation order from 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Qid(pub u64);

/// Per-process coordinator-call sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Seqno(pub u64);

impl Seqno {
    /// The sequence number following this one.
    pub fn next(self) -> Seqno {
        Seqno(self.0 + 1)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The checkpoint id a fresh process starts from.
pub const NULL_CHK_ID: &str = "";

/// Opaque return value of a process, produced by the handler runtime.
pub type ProcessResult = String;

/// Payload sent to a handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationEvent {
    pub pid: Pid,
    pub seqno: Seqno,
    pub chk_id: String,
    /// Result of the last accepted coordinator call.
    pub coord_call_result: serde_json::Value,
    /// Event for application code; only the main process receives one.
    pub app_event: serde_json::Value,
}

/// A single coordinator call inside a [`Request`].
///
/// Parameters stay raw until the op tag selects the struct to decode them
/// into; see [`crate::coord_call`].
#[derive(Debug, Deserialize)]
pub struct CoordCall {
    pub seqno: Seqno,
    pub op: String,
    pub params: Box<RawValue>,
}

impl fmt::Display for CoordCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.op, truncate(self.params.get(), 500))
    }
}

/// A handler's request to the coordinator: the batch of calls made since the
/// last checkpoint, plus the checkpoint this invocation established.
///
/// `seqno` is the sequence number *after* the enclosed calls.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub pid: Pid,
    pub seqno: Seqno,
    pub chk_id: String,
    #[serde(default)]
    pub calls: Vec<CoordCall>,
    /// True if the handler terminated because it is blocked on an earlier
    /// asynchronous call.
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub err: Option<String>,
}

impl Request {
    /// One-line rendering of the request's calls, for logs.
    pub fn summary(&self) -> String {
        self.calls
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("call seqno out of range: {call} > {request}")]
    SeqnoOutOfRange { call: Seqno, request: Seqno },
}

/// Parse a handler request from raw JSON bytes.
///
/// A non-null `err` field is a handler-side complaint; it is logged loudly
/// but is not fatal. A call whose seqno exceeds the request seqno is a
/// protocol violation and rejects the whole request.
pub fn parse_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let req: Request = serde_json::from_slice(bytes)?;

    if let Some(err) = &req.err {
        warn!(pid = %req.pid, seqno = %req.seqno, error = %err, "handler reported an error");
    }

    for call in &req.calls {
        if call.seqno > req.seqno {
            return Err(ProtocolError::SeqnoOutOfRange {
                call: call.seqno,
                request: req.seqno,
            });
        }
    }

    Ok(req)
}

/// Parse the synchronous return of an invocation.
///
/// Handlers return a JSON *string* whose content is the JSON-encoded request,
/// so the outer layer is peeled before parsing.
pub fn parse_wrapped_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let inner: String = serde_json::from_slice(bytes)?;
    parse_request(inner.as_bytes())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .take_while(|(i, _)| *i <= max.saturating_sub(3))
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("{}...", &s[..cut])
}
