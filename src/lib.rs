//! Belay - a coordinator for checkpointed computations on serverless
//!
//! User code runs as a set of cooperating processes, each carried by a
//! sequence of short-lived handler invocations bridged by checkpoints.
//! Whenever a handler reaches a synchronization point it issues a
//! coordinator call; this crate is the authoritative arbiter of those calls.
//! The key components are:
//!
//! ## Execution
//!
//! - [`Workload`]: one run's processes, queues, and fatal-error sink
//! - [`process`]: the per-process driver loop (invoke, retry, dedupe)
//! - [`coord_call`]: the closed set of coordinator calls and their dispatch
//!
//! ## Substrate
//!
//! - [`Substrate`]: pluggable single-shot handler executor
//! - [`substrate_local`]: subprocess binding for running handlers locally
//!
//! ## Wire surface
//!
//! - [`protocol`]: the JSON formats exchanged with handlers
//! - [`rpc`]: the HTTP endpoint handlers POST asynchronous calls to

pub mod config;
pub mod coord_call;
pub mod process;
pub mod protocol;
pub mod queue;
pub mod result;
pub mod rpc;
pub mod store;
pub mod substrate;
pub mod substrate_local;
pub mod test_support;
pub mod workload;

// Configuration
pub use config::Config;

// Wire protocol
pub use protocol::{Pid, ProcessResult, Qid, Request, Seqno, NULL_CHK_ID};

// Execution
pub use coord_call::DispatchError;
pub use process::{Process, CRASH_RETRIES};
pub use queue::ByteQueue;
pub use workload::{handler_environment, Workload};

// Substrate
pub use store::ObjectStore;
pub use substrate::{HandlerSet, InvokeTarget, Substrate, SubstrateError};
pub use substrate_local::{create_local_handlers, HandlerLog, LocalPlatformConfig, LocalSubstrate};
