//! Workload container: the tables, the fatal-error sink, and the
//! run-to-completion entry point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::process::{self, Process};
use crate::protocol::{Pid, ProcessResult, Qid, Seqno, NULL_CHK_ID};
use crate::queue::ByteQueue;
use crate::store::ObjectStore;
use crate::substrate::{HandlerSet, InvokeTarget};

const MAIN_PROCESS_NAME: &str = "main";

#[derive(Default)]
struct ProcessTable {
    next_pid: u64,
    by_pid: HashMap<Pid, Arc<Process>>,
}

#[derive(Default)]
struct QueueTable {
    next_qid: u64,
    by_qid: HashMap<Qid, Arc<ByteQueue>>,
}

/// One run's worth of state: the substrate handlers, the process and queue
/// tables, and the sink the first fatal error lands in. Entries are never
/// removed; ids grow monotonically for the life of the workload.
pub struct Workload {
    handler: HandlerSet,
    store: ObjectStore,
    rpc_timeout: Duration,

    fatal_tx: mpsc::Sender<anyhow::Error>,
    fatal_rx: Mutex<Option<mpsc::Receiver<anyhow::Error>>>,

    processes: Mutex<ProcessTable>,
    queues: Mutex<QueueTable>,

    /// Weak handle to this workload, for handing driver tasks a strong one.
    self_ref: Weak<Workload>,
}

impl Workload {
    pub fn new(handler: HandlerSet, store: ObjectStore, rpc_timeout: Duration) -> Arc<Self> {
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        Arc::new_cyclic(|self_ref| Workload {
            handler,
            store,
            rpc_timeout,
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            processes: Mutex::new(ProcessTable::default()),
            queues: Mutex::new(QueueTable::default()),
            self_ref: self_ref.clone(),
        })
    }

    fn shared(&self) -> Arc<Workload> {
        self.self_ref.upgrade().expect("workload dropped while in use")
    }

    pub(crate) fn handler(&self) -> &HandlerSet {
        &self.handler
    }

    pub(crate) fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub(crate) fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Create a process record. The process is visible in the table (and
    /// waitable) immediately; it does not run until
    /// [`Workload::start_process`].
    pub fn create_process(&self, name: &str, target: InvokeTarget) -> Arc<Process> {
        let mut table = self.processes.lock().expect("process table lock poisoned");
        let pid = Pid(table.next_pid);
        table.next_pid += 1;
        let process = Process::new(pid, format!("{name}-{pid}"), target);
        table.by_pid.insert(pid, Arc::clone(&process));
        process
    }

    pub fn process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.processes
            .lock()
            .expect("process table lock poisoned")
            .by_pid
            .get(&pid)
            .cloned()
    }

    pub fn create_queue(&self, max_size: usize) -> Qid {
        let mut table = self.queues.lock().expect("queue table lock poisoned");
        let qid = Qid(table.next_qid);
        table.next_qid += 1;
        table.by_qid.insert(qid, Arc::new(ByteQueue::new(max_size)));
        qid
    }

    pub fn queue(&self, qid: Qid) -> Option<Arc<ByteQueue>> {
        self.queues
            .lock()
            .expect("queue table lock poisoned")
            .by_qid
            .get(&qid)
            .cloned()
    }

    /// Launch a process's driver task.
    pub(crate) fn start_process(
        &self,
        process: Arc<Process>,
        starting_chk_id: String,
        app_event: Value,
        call_result: Value,
    ) {
        tokio::spawn(process::run(
            self.shared(),
            process,
            starting_chk_id,
            app_event,
            call_result,
        ));
    }

    /// Deliver a fatal error to the workload sink. Only the first delivery
    /// is observed; later ones are dropped so failing processes never hang.
    pub(crate) fn report_fatal(&self, err: anyhow::Error) {
        if let Err(dropped) = self.fatal_tx.try_send(err) {
            debug!(error = %dropped.into_inner(), "fatal error dropped, workload already failing");
        }
    }

    /// Fatal error attributed to a process and seqno.
    pub(crate) fn process_fatal(
        &self,
        process: &Process,
        seqno: Seqno,
        err: impl std::fmt::Display,
    ) {
        self.report_fatal(anyhow!("[{}, seqno={}] {}", process.name, seqno, err));
    }

    /// Run the workload: spawn the main process with the application event
    /// and block until it completes or any process reports a fatal error.
    pub async fn run(&self, app_event: Value) -> Result<ProcessResult> {
        let mut fatal_rx = self
            .fatal_rx
            .lock()
            .expect("fatal sink lock poisoned")
            .take()
            .ok_or_else(|| anyhow!("workload already ran"))?;

        // The main process always runs on the coordinator and starts fresh.
        let main = self.create_process(MAIN_PROCESS_NAME, InvokeTarget::OnCoordinator);
        info!(process = %main.name, "starting workload");
        self.start_process(Arc::clone(&main), NULL_CHK_ID.to_string(), app_event, Value::Null);

        tokio::select! {
            _ = main.wait_done() => Ok(main.return_value()),
            Some(err) = fatal_rx.recv() => bail!("FATAL: {err}"),
        }
    }

    /// Tear down the substrate handlers. Pending RPCs and queues are not
    /// drained; in-flight invocations run to their natural conclusion.
    pub async fn finalize(&self) {
        self.handler.finalize().await;
    }
}

/// Environment a workload injects into its handlers: where to reach the
/// coordinator, and how long an RPC may be waited on (with a little slack
/// for network latency).
pub fn handler_environment(
    rpc_addr: Option<SocketAddr>,
    rpc_timeout: Duration,
    user_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = user_env.clone();
    if let Some(addr) = rpc_addr {
        env.insert("RPC_IP".into(), addr.ip().to_string());
        env.insert("RPC_PORT".into(), addr.port().to_string());
    }
    env.insert(
        "RPC_HTTP_TIMEOUT".into(),
        format!("{}", rpc_timeout.as_secs_f64() + 1.0),
    );
    env
}
