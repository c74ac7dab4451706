//! Worker threads and their request/acknowledgement protocol.
//!
//! A worker owns a [`WorkerTask`] on a dedicated OS thread. The pool talks to it
//! only through channels: every [`WorkerRequest`] carries a sequence id and is
//! answered by exactly one [`WorkerAck`] with the same id. Acks for calls that
//! already timed out are discarded.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Input for one activity.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub activity_id: i64,
    pub ts: i64,
    pub payload: Value,
}

/// Output for one activity. Failures stay attached to their item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    pub activity_id: i64,
    pub result: Result<Value, String>,
}

#[derive(Debug, Clone)]
pub enum WorkerOp {
    /// Static configuration for the worker's lifetime.
    Start(Value),
    Process(Vec<WorkItem>),
    Stop,
}

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub seq: u64,
    pub op: WorkerOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Started,
    Processed(Vec<ItemResult>),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct WorkerAck {
    pub seq: u64,
    pub result: Result<WorkerReply, String>,
}

/// Failures that end a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker call {seq} timed out after {timeout_ms}ms")]
    Timeout { seq: u64, timeout_ms: u64 },

    #[error("Worker disconnected")]
    Disconnected,

    #[error("Worker rejected request: {message}")]
    Rejected { message: String },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Unexpected worker reply to {op}")]
    UnexpectedReply { op: &'static str },
}

/// Computation run inside a worker thread.
pub trait WorkerTask: Send + 'static {
    fn start(&mut self, _config: &Value) -> Result<(), String> {
        Ok(())
    }

    fn process(&mut self, item: &WorkItem) -> Result<Value, String>;
}

fn run_worker<T: WorkerTask>(
    mut task: T,
    requests: std_mpsc::Receiver<WorkerRequest>,
    acks: mpsc::UnboundedSender<WorkerAck>,
) {
    while let Ok(request) = requests.recv() {
        let (result, done) = match request.op {
            WorkerOp::Start(config) => (task.start(&config).map(|()| WorkerReply::Started), false),
            WorkerOp::Process(items) => {
                let results = items
                    .iter()
                    .map(|item| ItemResult {
                        activity_id: item.activity_id,
                        result: catch_unwind(AssertUnwindSafe(|| task.process(item)))
                            .unwrap_or_else(|_| Err("processor panicked".to_string())),
                    })
                    .collect();
                (Ok(WorkerReply::Processed(results)), false)
            }
            WorkerOp::Stop => (Ok(WorkerReply::Stopped), true),
        };
        let ack = WorkerAck {
            seq: request.seq,
            result,
        };
        if acks.send(ack).is_err() || done {
            break;
        }
    }
}

/// Pool-side end of one worker.
pub struct WorkerClient {
    requests: std_mpsc::Sender<WorkerRequest>,
    acks: mpsc::UnboundedReceiver<WorkerAck>,
    next_seq: u64,
}

impl WorkerClient {
    /// Start `task` on a new named thread.
    pub fn spawn<T: WorkerTask>(name: impl Into<String>, task: T) -> Result<Self, WorkerError> {
        let (request_tx, request_rx) = std_mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(name.into())
            .spawn(move || run_worker(task, request_rx, ack_tx))?;
        Ok(Self {
            requests: request_tx,
            acks: ack_rx,
            next_seq: 0,
        })
    }

    /// Send one request and wait for its acknowledgement.
    pub async fn call(&mut self, op: WorkerOp, timeout: Duration) -> Result<WorkerReply, WorkerError> {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.requests
            .send(WorkerRequest { seq, op })
            .map_err(|_| WorkerError::Disconnected)?;

        let acks = &mut self.acks;
        let wait = async {
            loop {
                match acks.recv().await {
                    Some(ack) if ack.seq == seq => return Ok(ack),
                    Some(stale) => {
                        tracing::debug!(seq = stale.seq, "Discarding stale worker ack");
                    }
                    None => return Err(WorkerError::Disconnected),
                }
            }
        };
        let ack = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| WorkerError::Timeout {
                seq,
                timeout_ms: timeout.as_millis() as u64,
            })??;
        ack.result.map_err(|message| WorkerError::Rejected { message })
    }

    pub async fn start(&mut self, config: Value, timeout: Duration) -> Result<(), WorkerError> {
        match self.call(WorkerOp::Start(config), timeout).await? {
            WorkerReply::Started => Ok(()),
            _ => Err(WorkerError::UnexpectedReply { op: "start" }),
        }
    }

    pub async fn process(
        &mut self,
        items: Vec<WorkItem>,
        timeout: Duration,
    ) -> Result<Vec<ItemResult>, WorkerError> {
        match self.call(WorkerOp::Process(items), timeout).await? {
            WorkerReply::Processed(results) => Ok(results),
            _ => Err(WorkerError::UnexpectedReply { op: "process" }),
        }
    }

    pub async fn stop(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        match self.call(WorkerOp::Stop, timeout).await? {
            WorkerReply::Stopped => Ok(()),
            _ => Err(WorkerError::UnexpectedReply { op: "stop" }),
        }
    }
}
