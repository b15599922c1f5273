use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::{Engine, Envelope};
use crate::config::AdmissionPolicy;
use crate::error::StoreError;
use crate::protocol::{CommandKind, Response};

struct Job {
    envelope: Envelope,
    reply: oneshot::Sender<Response>,
}

/// Either side of the gate, held for the whole lifetime of one command.
type Permit = Box<dyn Send>;

/// The serialization point between all connections and the engine.
///
/// ## Dispatch loop
/// ```text
/// submit() ──► [FIFO queue] ──► acquire gate ──► spawn execute ──► reply
///                                     ▲                              │
///                                     └──────── release gate ◄───────┘
/// ```
/// Commands leave the queue strictly in arrival order. The dispatcher waits
/// for the gate before spawning each command, so while a write holds the
/// exclusive side nothing else is dispatched and the queue stalls.
///
/// ## Policies
/// - `Serial`: every command takes the exclusive side. Completion order
///   equals arrival order, and each reply is handed off before the next
///   command is admitted.
/// - `ConcurrentReads`: reads share the gate and may complete in any order;
///   a write waits for in-flight reads to drain, then runs alone.
///
/// Every submitted command gets exactly one response. Engine failures and
/// panics in the execution task are turned into error responses; nothing a
/// command does can stop the dispatcher.
pub struct Scheduler {
    queue: mpsc::UnboundedSender<Job>,
    policy: AdmissionPolicy,
}

impl Scheduler {
    /// Spawns the dispatcher task. Must be called inside a Tokio runtime.
    pub fn start(engine: Arc<Engine>, policy: AdmissionPolicy) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(engine, policy, rx));
        Self { queue, policy }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Enqueues a command without waiting for it.
    pub fn submit(&self, envelope: Envelope) -> oneshot::Receiver<Response> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(job)) = self.queue.send(Job { envelope, reply }) {
            let err = StoreError::Internal("scheduler is not running".to_string());
            let _ = job.reply.send(Response::error(&job.envelope.name, &err));
        }
        rx
    }

    /// Enqueues a command and waits for its response.
    pub async fn enqueue(&self, envelope: Envelope) -> Response {
        let name = envelope.name.clone();
        self.submit(envelope).await.unwrap_or_else(|_| {
            Response::error(&name, &StoreError::Internal("command was dropped".to_string()))
        })
    }
}

async fn dispatch(engine: Arc<Engine>, policy: AdmissionPolicy, mut rx: mpsc::UnboundedReceiver<Job>) {
    let gate = engine.gate();
    while let Some(job) = rx.recv().await {
        let kind = job.envelope.kind();
        let permit: Permit = match (kind, policy) {
            (CommandKind::Read, AdmissionPolicy::ConcurrentReads) => Box::new(gate.clone().read_owned().await),
            _ => Box::new(gate.clone().write_owned().await),
        };
        debug!(command = %job.envelope.name, conn = job.envelope.origin.id, ?kind, "dispatch");

        let engine = engine.clone();
        tokio::spawn(async move {
            let Job { envelope, reply } = job;
            let name = envelope.name.clone();
            let response = match tokio::spawn(async move { engine.execute(envelope).await }).await {
                Ok(response) => response,
                Err(e) => {
                    error!(command = %name, error = %e, "command task failed");
                    Response::error(&name, &StoreError::Internal(e.to_string()))
                }
            };
            let _ = reply.send(response);
            drop(permit);
        });
    }
    debug!("scheduler queue closed");
}
