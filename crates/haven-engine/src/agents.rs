use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;

/// A stateful unit addressed by messages. Each agent owns a private mailbox
/// processed by one task, so handlers run one message to completion before
/// the next and the agent's own state needs no locking. Agents may create
/// children and may spawn background work that outlives an `exit`.
#[async_trait]
pub trait Agent: Send + 'static {
    type Msg: Send + 'static;
    type Reply: Send + 'static;

    /// Handle one message. `responder` is present for `ask` deliveries and
    /// may be satisfied at most once; dropping it unreplied surfaces as an
    /// error on the asking side.
    async fn handle(&mut self, msg: Self::Msg, responder: Option<Responder<Self::Reply>>);

    /// Runs after the mailbox closes, before the task ends.
    async fn on_exit(&mut self) {}
}

/// One-shot reply channel handed to `handle` for `ask` deliveries.
/// Consuming `respond` enforces the at-most-once contract.
pub struct Responder<R> {
    tx: oneshot::Sender<R>,
}

impl<R> Responder<R> {
    pub fn respond(self, reply: R) {
        let _ = self.tx.send(reply);
    }
}

enum Mail<A: Agent> {
    Tell(A::Msg),
    Ask(A::Msg, Responder<A::Reply>),
    Exit,
}

/// Cheap, cloneable handle to an agent's mailbox.
pub struct Address<A: Agent> {
    tx: mpsc::UnboundedSender<Mail<A>>,
}

impl<A: Agent> Clone for Address<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<A: Agent> Address<A> {
    /// Fire-and-forget. Delivery is FIFO per sender; sending to an exited
    /// address is a silent no-op.
    pub fn tell(&self, msg: A::Msg) {
        let _ = self.tx.send(Mail::Tell(msg));
    }

    /// Send and await a reply. Timeout is a recoverable error, not a crash.
    pub async fn ask(&self, msg: A::Msg, timeout: Duration) -> Result<A::Reply, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Mail::Ask(msg, Responder { tx }))
            .map_err(|_| EngineError::AgentExited)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(EngineError::AgentExited),
            Err(_) => Err(EngineError::AskTimeout(timeout)),
        }
    }

    /// Request graceful shutdown. Messages already queued behind the exit
    /// marker are dropped; the current message finishes first.
    pub fn exit(&self) {
        let _ = self.tx.send(Mail::Exit);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start an agent and return its address.
pub fn create<A: Agent>(mut agent: A) -> Address<A> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Mail<A>>();

    tokio::spawn(async move {
        while let Some(mail) = rx.recv().await {
            match mail {
                Mail::Tell(msg) => agent.handle(msg, None).await,
                Mail::Ask(msg, responder) => agent.handle(msg, Some(responder)).await,
                Mail::Exit => break,
            }
        }
        rx.close();
        agent.on_exit().await;
    });

    Address { tx }
}
