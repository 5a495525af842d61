//! Controller-side handle to one agent: sends tasks, routes outcomes back.

use crate::error::ControllerError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_common::{
    Cause, ChannelError, ChannelReader, ChannelWriter, CloseReason, Envelope, HeartbeatConfig,
    HeartbeatMonitor, Outcome, SecureConnection, TaskId,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Waiters by task id. `None` once the reader has stopped.
type Pending = Arc<Mutex<Option<HashMap<TaskId, oneshot::Sender<Outcome>>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, Option<HashMap<TaskId, oneshot::Sender<Outcome>>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A task sent to the agent and not yet concluded.
#[derive(Debug)]
pub struct PendingTask {
    id: TaskId,
    outcome: oneshot::Receiver<Outcome>,
    writer: ChannelWriter,
}

impl PendingTask {
    /// Id assigned to the task.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Waits for the agent's terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns the channel's failure if the connection ends first.
    pub async fn outcome(self) -> Result<Outcome, ControllerError> {
        self.outcome
            .await
            .map_err(|_| ControllerError::Channel(self.writer.close_error()))
    }
}

/// A connected agent.
///
/// A background task reads the connection, answers heartbeat traffic and
/// hands each `Outcome` to the caller waiting on that task id. When the
/// connection dies every waiter fails with the connection's error.
pub struct RemoteAgent {
    writer: ChannelWriter,
    pending: Pending,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    heartbeat: HeartbeatMonitor,
    banner: String,
}

impl std::fmt::Debug for RemoteAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAgent")
            .field("banner", &self.banner)
            .field("heartbeat", &self.heartbeat.config())
            .field("closed", &self.writer.is_closed())
            .finish_non_exhaustive()
    }
}

impl RemoteAgent {
    /// Takes over an established connection and installs the heartbeat.
    ///
    /// # Errors
    ///
    /// Fails if the `SetupPing` cannot be written.
    pub async fn start(
        conn: SecureConnection,
        heartbeat: HeartbeatConfig,
        banner: String,
    ) -> Result<Self, ControllerError> {
        let (reader, writer) = conn.into_split();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(route_outcomes(reader, Arc::clone(&pending)));
        let heartbeat = HeartbeatMonitor::install(&writer, heartbeat).await?;
        Ok(Self {
            writer,
            pending,
            next_id: AtomicU64::new(1),
            reader,
            heartbeat,
            banner,
        })
    }

    /// Text the agent printed before the channel marker.
    #[must_use]
    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// The heartbeat schedule installed on this connection.
    #[must_use]
    pub const fn heartbeat(&self) -> HeartbeatConfig {
        self.heartbeat.config()
    }

    /// Sends a task and returns without waiting for it.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or the write fails.
    pub async fn dispatch(&self, name: &str, payload: &[u8]) -> Result<PendingTask, ControllerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match lock(&self.pending).as_mut() {
            Some(waiters) => waiters.insert(id, tx),
            None => return Err(self.writer.close_error().into()),
        };

        if let Err(err) = self.writer.write_object(&Envelope::task(id, name, payload)).await {
            if let Some(waiters) = lock(&self.pending).as_mut() {
                waiters.remove(&id);
            }
            return Err(err.into());
        }
        debug!(task = id, name, bytes = payload.len(), "task dispatched");
        Ok(PendingTask {
            id,
            outcome: rx,
            writer: self.writer.clone(),
        })
    }

    /// Sends a task and waits for its outcome.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed before the outcome arrives.
    pub async fn run(&self, name: &str, payload: &[u8]) -> Result<Outcome, ControllerError> {
        self.dispatch(name, payload).await?.outcome().await
    }

    /// Asks the agent to interrupt a running task with `causes`.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or the write fails.
    pub async fn interrupt(&self, id: TaskId, causes: Vec<Cause>) -> Result<(), ControllerError> {
        debug!(task = id, causes = causes.len(), "requesting interrupt");
        self.writer
            .write_object(&Envelope::Interrupt { id, causes })
            .await?;
        Ok(())
    }

    /// Sends a text value to the agent.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or the write fails.
    pub async fn say(&self, value: &str) -> Result<(), ControllerError> {
        self.writer.write_value(value).await?;
        Ok(())
    }

    /// Why the connection closed, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.writer.close_reason()
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) -> CloseReason {
        self.writer.closed().await
    }

    /// Closes the connection. Pending tasks fail.
    pub async fn close(&self) {
        self.writer.close().await;
    }
}

impl Drop for RemoteAgent {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn route_outcomes(mut reader: ChannelReader, pending: Pending) {
    let err = loop {
        match reader.read_object().await {
            Ok(Envelope::Outcome { id, outcome }) => {
                let waiter = lock(&pending).as_mut().and_then(|w| w.remove(&id));
                match waiter {
                    Some(tx) => {
                        debug!(task = id, outcome = outcome.label(), "outcome received");
                        let _ = tx.send(outcome);
                    }
                    None => warn!(task = id, "outcome for unknown task"),
                }
            }
            Ok(Envelope::Text(value)) => info!(%value, "agent says"),
            Ok(other) => debug!(tag = %other.type_tag(), "ignoring envelope"),
            Err(ChannelError::Security { identity }) => {
                warn!(%identity, "security policy rejected inbound envelope, closing connection");
                reader.writer().close().await;
                break ChannelError::Security { identity };
            }
            Err(err) => break err,
        }
    };

    let orphaned = lock(&pending).take().map_or(0, |waiters| waiters.len());
    match err {
        ChannelError::Closed(reason) => info!(%reason, orphaned, "agent connection closed"),
        other => warn!(err = %other, orphaned, "agent connection failed"),
    }
}
