//! Per-connection dispatch loop: controller envelopes in, task outcomes out.

use crate::metrics::counters;
use crate::slot::{SlotPool, TaskRequest};
use crate::task::{TaskControl, TaskRegistry};
use std::sync::Arc;
use tether_common::{Cause, ChannelError, ChannelWriter, Envelope, Outcome, SecureConnection, TaskId};
use tracing::{debug, info, warn};

/// Serves one controller connection until it closes.
///
/// Tasks go to `pool`; each outcome is written back as it concludes. Task ids
/// are scoped to the connection, so an `Interrupt` only reaches tasks this
/// connection started. When the loop ends, tasks this connection started and that are still running are
/// interrupted with a [`Cause::ChannelClosed`].
///
/// # Errors
///
/// [`ChannelError::Security`] after a denied envelope (the connection is
/// closed first), or any transport/framing failure. A clean close by either
/// side returns `Ok`.
pub async fn serve(
    conn: SecureConnection,
    pool: Arc<SlotPool>,
    registry: Arc<TaskRegistry>,
) -> Result<(), ChannelError> {
    let (mut reader, writer) = conn.into_split();
    let mut started: Vec<TaskControl> = Vec::new();

    let result = loop {
        match reader.read_object().await {
            Ok(Envelope::Task { id, name, payload }) => {
                started.retain(|control| control.outcome().is_none());
                if let Some(control) = start_task(&pool, &registry, &writer, id, name, payload).await {
                    started.push(control);
                }
            }
            Ok(Envelope::Interrupt { id, causes }) => {
                debug!(task = id, causes = causes.len(), "interrupt requested");
                let interrupted = started
                    .iter()
                    .find(|control| control.id() == id && control.outcome().is_none())
                    .is_some_and(|control| control.interrupt(causes));
                if !interrupted {
                    debug!(task = id, "no running task to interrupt on this connection");
                }
            }
            Ok(Envelope::Text(value)) => debug!(%value, "controller says"),
            Ok(other) => debug!(tag = %other.type_tag(), "ignoring envelope"),
            Err(ChannelError::Security { identity }) => {
                counters::security_rejections_total(identity.label());
                warn!(%identity, "security policy rejected inbound envelope, closing connection");
                writer.close().await;
                break Err(ChannelError::Security { identity });
            }
            Err(ChannelError::Closed(reason)) => {
                info!(%reason, "controller connection closed");
                break Ok(());
            }
            Err(err) => {
                warn!(%err, "controller connection failed");
                break Err(err);
            }
        }
    };

    let detail = writer
        .close_reason()
        .map_or_else(|| "dispatch loop ended".to_string(), |reason| reason.to_string());
    let cause = Cause::ChannelClosed { detail };
    let orphaned = started
        .iter()
        .filter(|control| control.interrupt([cause.clone()]))
        .count();
    if orphaned > 0 {
        info!(orphaned, "interrupted tasks of closed connection");
    }
    writer.close().await;
    result
}

async fn start_task(
    pool: &SlotPool,
    registry: &TaskRegistry,
    writer: &ChannelWriter,
    id: TaskId,
    name: String,
    payload: Vec<u8>,
) -> Option<TaskControl> {
    let Some(handler) = registry.get(&name) else {
        counters::tasks_refused_total("unknown");
        warn!(task = id, %name, "unknown task");
        report(writer, id, Outcome::Failure(format!("unknown task: {name}"))).await;
        return None;
    };

    debug!(task = id, %name, bytes = payload.len(), "submitting task");
    match pool.submit(TaskRequest {
        id,
        name,
        payload,
        handler,
    }) {
        Ok(handle) => {
            let control = handle.control().clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                let outcome = handle.outcome().await;
                report(&writer, id, outcome).await;
            });
            Some(control)
        }
        Err(err) => {
            warn!(task = id, %err, "task refused");
            report(writer, id, Outcome::Failure(err.to_string())).await;
            None
        }
    }
}

async fn report(writer: &ChannelWriter, id: TaskId, outcome: Outcome) {
    counters::tasks_total(outcome.label());
    debug!(task = id, outcome = outcome.label(), "reporting outcome");
    if let Err(err) = writer.write_object(&Envelope::Outcome { id, outcome }).await {
        debug!(task = id, %err, "outcome not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use std::time::Duration;
    use tether_common::policy::TypeIdentity;
    use tether_common::{SecurityPolicy, TypeTag};
    use tokio::task::JoinHandle;

    fn start(slots: usize) -> (SecureConnection, Arc<SlotPool>, JoinHandle<Result<(), ChannelError>>) {
        let pool = Arc::new(SlotPool::new(slots, Duration::from_millis(500)));
        let (controller, served) = attach(&pool);
        (controller, pool, served)
    }

    fn attach(pool: &Arc<SlotPool>) -> (SecureConnection, JoinHandle<Result<(), ChannelError>>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_rd, a_wr) = tokio::io::split(a);
        let (b_rd, b_wr) = tokio::io::split(b);
        let controller = SecureConnection::open(a_rd, a_wr, SecurityPolicy::controller());
        let agent = SecureConnection::open(b_rd, b_wr, SecurityPolicy::agent());
        let served = tokio::spawn(serve(agent, Arc::clone(pool), Arc::new(builtin::registry())));
        (controller, served)
    }

    async fn next_outcome(conn: &mut SecureConnection) -> (TaskId, Outcome) {
        match tokio::time::timeout(Duration::from_secs(5), conn.read_object())
            .await
            .unwrap()
            .unwrap()
        {
            Envelope::Outcome { id, outcome } => (id, outcome),
            other => panic!("expected outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_runs_and_reports() {
        let (mut controller, _pool, _served) = start(1);
        controller.write_object(&Envelope::task(9, "echo", b"ping")).await.unwrap();
        assert_eq!(
            next_outcome(&mut controller).await,
            (9, Outcome::Success(b"ping".to_vec()))
        );
    }

    #[tokio::test]
    async fn unknown_task_fails() {
        let (mut controller, _pool, _served) = start(1);
        controller.write_object(&Envelope::task(1, "format-disk", b"")).await.unwrap();
        let (id, outcome) = next_outcome(&mut controller).await;
        assert_eq!(id, 1);
        let Outcome::Failure(message) = outcome else {
            panic!("expected failure");
        };
        assert!(message.contains("format-disk"));
    }

    #[tokio::test]
    async fn busy_pool_refuses_task() {
        let (mut controller, _pool, _served) = start(1);
        controller.write_object(&Envelope::task(1, "sleep", b"60000")).await.unwrap();
        controller.write_object(&Envelope::task(2, "echo", b"x")).await.unwrap();
        let (id, outcome) = next_outcome(&mut controller).await;
        assert_eq!(id, 2);
        assert!(matches!(outcome, Outcome::Failure(m) if m.contains("busy")));
    }

    #[tokio::test]
    async fn remote_interrupt_reports_merged_causes() {
        let (mut controller, pool, _served) = start(1);
        controller.write_object(&Envelope::task(4, "sleep", b"60000")).await.unwrap();
        for _ in 0..100 {
            if pool.slots()[0].current_task() == Some(4) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        controller
            .write_object(&Envelope::Interrupt {
                id: 4,
                causes: vec![Cause::user("Johnny"), Cause::user("Johnny"), Cause::user("Jane")],
            })
            .await
            .unwrap();
        assert_eq!(
            next_outcome(&mut controller).await,
            (4, Outcome::Interrupted(vec![Cause::user("Johnny"), Cause::user("Jane")]))
        );
    }

    #[tokio::test]
    async fn interrupt_does_not_cross_connections() {
        let pool = Arc::new(SlotPool::new(2, Duration::from_millis(500)));
        let (mut first, _first_served) = attach(&pool);
        let (mut second, _second_served) = attach(&pool);

        first.write_object(&Envelope::task(1, "sleep", b"300")).await.unwrap();
        for _ in 0..100 {
            if pool.slots().iter().any(|slot| slot.current_task() == Some(1)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        second
            .write_object(&Envelope::Interrupt {
                id: 1,
                causes: vec![Cause::user("other controller")],
            })
            .await
            .unwrap();

        assert_eq!(next_outcome(&mut first).await, (1, Outcome::Success(b"300".to_vec())));
        second.write_object(&Envelope::task(2, "echo", b"still here")).await.unwrap();
        assert_eq!(
            next_outcome(&mut second).await,
            (2, Outcome::Success(b"still here".to_vec()))
        );
    }

    #[tokio::test]
    async fn denied_envelope_closes_connection() {
        let (controller, pool, served) = start(1);
        controller
            .write_object(&Envelope::Outcome {
                id: 1,
                outcome: Outcome::Success(Vec::new()),
            })
            .await
            .unwrap();
        let err = served.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Security {
                identity: TypeIdentity::Known(TypeTag::Outcome)
            }
        ));
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn closing_controller_interrupts_running_tasks() {
        let (controller, pool, served) = start(1);
        controller.write_object(&Envelope::task(3, "sleep", b"60000")).await.unwrap();
        for _ in 0..100 {
            if pool.slots()[0].current_task() == Some(3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        controller.close().await;
        served.await.unwrap().unwrap();
        for _ in 0..100 {
            if pool.idle_count() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task was not interrupted");
    }
}
