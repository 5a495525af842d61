//! Execution slots and the pool that owns them.
//!
//! A slot runs one task at a time on its own worker. Killing a slot hard
//! interrupts its task, records why, and marks the slot dead; a dead slot is
//! never reused. Yanking it replaces it with a fresh slot that takes over the
//! slot number, so the pool returns to capacity.

use crate::metrics::{counters, gauges, histograms};
use crate::task::{TaskControl, TaskFailure, TaskHandler};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tether_common::{Cause, Outcome, TaskId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unique slot identity. Never reused, unlike the slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Why a slot died.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CauseOfDeath {
    /// Diagnostic given to `kill_hard`.
    pub diagnostic: String,
    /// Task that was running at the time, if any.
    pub task: Option<TaskId>,
    /// When the slot was killed.
    pub died_at: DateTime<Utc>,
}

/// Errors from slot and pool operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    /// No slot with this id is in the pool.
    #[error("no such slot: {0}")]
    NotFound(SlotId),
    /// Only dead slots can be yanked.
    #[error("{0} is still alive")]
    StillAlive(SlotId),
    /// No live slot is idle.
    #[error("all {capacity} execution slots are busy")]
    Busy {
        /// Pool capacity.
        capacity: usize,
    },
}

/// A task to run, with its resolved handler.
pub struct TaskRequest {
    /// Controller-assigned id.
    pub id: TaskId,
    /// Handler name.
    pub name: String,
    /// Handler input.
    pub payload: Vec<u8>,
    /// The handler itself.
    pub handler: Arc<dyn TaskHandler>,
}

/// A submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    control: TaskControl,
    slot: SlotId,
    outcome: oneshot::Receiver<Outcome>,
}

impl TaskHandle {
    /// Task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.control.id()
    }

    /// Slot the task was assigned to.
    #[must_use]
    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    /// Shared control over the task.
    #[must_use]
    pub const fn control(&self) -> &TaskControl {
        &self.control
    }

    /// See [`TaskControl::interrupt`].
    pub fn interrupt(&self, causes: impl IntoIterator<Item = Cause>) -> bool {
        self.control.interrupt(causes)
    }

    /// Waits for the terminal outcome.
    pub async fn outcome(self) -> Outcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => self.control.conclude(Err(TaskFailure::Failed(
                "execution slot exited before the task concluded".into(),
            ))),
        }
    }
}

struct Assignment {
    control: TaskControl,
    handler: Arc<dyn TaskHandler>,
    payload: Vec<u8>,
    reply: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct SlotState {
    current: Option<TaskControl>,
    cause_of_death: Option<CauseOfDeath>,
    dead: bool,
}

struct SlotCore {
    id: SlotId,
    number: usize,
    state: Mutex<SlotState>,
    shutdown: CancellationToken,
}

impl SlotCore {
    fn lock_state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One execution slot.
pub struct ExecutionSlot {
    core: Arc<SlotCore>,
    inbox: mpsc::Sender<Assignment>,
    worker: JoinHandle<()>,
}

impl fmt::Debug for ExecutionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionSlot")
            .field("id", &self.core.id)
            .field("number", &self.core.number)
            .field("alive", &self.is_alive())
            .field("current_task", &self.current_task())
            .finish_non_exhaustive()
    }
}

impl ExecutionSlot {
    fn spawn(id: SlotId, number: usize, grace: Duration) -> Self {
        let core = Arc::new(SlotCore {
            id,
            number,
            state: Mutex::new(SlotState::default()),
            shutdown: CancellationToken::new(),
        });
        let (inbox, rx) = mpsc::channel(1);
        let worker = tokio::spawn(run_worker(Arc::clone(&core), rx, grace));
        debug!(slot = %id, number, "slot provisioned");
        Self {
            core,
            inbox,
            worker,
        }
    }

    /// Unique identity.
    #[must_use]
    pub fn id(&self) -> SlotId {
        self.core.id
    }

    /// Position in the pool. Survives a yank.
    #[must_use]
    pub fn number(&self) -> usize {
        self.core.number
    }

    /// Whether the slot has not been killed.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.core.lock_state().dead
    }

    /// Whether the worker is still running. Stays true after `kill_hard`
    /// until the interrupted task has actually stopped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.worker.is_finished()
    }

    /// Whether the slot can take a task right now.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.core.lock_state();
        !state.dead && state.current.is_none()
    }

    /// Id of the running task.
    #[must_use]
    pub fn current_task(&self) -> Option<TaskId> {
        self.core.lock_state().current.as_ref().map(TaskControl::id)
    }

    /// Why the slot died, once it has.
    #[must_use]
    pub fn cause_of_death(&self) -> Option<CauseOfDeath> {
        self.core.lock_state().cause_of_death.clone()
    }

    /// Interrupts the running task, records the cause of death and marks the
    /// slot dead. Returns `false` if it was already dead.
    pub fn kill_hard(&self, diagnostic: impl Into<String>) -> bool {
        let diagnostic = diagnostic.into();
        let mut state = self.core.lock_state();
        if state.dead {
            return false;
        }
        state.dead = true;
        let task = state.current.as_ref().map(TaskControl::id);
        if let Some(current) = &state.current {
            current.interrupt([Cause::killed_hard(diagnostic.clone())]);
        }
        state.cause_of_death = Some(CauseOfDeath {
            diagnostic: diagnostic.clone(),
            task,
            died_at: Utc::now(),
        });
        drop(state);
        self.core.shutdown.cancel();
        counters::slots_killed_total();
        warn!(slot = %self.core.id, number = self.core.number, ?task, %diagnostic, "slot killed hard");
        true
    }

    fn assign(&self, request: TaskRequest) -> Result<TaskHandle, TaskRequest> {
        let mut state = self.core.lock_state();
        if state.dead || state.current.is_some() {
            return Err(request);
        }
        let control = TaskControl::new(request.id, request.name);
        let (reply, outcome) = oneshot::channel();
        let assignment = Assignment {
            control: control.clone(),
            handler: request.handler,
            payload: request.payload,
            reply,
        };
        if let Err(err) = self.inbox.try_send(assignment) {
            let assignment = err.into_inner();
            let refused = assignment.control.conclude(Err(TaskFailure::Failed(
                "execution slot is not accepting work".into(),
            )));
            let _ = assignment.reply.send(refused);
        } else {
            state.current = Some(control.clone());
            gauges::inc_slots_busy();
        }
        Ok(TaskHandle {
            control,
            slot: self.core.id,
            outcome,
        })
    }
}

async fn run_worker(core: Arc<SlotCore>, mut inbox: mpsc::Receiver<Assignment>, grace: Duration) {
    loop {
        let assignment = tokio::select! {
            biased;
            () = core.shutdown.cancelled() => break,
            next = inbox.recv() => match next {
                Some(assignment) => assignment,
                None => break,
            },
        };
        let Assignment {
            control,
            handler,
            payload,
            reply,
        } = assignment;
        let outcome = execute(&core, &control, handler, payload, grace).await;
        core.lock_state().current = None;
        gauges::dec_slots_busy();
        let _ = reply.send(outcome);
    }

    // Work handed over but never started concludes with whatever causes
    // the kill recorded.
    inbox.close();
    while let Ok(assignment) = inbox.try_recv() {
        let outcome = assignment.control.conclude(Err(TaskFailure::Interrupted));
        core.lock_state().current = None;
        gauges::dec_slots_busy();
        let _ = assignment.reply.send(outcome);
    }
    debug!(slot = %core.id, "slot worker exited");
}

async fn forced_stop(token: &CancellationToken, grace: Duration) {
    token.cancelled().await;
    tokio::time::sleep(grace).await;
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn execute(
    core: &SlotCore,
    control: &TaskControl,
    handler: Arc<dyn TaskHandler>,
    payload: Vec<u8>,
    grace: Duration,
) -> Outcome {
    let ctx = control.context(core.id);
    let started = Instant::now();
    debug!(slot = %core.id, task = control.id(), name = control.name(), "task started");

    let mut job = tokio::spawn(async move { handler.run(ctx, payload).await });
    let returned = tokio::select! {
        joined = &mut job => match joined {
            Ok(returned) => returned,
            Err(err) if err.is_panic() => {
                Err(TaskFailure::Failed(format!("task panicked: {}", panic_message(err))))
            }
            Err(_) => Err(TaskFailure::Interrupted),
        },
        () = forced_stop(control.token(), grace) => {
            job.abort();
            warn!(
                slot = %core.id,
                task = control.id(),
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "task ignored interruption, aborting"
            );
            Err(TaskFailure::Interrupted)
        }
    };

    let outcome = control.conclude(returned);
    histograms::task_duration_seconds(started.elapsed().as_secs_f64());
    debug!(
        slot = %core.id,
        task = control.id(),
        outcome = outcome.label(),
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "task concluded"
    );
    outcome
}

struct PoolInner {
    slots: Vec<Arc<ExecutionSlot>>,
    next_id: u64,
}

/// Fixed-capacity set of execution slots. The slot list is only mutated
/// under the pool lock.
pub struct SlotPool {
    capacity: usize,
    grace: Duration,
    inner: Mutex<PoolInner>,
}

impl fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity)
            .field("slots", &self.slots())
            .finish_non_exhaustive()
    }
}

impl SlotPool {
    /// Provisions `capacity` slots. Must be called inside a tokio runtime.
    ///
    /// `grace` is how long an interrupted task may keep running before it is
    /// aborted.
    #[must_use]
    pub fn new(capacity: usize, grace: Duration) -> Self {
        let slots = (0..capacity)
            .map(|number| Arc::new(ExecutionSlot::spawn(SlotId::new(number as u64 + 1), number, grace)))
            .collect();
        info!(
            capacity,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "slot pool ready"
        );
        Self {
            capacity,
            grace,
            inner: Mutex::new(PoolInner {
                slots,
                next_id: capacity as u64 + 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Every slot, dead ones included, in slot-number order.
    #[must_use]
    pub fn slots(&self) -> Vec<Arc<ExecutionSlot>> {
        self.lock().slots.clone()
    }

    /// Looks up a slot.
    #[must_use]
    pub fn get(&self, id: SlotId) -> Option<Arc<ExecutionSlot>> {
        self.lock().slots.iter().find(|s| s.id() == id).cloned()
    }

    /// Live slots with no task.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_idle()).count()
    }

    /// Whether the slot's worker is still running.
    ///
    /// # Errors
    ///
    /// [`SlotError::NotFound`] for an unknown slot.
    pub fn is_active(&self, id: SlotId) -> Result<bool, SlotError> {
        self.get(id)
            .map(|slot| slot.is_active())
            .ok_or(SlotError::NotFound(id))
    }

    /// See [`ExecutionSlot::kill_hard`].
    ///
    /// # Errors
    ///
    /// [`SlotError::NotFound`] for an unknown slot.
    pub fn kill_hard(&self, id: SlotId, diagnostic: impl Into<String>) -> Result<(), SlotError> {
        let slot = self.get(id).ok_or(SlotError::NotFound(id))?;
        slot.kill_hard(diagnostic);
        Ok(())
    }

    /// Removes a dead slot and provisions a replacement under the same slot
    /// number. Returns the new slot's id.
    ///
    /// # Errors
    ///
    /// [`SlotError::NotFound`] for an unknown slot, [`SlotError::StillAlive`]
    /// for a live one.
    pub fn yank(&self, id: SlotId) -> Result<SlotId, SlotError> {
        let mut inner = self.lock();
        let index = inner
            .slots
            .iter()
            .position(|s| s.id() == id)
            .ok_or(SlotError::NotFound(id))?;
        if inner.slots[index].is_alive() {
            return Err(SlotError::StillAlive(id));
        }
        let number = inner.slots[index].number();
        let replacement = SlotId::new(inner.next_id);
        inner.next_id += 1;
        inner.slots[index] = Arc::new(ExecutionSlot::spawn(replacement, number, self.grace));
        drop(inner);
        counters::slots_yanked_total();
        info!(yanked = %id, replacement = %replacement, number, "slot replaced");
        Ok(replacement)
    }

    /// Hands a task to the first idle slot.
    ///
    /// # Errors
    ///
    /// [`SlotError::Busy`] when no live slot is idle.
    pub fn submit(&self, request: TaskRequest) -> Result<TaskHandle, SlotError> {
        let inner = self.lock();
        let mut request = request;
        for slot in &inner.slots {
            match slot.assign(request) {
                Ok(handle) => return Ok(handle),
                Err(back) => request = back,
            }
        }
        counters::tasks_refused_total("busy");
        Err(SlotError::Busy {
            capacity: self.capacity,
        })
    }

    /// Interrupts the task with this id, wherever it runs. Returns `false`
    /// if no slot is running it.
    pub fn interrupt(&self, task: TaskId, causes: impl IntoIterator<Item = Cause>) -> bool {
        let running = self.lock().slots.iter().find_map(|slot| {
            let current = slot.core.lock_state().current.clone();
            current.filter(|c| c.id() == task)
        });
        running.is_some_and(|control| control.interrupt(causes))
    }

    /// Interrupts every running task with `causes`. Returns how many were
    /// interrupted.
    pub fn interrupt_all(&self, causes: &[Cause]) -> usize {
        let running: Vec<TaskControl> = self
            .lock()
            .slots
            .iter()
            .filter_map(|slot| slot.core.lock_state().current.clone())
            .collect();
        running
            .iter()
            .filter(|control| control.interrupt(causes.iter().cloned()))
            .count()
    }
}
