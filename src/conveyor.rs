//! # Conveyor: the three-slot registry and pulse orchestrator.
//!
//! The conveyor owns one slot per [`PulsePhase`] and brokers pulse
//! transitions between them. Workers never coordinate with each other; all
//! coordination flows through here.
//!
//! ```text
//!  submit ───────────────► Present slot ─┐
//!  submit_future ────────► Future slot  ─┼─ one worker task each
//!                          Past slot    ─┘
//!
//!  pulse(n):  PendingPulse ──► all workers ack (admission stops)
//!             ActivatePulse ─► all workers reach Suspended
//!             rotate: Past retires, Present→Past, Future→Present,
//!                     fresh Future slot created for pulse n
//! ```
//!
//! ## Rules
//! - The slot table sits behind a readers-writer lock: submits take cheap
//!   read locks, the infrequent pulse switch takes the write lock.
//! - Pulse numbers must be strictly increasing; violations are rejected
//!   before any state mutation.
//! - Rotated slots keep the pulse number they were created with; the fresh
//!   Future slot carries the newly activated pulse number.
//! - `shutdown` stops admissions, cancels every worker, and waits out a
//!   bounded grace period before reporting stuck slots.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::element::{ElementId, InputEvent};
use crate::error::{PulseError, RuntimeError, SubmitError};
use crate::events::{Bus, Event, EventKind, EventStream};
use crate::matrix::{INITIAL_MACHINE, MachineType, Matrix};
use crate::observer::{self, Observer};
use crate::pulse::{PulseNumber, PulsePhase};
use crate::queue::{ACTIVATE_PULSE_SIGNAL, PENDING_PULSE_SIGNAL, SignalAck};
use crate::slot::{Slot, SlotHandle, SlotStatus};
use crate::worker::{Worker, WorkerState};

/// Final state report returned by [`Conveyor::shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Status of the Future, Present, and Past slots, in that order.
    pub slots: Vec<SlotStatus>,
}

/// The three-slot table guarded by the conveyor's readers-writer lock.
struct SlotTable {
    future: SlotHandle,
    present: SlotHandle,
    past: SlotHandle,
    /// The latest activated pulse number.
    latest: PulseNumber,
}

impl SlotTable {
    fn handles(&self) -> [&SlotHandle; 3] {
        [&self.future, &self.present, &self.past]
    }
}

/// Builder for a [`Conveyor`] with optional observability.
pub struct ConveyorBuilder {
    matrix: Matrix,
    cfg: Config,
    observer: Option<Arc<dyn Observer>>,
}

impl ConveyorBuilder {
    /// Creates a builder over a frozen matrix.
    pub fn new(matrix: Matrix) -> ConveyorBuilder {
        ConveyorBuilder {
            matrix,
            cfg: Config::default(),
            observer: None,
        }
    }

    /// Replaces the default configuration.
    pub fn with_config(mut self, cfg: Config) -> ConveyorBuilder {
        self.cfg = cfg;
        self
    }

    /// Attaches an observer fed from the event bus on its own listener
    /// task.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> ConveyorBuilder {
        self.observer = Some(observer);
        self
    }

    /// Spawns the three slot workers and returns the running conveyor.
    ///
    /// Must be called from within a Tokio runtime. All three slots start at
    /// `initial_pulse`.
    pub fn start(self, initial_pulse: PulseNumber) -> Arc<Conveyor> {
        let matrix = Arc::new(self.matrix);
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        if let Some(obs) = self.observer {
            observer::spawn_listener(&bus, obs);
        }

        let shutdown = CancellationToken::new();
        let mut workers = JoinSet::new();
        let mut spawn = |phase: PulsePhase| {
            let (slot, handle) = Slot::new(
                phase,
                initial_pulse,
                Arc::clone(&matrix),
                bus.clone(),
                &self.cfg,
            );
            let worker = Worker::new(slot, shutdown.clone(), &self.cfg);
            workers.spawn(worker.run());
            handle
        };

        let future = spawn(PulsePhase::Future);
        let present = spawn(PulsePhase::Present);
        let past = spawn(PulsePhase::Past);

        Arc::new(Conveyor {
            cfg: self.cfg,
            matrix,
            bus,
            table: RwLock::new(SlotTable {
                future,
                present,
                past,
                latest: initial_pulse,
            }),
            pulse_gate: Mutex::new(()),
            workers: Mutex::new(workers),
            shutdown: shutdown.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Top-level scheduler: submission API, pulse switching, shutdown.
pub struct Conveyor {
    cfg: Config,
    matrix: Arc<Matrix>,
    bus: Bus,
    table: RwLock<SlotTable>,
    /// Serializes pulse switches; `try_lock` failure maps to
    /// [`PulseError::AlreadyInProgress`].
    pulse_gate: Mutex<()>,
    workers: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Conveyor {
    /// Starts building a conveyor over `matrix`.
    pub fn builder(matrix: Matrix) -> ConveyorBuilder {
        ConveyorBuilder::new(matrix)
    }

    /// Starts a conveyor with the default configuration.
    pub fn start(matrix: Matrix, initial_pulse: PulseNumber) -> Arc<Conveyor> {
        ConveyorBuilder::new(matrix).start(initial_pulse)
    }

    /// Submits a payload to the Present slot, seeded with the initial
    /// machine type.
    pub async fn submit(&self, payload: impl Any + Send) -> Result<(), SubmitError> {
        self.submit_for(INITIAL_MACHINE, payload).await
    }

    /// Submits a payload to the Present slot for an explicit machine type.
    pub async fn submit_for(
        &self,
        machine: MachineType,
        payload: impl Any + Send,
    ) -> Result<(), SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed);
        }
        let table = self.table.read().await;
        table.present.submit(InputEvent::New {
            machine,
            payload: Box::new(payload),
        })
    }

    /// Submits a payload to the Future slot.
    pub async fn submit_future(&self, payload: impl Any + Send) -> Result<(), SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed);
        }
        let table = self.table.read().await;
        table.future.submit(InputEvent::New {
            machine: INITIAL_MACHINE,
            payload: Box::new(payload),
        })
    }

    /// Re-activates a parked element in the Present slot with a
    /// continuation payload.
    pub async fn resume(
        &self,
        element: ElementId,
        payload: impl Any + Send,
    ) -> Result<(), SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed);
        }
        let table = self.table.read().await;
        table.present.submit(InputEvent::Continuation {
            element,
            payload: Box::new(payload),
        })
    }

    /// Submits a payload, retrying with backoff while the queue is full.
    ///
    /// Returns only once the payload is admitted or the conveyor closes.
    pub async fn submit_with_backoff(
        &self,
        payload: impl Any + Send + Clone,
        policy: &BackoffPolicy,
    ) -> Result<(), SubmitError> {
        let mut prev = None;
        loop {
            match self.submit(payload.clone()).await {
                Err(SubmitError::Full) => {
                    let delay = policy.next(prev);
                    prev = Some(delay);
                    sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Switches the conveyor to `pulse` with the two-phase protocol.
    ///
    /// 1. A PendingPulse signal goes to all three slots; each worker's ack
    ///    confirms it observed the signal and stopped admitting work.
    /// 2. An ActivatePulse signal follows; each ack fires once its worker
    ///    reaches the Suspended barrier.
    /// 3. The table rotates: the old Past slot retires (freed once its
    ///    elements drain), Present becomes Past, Future becomes Present,
    ///    and a fresh Future slot is spawned for `pulse`.
    ///
    /// A slot whose worker has halted is skipped; it cannot ack.
    pub async fn pulse(&self, pulse: PulseNumber) -> Result<(), PulseError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PulseError::Closed);
        }
        let _gate = self
            .pulse_gate
            .try_lock()
            .map_err(|_| PulseError::AlreadyInProgress)?;

        let mut table = self.table.write().await;
        if pulse <= table.latest {
            return Err(PulseError::NotIncreasing {
                current: table.latest,
                requested: pulse,
            });
        }
        self.bus
            .publish(Event::now(EventKind::PulsePrepared).with_pulse(pulse));

        let pending = Self::broadcast_signal(&table, PENDING_PULSE_SIGNAL).await;
        join_all(pending).await;

        let activations = Self::broadcast_signal(&table, ACTIVATE_PULSE_SIGNAL).await;
        join_all(activations).await;

        let (slot, handle) = Slot::new(
            PulsePhase::Future,
            pulse,
            Arc::clone(&self.matrix),
            self.bus.clone(),
            &self.cfg,
        );
        let worker = Worker::new(slot, self.shutdown.clone(), &self.cfg);
        self.workers.lock().await.spawn(worker.run());

        let present_clone = table.present.clone();
        let retired = std::mem::replace(&mut table.past, present_clone);
        table.present = table.future.clone();
        table.future = handle;
        table.latest = pulse;
        retired.retire();

        self.bus
            .publish(Event::now(EventKind::PulseActivated).with_pulse(pulse));
        Ok(())
    }

    /// Pushes `code` to every slot, collecting the acks of the slots that
    /// still have a live worker.
    async fn broadcast_signal(
        table: &SlotTable,
        code: u32,
    ) -> Vec<tokio::sync::oneshot::Receiver<()>> {
        let mut acks = Vec::with_capacity(3);
        for handle in table.handles() {
            let (ack, fired) = SignalAck::new();
            if handle.push_signal(code, ack).await.is_ok() {
                acks.push(fired);
            }
        }
        acks
    }

    /// Stops admissions, cancels every worker, and waits up to the
    /// configured grace period.
    ///
    /// Parked elements are terminated by their workers on the way out. The
    /// report carries the final slot statuses, halted slots included.
    pub async fn shutdown(&self) -> Result<ShutdownReport, RuntimeError> {
        self.closed.store(true, Ordering::SeqCst);
        self.bus.publish(Event::now(EventKind::ShutdownRequested));
        self.shutdown.cancel();

        let grace = self.cfg.grace;
        let joined = {
            // the worker set must be released before status(): a pulse in
            // flight holds the table lock while waiting on the worker set
            let mut workers = self.workers.lock().await;
            let drained = async { while workers.join_next().await.is_some() {} };
            timeout(grace, drained).await
        };
        match joined {
            Ok(()) => {
                self.bus.publish(Event::now(EventKind::AllStoppedWithin));
                Ok(ShutdownReport {
                    slots: self.status().await,
                })
            }
            Err(_) => {
                self.bus.publish(Event::now(EventKind::GraceExceeded));
                let stuck = self
                    .status()
                    .await
                    .into_iter()
                    .filter(|s| s.worker != WorkerState::Suspended)
                    .map(|s| format!("{}@{}", s.phase, s.pulse))
                    .collect();
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        }
    }

    /// Snapshot of the Future, Present, and Past slots, in that order.
    ///
    /// Stays accurate after workers halt or shut down.
    pub async fn status(&self) -> Vec<SlotStatus> {
        let table = self.table.read().await;
        table.handles().iter().map(|h| h.status()).collect()
    }

    /// The latest activated pulse number.
    pub async fn current_pulse(&self) -> PulseNumber {
        self.table.read().await.latest
    }

    /// Subscribes to the conveyor's runtime events.
    pub fn events(&self) -> EventStream {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{PhaseMachines, StateMachine, Transition};

    fn terminating_matrix() -> Matrix {
        let machine = StateMachine::new().on_transition(1, |_ctx, _p| Transition::finish());
        Matrix::builder()
            .register(1, PhaseMachines::uniform(machine))
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn rejects_non_increasing_pulse() {
        let conveyor = Conveyor::start(terminating_matrix(), 22);
        assert_eq!(
            conveyor.pulse(22).await,
            Err(PulseError::NotIncreasing {
                current: 22,
                requested: 22,
            })
        );
        assert_eq!(
            conveyor.pulse(21).await,
            Err(PulseError::NotIncreasing {
                current: 22,
                requested: 21,
            })
        );
        assert_eq!(conveyor.current_pulse().await, 22);
        conveyor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_work_after_shutdown() {
        let conveyor = Conveyor::start(terminating_matrix(), 22);
        conveyor.shutdown().await.unwrap();
        assert_eq!(
            conveyor.submit(1u32).await.unwrap_err(),
            SubmitError::Closed
        );
        assert_eq!(conveyor.pulse(23).await.unwrap_err(), PulseError::Closed);
    }

    #[tokio::test]
    async fn shutdown_reports_all_three_slots() {
        let conveyor = Conveyor::start(terminating_matrix(), 7);
        let report = conveyor.shutdown().await.unwrap();
        assert_eq!(report.slots.len(), 3);
        let phases: Vec<PulsePhase> = report.slots.iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![PulsePhase::Future, PulsePhase::Present, PulsePhase::Past]
        );
        for status in &report.slots {
            assert!(status.healthy);
            assert_eq!(status.worker, WorkerState::Suspended);
        }
    }
}
