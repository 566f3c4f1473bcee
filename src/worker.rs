//! # Slot worker: the four-state loop that advances a slot.
//!
//! Every slot is driven by exactly one worker task. The worker never takes
//! a shared lock; the only things it waits on are its own queues.
//!
//! ```text
//!             first drain done                PendingPulse
//!  Initializing ───────────────► Working ───────────────► Suspending
//!       ▲                                                     │
//!       │ relabel + migrate                 ActivatePulse or  │
//!       └────────────────────── Suspended ◄────── quiescence ─┘
//! ```
//!
//! One Working pass:
//! 1. Drain the input queue (signals first, then events up to the
//!    admission cap); admitted events become Active elements.
//! 2. Drain the response queue; matched responses move their elements to
//!    the Response list.
//! 3. Run one handler invocation per Response element, then per Active
//!    element.
//! 4. Yield.
//!
//! ## Rules
//! - Unknown signal codes are a programming error: the worker halts with a
//!   diagnostic naming the code and the slot is marked unhealthy.
//! - A batch holding both PendingPulse and ActivatePulse keeps the
//!   activation: the item goes back on the queue (ack unfired) for the
//!   suspending loop, and intermediate pendings are no-ops.
//! - While Suspending, a Future/Present slot buffers admitted events
//!   without stepping them; a Past slot flips back to Working and drains.
//! - A handler panic terminates the offending element only; the worker
//!   keeps running.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterJob, AdapterResponse};
use crate::config::Config;
use crate::element::{ElementId, InputEvent, ListKind, Payload};
use crate::error::{AdapterError, WorkerError};
use crate::events::{Event, EventKind};
use crate::matrix::{ElementState, TERMINATED_STATE, Transition};
use crate::pulse::PulsePhase;
use crate::queue::{ACTIVATE_PULSE_SIGNAL, PENDING_PULSE_SIGNAL, QueueItem, SignalAck};
use crate::slot::Slot;

/// Lifecycle state of a slot worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Just created or just resumed after a pulse; drains pending input
    /// with full event admission.
    Initializing,
    /// Normal operation: admits events, runs Response and Active handlers.
    Working,
    /// Pulse pending: no new work is processed (Past slots excepted),
    /// in-flight responses still land.
    Suspending,
    /// Pulse-switch barrier; the worker idles until relabeling.
    Suspended,
}

impl WorkerState {
    /// Stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerState::Initializing => "initializing",
            WorkerState::Working => "working",
            WorkerState::Suspending => "suspending",
            WorkerState::Suspended => "suspended",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Loop control returned by each state step.
enum Flow {
    Continue,
    Exit,
}

/// The single task that owns and advances one slot.
pub(crate) struct Worker {
    slot: Slot,
    shutdown: CancellationToken,
    retire: CancellationToken,
    admission_cap: usize,
    idle_poll: Duration,
    /// A PendingPulse has been observed and no activation has completed yet.
    pulse_pending: bool,
    /// An ActivatePulse has been observed; the next Suspended step resumes.
    activation_seen: bool,
}

impl Worker {
    pub(crate) fn new(slot: Slot, shutdown: CancellationToken, cfg: &Config) -> Worker {
        let retire = slot.retire_token();
        Worker {
            slot,
            shutdown,
            retire,
            admission_cap: cfg.admission_cap,
            idle_poll: cfg.idle_poll,
            pulse_pending: false,
            activation_seen: false,
        }
    }

    /// Runs the worker until shutdown, retirement, or a halting error.
    pub(crate) async fn run(mut self) {
        loop {
            if self.shutdown.is_cancelled() {
                self.teardown();
                return;
            }
            let flow = match self.slot.worker_state() {
                WorkerState::Initializing => self.initializing().await,
                WorkerState::Working => self.working().await,
                WorkerState::Suspending => self.suspending().await,
                WorkerState::Suspended => self.suspended().await,
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return,
                Err(err) => {
                    self.halt(err);
                    return;
                }
            }
        }
    }

    // ---- state steps ----

    /// Drains pending input with full event admission, then starts working.
    async fn initializing(&mut self) -> Result<Flow, WorkerError> {
        let mut batch = self.slot.input.drain();
        self.process_signals_working(&mut batch)?;
        self.admit_events(batch);
        if self.slot.worker_state() == WorkerState::Initializing {
            self.slot.set_worker_state(WorkerState::Working);
        }
        Ok(Flow::Continue)
    }

    /// One normal pass: admit, match responses, step elements.
    async fn working(&mut self) -> Result<Flow, WorkerError> {
        self.read_input_queue_working().await?;
        self.read_response_queue();
        self.step_list(ListKind::Response);
        self.step_list(ListKind::Active);
        if self.done_draining() {
            return Ok(Flow::Exit);
        }
        tokio::task::yield_now().await;
        Ok(Flow::Continue)
    }

    /// Pulse pending: responses still land, new events buffer (or keep a
    /// Past slot draining), and the worker suspends once it quiesces.
    async fn suspending(&mut self) -> Result<Flow, WorkerError> {
        self.read_input_queue_suspending().await?;
        self.read_response_queue();
        self.step_list(ListKind::Response);
        if self.slot.worker_state() == WorkerState::Suspending && !self.slot.response_work_pending()
        {
            self.slot.set_worker_state(WorkerState::Suspended);
        }
        Ok(Flow::Continue)
    }

    /// Barrier: resume once activated, otherwise park and keep watching
    /// the input queue for the activation.
    async fn suspended(&mut self) -> Result<Flow, WorkerError> {
        if self.activation_seen {
            self.resume();
            return Ok(Flow::Continue);
        }
        let mut batch = self.poll_input(false).await;
        self.process_signals_suspending(&mut batch)?;
        let admitted = batch.iter().any(|item| !item.is_signal());
        self.admit_events(batch);
        self.past_reactivation(admitted);
        Ok(Flow::Continue)
    }

    // ---- input processing ----

    async fn read_input_queue_working(&mut self) -> Result<(), WorkerError> {
        let ready = self.slot.list_len(ListKind::Active) > 0 || self.slot.response_work_pending();
        let mut batch = self.poll_input(ready).await;
        self.process_signals_working(&mut batch)?;
        self.admit_events(batch);
        Ok(())
    }

    async fn read_input_queue_suspending(&mut self) -> Result<(), WorkerError> {
        let ready = self.slot.response_work_pending();
        let mut batch = self.poll_input(ready).await;
        self.process_signals_suspending(&mut batch)?;
        let admitted = batch.iter().any(|item| !item.is_signal());
        self.admit_events(batch);
        self.past_reactivation(admitted);
        Ok(())
    }

    /// Drains a batch, parking with a bounded wait when the slot is idle.
    async fn poll_input(&mut self, ready: bool) -> Vec<QueueItem<InputEvent>> {
        if ready {
            return self.slot.input.drain_capped(self.admission_cap);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Vec::new(),
            batch = self.slot.input.recv_batch(self.admission_cap, self.idle_poll) => batch,
        }
    }

    /// Consumes the signals of a drained batch in Working/Initializing,
    /// leaving only events behind. Returns the number of signals consumed.
    ///
    /// PendingPulse suspends admission; an ActivatePulse that follows a
    /// pending one is retained on the queue for the suspending loop, ack
    /// unfired. An activation with no pulse pending is a no-op.
    fn process_signals_working(
        &mut self,
        batch: &mut Vec<QueueItem<InputEvent>>,
    ) -> Result<usize, WorkerError> {
        let items = std::mem::take(batch);
        let mut events = Vec::with_capacity(items.len());
        let mut consumed = 0;
        for item in items {
            let (code, mut ack) = match item {
                QueueItem::Signal { code, ack } => (code, ack),
                event => {
                    events.push(event);
                    continue;
                }
            };
            consumed += 1;
            match code {
                PENDING_PULSE_SIGNAL => {
                    ack.fire();
                    self.pulse_pending = true;
                    if self.slot.worker_state() != WorkerState::Suspending {
                        self.slot.set_worker_state(WorkerState::Suspending);
                    }
                }
                ACTIVATE_PULSE_SIGNAL => {
                    if self.slot.worker_state() == WorkerState::Suspending {
                        // same-batch pair: keep the activation for the
                        // suspending loop, ack still pending
                        self.slot.input.requeue(QueueItem::Signal { code, ack });
                    } else if self.pulse_pending {
                        // a Past slot went back to Working mid-protocol;
                        // the activation still counts
                        self.observe_activation(ack);
                    } else {
                        tracing::warn!(
                            phase = %self.slot.phase(),
                            "activation with no pulse pending ignored",
                        );
                        ack.fire();
                    }
                }
                code => return Err(WorkerError::UnknownSignal { code }),
            }
        }
        *batch = events;
        Ok(consumed)
    }

    /// Signal pass for the Suspending/Suspended states. Returns the number
    /// of signals consumed.
    fn process_signals_suspending(
        &mut self,
        batch: &mut Vec<QueueItem<InputEvent>>,
    ) -> Result<usize, WorkerError> {
        let items = std::mem::take(batch);
        let mut events = Vec::with_capacity(items.len());
        let mut consumed = 0;
        for item in items {
            let (code, mut ack) = match item {
                QueueItem::Signal { code, ack } => (code, ack),
                event => {
                    events.push(event);
                    continue;
                }
            };
            consumed += 1;
            match code {
                PENDING_PULSE_SIGNAL => {
                    // already pending; duplicates are no-ops
                    ack.fire();
                    self.pulse_pending = true;
                }
                ACTIVATE_PULSE_SIGNAL => self.observe_activation(ack),
                code => return Err(WorkerError::UnknownSignal { code }),
            }
        }
        *batch = events;
        Ok(consumed)
    }

    /// Records an activation: the worker reaches the Suspended barrier and
    /// only then fires the ack the pulse orchestrator waits on.
    fn observe_activation(&mut self, mut ack: SignalAck) {
        self.activation_seen = true;
        if self.slot.worker_state() != WorkerState::Suspended {
            self.slot.set_worker_state(WorkerState::Suspended);
        }
        ack.fire();
    }

    /// Admits the events left in a batch after signal processing.
    fn admit_events(&mut self, batch: Vec<QueueItem<InputEvent>>) {
        for item in batch {
            let event = match item {
                QueueItem::Event(event) => event,
                QueueItem::Signal { .. } => continue,
            };
            match event {
                InputEvent::New { machine, payload } => {
                    if !self.slot.matrix().has_machine(machine) {
                        tracing::warn!(machine, "event for unregistered machine dropped");
                        continue;
                    }
                    self.slot.create_element(machine, payload);
                }
                InputEvent::Continuation { element, payload } => {
                    self.resume_element(element, payload);
                }
            }
        }
    }

    fn resume_element(&mut self, id: ElementId, payload: Payload) {
        match self.slot.membership(id) {
            Some(ListKind::NotActive) => self.slot.reactivate(id, payload),
            membership => {
                tracing::debug!(
                    element = id,
                    ?membership,
                    "continuation without a parked element discarded",
                );
            }
        }
    }

    /// A Past slot must drain in-flight work: admitted events flip it back
    /// to Working even when the pulse protocol has already suspended it.
    /// Past never rotates further, so there is nothing to wait for.
    fn past_reactivation(&mut self, admitted: bool) {
        if admitted
            && self.slot.phase() == PulsePhase::Past
            && matches!(
                self.slot.worker_state(),
                WorkerState::Suspending | WorkerState::Suspended
            )
        {
            if self.activation_seen {
                // the activation is consumed; its ack has already fired and
                // a Past resume would land back in Working anyway
                self.activation_seen = false;
                self.pulse_pending = false;
            }
            self.slot.set_worker_state(WorkerState::Working);
        }
    }

    // ---- responses ----

    /// Drains the response queue, moving matched elements to the Response
    /// list and discarding orphans.
    fn read_response_queue(&mut self) {
        for item in self.slot.responses.drain() {
            let response = match item {
                QueueItem::Event(response) => response,
                QueueItem::Signal { code, mut ack } => {
                    tracing::debug!(code, "signal on response queue ignored");
                    ack.fire();
                    continue;
                }
            };
            if let Err(orphan) = self.slot.complete_response(response) {
                tracing::debug!(
                    element = orphan.element,
                    state = orphan.state,
                    "orphan adapter response discarded",
                );
                self.slot.bus().publish(
                    Event::now(EventKind::OrphanResponse)
                        .with_phase(self.slot.phase())
                        .with_pulse(self.slot.pulse())
                        .with_element(orphan.element),
                );
            }
        }
    }

    // ---- element stepping ----

    /// Runs one handler invocation per element currently on `kind`.
    fn step_list(&mut self, kind: ListKind) {
        for id in self.slot.take_list(kind) {
            self.step_element(id, kind);
        }
    }

    fn step_element(&mut self, id: ElementId, origin: ListKind) {
        let Some(mut el) = self.slot.take_from_map(id) else {
            return;
        };
        let machine = match self.slot.matrix().machine(self.slot.phase(), el.machine) {
            Some(machine) => Arc::clone(machine),
            None => {
                tracing::error!(
                    element = id,
                    machine = el.machine,
                    phase = %self.slot.phase(),
                    "no machine registered for element; terminated",
                );
                self.slot.publish_terminated(&el);
                return;
            }
        };

        let ctx = self.slot.context_for(&el);
        el.touch();
        let invoked_in = el.state;

        let outcome = match origin {
            ListKind::Response => {
                let dispatch_state = el.dispatch_state.take().unwrap_or(el.state);
                let result = el.response.take().unwrap_or(Err(AdapterError::Canceled));
                match machine.response(dispatch_state) {
                    Some(handler) => {
                        let handler = Arc::clone(handler);
                        catch_handler(|| handler(&ctx, &mut el.payload, result))
                    }
                    None => {
                        tracing::error!(
                            element = id,
                            state = dispatch_state,
                            "no response handler registered; element terminated",
                        );
                        self.slot.publish_terminated(&el);
                        return;
                    }
                }
            }
            _ => match machine.transition(el.state) {
                Some(handler) => {
                    let handler = Arc::clone(handler);
                    catch_handler(|| handler(&ctx, &mut el.payload))
                }
                None => {
                    tracing::error!(
                        element = id,
                        state = el.state,
                        "no transition handler registered; element terminated",
                    );
                    self.slot.publish_terminated(&el);
                    return;
                }
            },
        };

        match outcome {
            Err(message) => {
                tracing::error!(element = id, panic = %message, "handler panicked; element terminated");
                self.slot.bus().publish(
                    Event::now(EventKind::HandlerPanicked)
                        .with_phase(self.slot.phase())
                        .with_pulse(self.slot.pulse())
                        .with_element(id)
                        .with_error(message),
                );
                self.slot.publish_terminated(&el);
            }
            Ok(transition) if transition.is_terminal() => {
                self.slot.publish_terminated(&el);
            }
            Ok(Transition { next, payload, job }) => {
                el.state = next;
                if let Some(payload) = payload {
                    el.payload = payload;
                }
                match job {
                    Some(job) => {
                        el.dispatch_state = Some(invoked_in);
                        self.dispatch(id, invoked_in, job);
                        self.slot.insert_element(el, ListKind::NotActive);
                    }
                    None => self.slot.insert_element(el, ListKind::Active),
                }
            }
        }
    }

    /// Spawns the adapter call; exactly one response per job lands on the
    /// slot's response queue.
    fn dispatch(&self, element: ElementId, state: ElementState, job: AdapterJob) {
        let responder = self.slot.responder();
        tokio::spawn(async move {
            let result = job.adapter.process(job.payload).await;
            let response = AdapterResponse {
                element,
                state,
                result,
            };
            if responder.post(response).await.is_err() {
                tracing::debug!(element, "slot gone before adapter response landed");
            }
        });
    }

    // ---- pulse rotation ----

    /// Relabels the slot into its next phase, migrates every element, and
    /// restarts the drain loop.
    fn resume(&mut self) {
        self.activation_seen = false;
        self.pulse_pending = false;
        let from = self.slot.phase();
        let to = from.next();
        if to != from {
            self.slot.set_phase(to);
            self.migrate(to);
        }
        self.slot.set_worker_state(WorkerState::Initializing);
    }

    /// Runs the destination phase's migration handler on every element.
    fn migrate(&mut self, to: PulsePhase) {
        for kind in [ListKind::Active, ListKind::NotActive, ListKind::Response] {
            for id in self.slot.take_list(kind) {
                self.migrate_element(id, kind, to);
            }
        }
    }

    fn migrate_element(&mut self, id: ElementId, origin: ListKind, to: PulsePhase) {
        let Some(mut el) = self.slot.take_from_map(id) else {
            return;
        };
        if origin == ListKind::Response {
            // responses pending at a phase switch are discarded
            el.response = None;
            el.dispatch_state = None;
        }
        let machine = match self.slot.matrix().machine(to, el.machine) {
            Some(machine) => Arc::clone(machine),
            None => {
                self.slot.publish_terminated(&el);
                return;
            }
        };
        let next = match machine.migration(el.state) {
            Some(handler) => {
                let handler = Arc::clone(handler);
                let ctx = self.slot.context_for(&el);
                match catch_handler(|| handler(&ctx, &mut el.payload)) {
                    Ok(next) => next,
                    Err(message) => {
                        tracing::error!(element = id, panic = %message, "migration handler panicked; element terminated");
                        self.slot.bus().publish(
                            Event::now(EventKind::HandlerPanicked)
                                .with_phase(to)
                                .with_pulse(self.slot.pulse())
                                .with_element(id)
                                .with_error(message),
                        );
                        self.slot.publish_terminated(&el);
                        return;
                    }
                }
            }
            None => el.state,
        };
        if next == TERMINATED_STATE {
            self.slot.publish_terminated(&el);
            return;
        }
        el.state = next;
        let destination = if origin == ListKind::NotActive {
            ListKind::NotActive
        } else {
            ListKind::Active
        };
        self.slot.insert_element(el, destination);
    }

    // ---- teardown ----

    /// A retired slot exits once it has drained to emptiness.
    fn done_draining(&self) -> bool {
        self.retire.is_cancelled()
            && self.slot.is_empty()
            && self.slot.input.is_empty()
            && self.slot.responses.is_empty()
    }

    /// Shutdown: terminate whatever is left, parked elements included.
    fn teardown(&mut self) {
        let count = self.slot.free_all();
        if count > 0 {
            tracing::debug!(
                count,
                phase = %self.slot.phase(),
                "terminated in-flight elements at shutdown",
            );
        }
        self.slot.set_worker_state(WorkerState::Suspended);
    }

    /// Programming error: log the diagnostic, mark the slot unhealthy, and
    /// stop. The conveyor can still report the slot's state.
    fn halt(&mut self, err: WorkerError) {
        tracing::error!(
            error = %err,
            label = err.as_label(),
            phase = %self.slot.phase(),
            pulse = self.slot.pulse(),
            "slot worker halted",
        );
        self.slot.mark_unhealthy(&err.to_string());
    }
}

/// Runs a handler, converting a panic into an error message.
fn catch_handler<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(|payload| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterFn, AdapterRef};
    use crate::config::Config;
    use crate::events::Bus;
    use crate::matrix::{INITIAL_STATE, Matrix, PhaseMachines, StateMachine, Transition};
    use crate::queue::SignalAck;
    use crate::slot::SlotHandle;

    const ALL_PHASES: [PulsePhase; 3] = [PulsePhase::Future, PulsePhase::Present, PulsePhase::Past];

    fn immediate_matrix() -> Arc<Matrix> {
        let machine = StateMachine::new()
            .on_transition(INITIAL_STATE, |_ctx, _p| Transition::finish())
            .on_migration(INITIAL_STATE, |_ctx, _p| TERMINATED_STATE);
        Arc::new(
            Matrix::builder()
                .register(1, PhaseMachines::uniform(machine))
                .unwrap()
                .build(),
        )
    }

    fn make_slot_and_worker(phase: PulsePhase) -> (Worker, SlotHandle) {
        make_with_matrix(phase, immediate_matrix())
    }

    fn make_with_matrix(phase: PulsePhase, matrix: Arc<Matrix>) -> (Worker, SlotHandle) {
        let cfg = Config::default();
        let (slot, handle) = Slot::new(phase, 22, matrix, Bus::new(256), &cfg);
        let worker = Worker::new(slot, CancellationToken::new(), &cfg);
        (worker, handle)
    }

    fn event(n: u32) -> QueueItem<InputEvent> {
        QueueItem::Event(InputEvent::New {
            machine: 1,
            payload: Box::new(n),
        })
    }

    fn signal(code: u32) -> QueueItem<InputEvent> {
        QueueItem::Signal {
            code,
            ack: SignalAck::noop(),
        }
    }

    // ---- process_signals_working ----

    #[tokio::test]
    async fn process_signals_working_empty_input() {
        for phase in ALL_PHASES {
            let (mut worker, _handle) = make_slot_and_worker(phase);
            worker.slot.set_worker_state(WorkerState::Working);
            let mut batch = Vec::new();
            assert_eq!(worker.process_signals_working(&mut batch).unwrap(), 0);
            assert_eq!(worker.slot.worker_state(), WorkerState::Working);
        }
    }

    #[tokio::test]
    async fn process_signals_working_ignores_non_signals() {
        for phase in ALL_PHASES {
            let (mut worker, _handle) = make_slot_and_worker(phase);
            worker.slot.set_worker_state(WorkerState::Working);
            let mut batch = vec![event(1), event(2), event(3)];
            assert_eq!(worker.process_signals_working(&mut batch).unwrap(), 0);
            assert_eq!(batch.len(), 3, "events stay for the admission pass");
            assert_eq!(worker.slot.worker_state(), WorkerState::Working);
        }
    }

    #[tokio::test]
    async fn process_signals_working_bad_signal_halts() {
        for phase in ALL_PHASES {
            let (mut worker, _handle) = make_slot_and_worker(phase);
            worker.slot.set_worker_state(WorkerState::Working);
            let mut batch = vec![signal(9999999)];
            let err = worker.process_signals_working(&mut batch).unwrap_err();
            assert_eq!(err, WorkerError::UnknownSignal { code: 9999999 });
            assert_eq!(err.to_string(), "Unknown signal: 9999999");
        }
    }

    #[tokio::test]
    async fn process_signals_working_pending_suspends() {
        for phase in ALL_PHASES {
            let (mut worker, _handle) = make_slot_and_worker(phase);
            worker.slot.set_worker_state(WorkerState::Working);
            let mut batch = vec![signal(PENDING_PULSE_SIGNAL)];
            assert_eq!(worker.process_signals_working(&mut batch).unwrap(), 1);
            assert_eq!(worker.slot.worker_state(), WorkerState::Suspending);
        }
    }

    #[tokio::test]
    async fn process_signals_working_stray_activation_is_noop() {
        for phase in ALL_PHASES {
            let (mut worker, _handle) = make_slot_and_worker(phase);
            worker.slot.set_worker_state(WorkerState::Working);
            let (ack, fired) = SignalAck::new();
            let mut batch = vec![QueueItem::Signal {
                code: ACTIVATE_PULSE_SIGNAL,
                ack,
            }];
            assert_eq!(worker.process_signals_working(&mut batch).unwrap(), 1);
            assert_eq!(worker.slot.worker_state(), WorkerState::Working);
            fired.await.expect("stray activation still acked");
        }
    }

    #[tokio::test]
    async fn process_signals_working_retains_activation_after_pending() {
        for phase in ALL_PHASES {
            let (mut worker, _handle) = make_slot_and_worker(phase);
            worker.slot.set_worker_state(WorkerState::Working);
            let mut batch = vec![signal(PENDING_PULSE_SIGNAL), signal(ACTIVATE_PULSE_SIGNAL)];
            assert_eq!(worker.process_signals_working(&mut batch).unwrap(), 2);
            assert_eq!(worker.slot.worker_state(), WorkerState::Suspending);

            let surviving = worker.slot.input.drain();
            assert_eq!(surviving.len(), 1);
            match &surviving[0] {
                QueueItem::Signal { code, .. } => assert_eq!(*code, ACTIVATE_PULSE_SIGNAL),
                QueueItem::Event(_) => panic!("expected the retained activation signal"),
            }
        }
    }

    // ---- read_input_queue_working ----

    #[tokio::test]
    async fn read_input_queue_working_admits_events_in_order() {
        for phase in ALL_PHASES {
            let (mut worker, handle) = make_slot_and_worker(phase);
            worker.slot.set_worker_state(WorkerState::Working);

            handle
                .push_signal(ACTIVATE_PULSE_SIGNAL, SignalAck::noop())
                .await
                .unwrap();
            for i in 0..20u32 {
                handle
                    .submit(InputEvent::New {
                        machine: 1,
                        payload: Box::new(i),
                    })
                    .unwrap();
            }

            worker.read_input_queue_working().await.unwrap();

            for i in 0..20u32 {
                let el = worker.slot.pop_element(ListKind::Active).expect("admitted");
                assert_eq!(*el.payload.downcast::<u32>().unwrap(), i);
            }
            assert_eq!(worker.slot.list_len(ListKind::Active), 0);
        }
    }

    #[tokio::test]
    async fn read_input_queue_working_empty_queue_is_noop() {
        let (mut worker, _handle) = make_slot_and_worker(PulsePhase::Present);
        worker.slot.set_worker_state(WorkerState::Working);
        worker.read_input_queue_working().await.unwrap();
        assert_eq!(worker.slot.worker_state(), WorkerState::Working);
        assert!(worker.slot.is_empty());
    }

    // ---- process_signals_suspending ----

    #[tokio::test]
    async fn process_signals_suspending_pending_is_noop() {
        for phase in ALL_PHASES {
            let (mut worker, _handle) = make_slot_and_worker(phase);
            worker.slot.set_worker_state(WorkerState::Suspending);
            let mut batch = vec![signal(PENDING_PULSE_SIGNAL)];
            assert_eq!(worker.process_signals_suspending(&mut batch).unwrap(), 1);
            assert_eq!(worker.slot.worker_state(), WorkerState::Suspending);
        }
    }

    #[tokio::test]
    async fn process_signals_suspending_activation_reaches_barrier() {
        for phase in ALL_PHASES {
            let (mut worker, _handle) = make_slot_and_worker(phase);
            worker.slot.set_worker_state(WorkerState::Suspending);
            let (ack, fired) = SignalAck::new();
            let mut batch = vec![QueueItem::Signal {
                code: ACTIVATE_PULSE_SIGNAL,
                ack,
            }];
            assert_eq!(worker.process_signals_suspending(&mut batch).unwrap(), 1);
            assert_eq!(worker.slot.worker_state(), WorkerState::Suspended);
            assert!(worker.activation_seen);
            fired.await.expect("ack fires at the barrier");
        }
    }

    #[tokio::test]
    async fn process_signals_suspending_bad_signal_halts() {
        let (mut worker, _handle) = make_slot_and_worker(PulsePhase::Present);
        worker.slot.set_worker_state(WorkerState::Suspending);
        let mut batch = vec![signal(424242)];
        let err = worker.process_signals_suspending(&mut batch).unwrap_err();
        assert_eq!(err.to_string(), "Unknown signal: 424242");
    }

    // ---- read_input_queue_suspending ----

    #[tokio::test]
    async fn suspending_buffers_events_without_processing() {
        for phase in [PulsePhase::Future, PulsePhase::Present] {
            let (mut worker, handle) = make_slot_and_worker(phase);
            worker.slot.set_worker_state(WorkerState::Suspending);
            handle
                .submit(InputEvent::New {
                    machine: 1,
                    payload: Box::new(99u32),
                })
                .unwrap();

            worker.read_input_queue_suspending().await.unwrap();

            assert_eq!(worker.slot.worker_state(), WorkerState::Suspending);
            let el = worker.slot.pop_element(ListKind::Active).expect("buffered");
            assert_eq!(*el.payload.downcast::<u32>().unwrap(), 99);
        }
    }

    #[tokio::test]
    async fn suspending_past_slot_keeps_draining() {
        let (mut worker, handle) = make_slot_and_worker(PulsePhase::Past);
        worker.slot.set_worker_state(WorkerState::Suspending);
        for i in 0..20u32 {
            handle
                .submit(InputEvent::New {
                    machine: 1,
                    payload: Box::new(i),
                })
                .unwrap();
        }

        worker.read_input_queue_suspending().await.unwrap();

        assert_eq!(worker.slot.worker_state(), WorkerState::Working);
        assert_eq!(worker.slot.list_len(ListKind::Active), 20);
    }

    #[tokio::test]
    async fn suspending_past_slot_drains_even_after_activation() {
        let (mut worker, handle) = make_slot_and_worker(PulsePhase::Past);
        worker.slot.set_worker_state(WorkerState::Suspending);
        handle
            .push_signal(ACTIVATE_PULSE_SIGNAL, SignalAck::noop())
            .await
            .unwrap();
        for i in 0..20u32 {
            handle
                .submit(InputEvent::New {
                    machine: 1,
                    payload: Box::new(i),
                })
                .unwrap();
        }

        worker.read_input_queue_suspending().await.unwrap();

        // admitted events win over the activation: the slot goes straight
        // back to draining
        assert_eq!(worker.slot.worker_state(), WorkerState::Working);
        for i in 0..20u32 {
            let el = worker.slot.pop_element(ListKind::Active).expect("admitted");
            assert_eq!(*el.payload.downcast::<u32>().unwrap(), i);
        }
    }

    // ---- responses ----

    #[tokio::test]
    async fn orphan_response_leaves_lists_untouched() {
        let (mut worker, handle) = make_slot_and_worker(PulsePhase::Present);
        worker.slot.set_worker_state(WorkerState::Working);
        handle
            .responder()
            .try_post(AdapterResponse {
                element: 12345,
                state: 1,
                result: Ok(Box::new(())),
            })
            .unwrap();

        worker.read_response_queue();

        assert!(worker.slot.is_empty());
        for kind in [ListKind::Active, ListKind::NotActive, ListKind::Response] {
            assert_eq!(worker.slot.list_len(kind), 0);
        }
    }

    // ---- element stepping ----

    fn dispatching_matrix() -> Arc<Matrix> {
        let echo: AdapterRef = AdapterFn::arc("echo", |job: Payload| async move { Ok(job) });
        let machine = StateMachine::new()
            .on_transition(1, move |_ctx, _p| {
                Transition::to(2).dispatch(echo.clone(), 7u32)
            })
            .on_response(1, |_ctx, _p, result| {
                assert!(result.is_ok());
                Transition::to(3)
            })
            .on_transition(3, |_ctx, _p| Transition::finish());
        Arc::new(
            Matrix::builder()
                .register(1, PhaseMachines::uniform(machine))
                .unwrap()
                .build(),
        )
    }

    #[tokio::test]
    async fn dispatch_parks_element_until_matching_response() {
        let (mut worker, _handle) = make_with_matrix(PulsePhase::Present, dispatching_matrix());
        worker.slot.set_worker_state(WorkerState::Working);

        let id = worker.slot.create_element(1, Box::new(0u32));
        worker.step_list(ListKind::Active);

        assert_eq!(worker.slot.membership(id), Some(ListKind::NotActive));

        // let the spawned adapter post its response
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.read_response_queue();
        assert_eq!(worker.slot.membership(id), Some(ListKind::Response));

        // response handler runs, then state 3 finishes the element
        worker.step_list(ListKind::Response);
        assert_eq!(worker.slot.membership(id), Some(ListKind::Active));
        worker.step_list(ListKind::Active);
        assert!(worker.slot.is_empty());
    }

    #[tokio::test]
    async fn handler_panic_terminates_only_offending_element() {
        let machine = StateMachine::new()
            .on_transition(1, |_ctx, payload: &mut Payload| {
                let n = *payload.downcast_ref::<u32>().unwrap();
                if n == 13 {
                    Transition::to(2)
                } else {
                    Transition::finish()
                }
            })
            .on_transition(2, |_ctx, _p| panic!("boom on state 2"));
        let matrix = Arc::new(
            Matrix::builder()
                .register(1, PhaseMachines::uniform(machine))
                .unwrap()
                .build(),
        );
        let (mut worker, _handle) = make_with_matrix(PulsePhase::Present, matrix);
        worker.slot.set_worker_state(WorkerState::Working);

        let doomed = worker.slot.create_element(1, Box::new(13u32));
        let healthy = worker.slot.create_element(1, Box::new(1u32));

        // first pass: doomed reaches state 2, healthy terminates cleanly
        worker.step_list(ListKind::Active);
        assert_eq!(worker.slot.membership(doomed), Some(ListKind::Active));
        assert_eq!(worker.slot.membership(healthy), None);

        // second pass: the panic terminates only the offending element
        worker.step_list(ListKind::Active);
        assert_eq!(worker.slot.membership(doomed), None);
        assert!(worker.slot.is_empty());
        assert_eq!(worker.slot.worker_state(), WorkerState::Working);
    }

    #[tokio::test]
    async fn missing_transition_handler_terminates_element() {
        let machine = StateMachine::new().on_transition(1, |_ctx, _p| Transition::to(7));
        let matrix = Arc::new(
            Matrix::builder()
                .register(1, PhaseMachines::uniform(machine))
                .unwrap()
                .build(),
        );
        let (mut worker, _handle) = make_with_matrix(PulsePhase::Present, matrix);
        worker.slot.set_worker_state(WorkerState::Working);

        let id = worker.slot.create_element(1, Box::new(0u32));
        worker.step_list(ListKind::Active);
        assert_eq!(worker.slot.membership(id), Some(ListKind::Active));

        // state 7 has no handler: the element is terminated, worker lives
        worker.step_list(ListKind::Active);
        assert_eq!(worker.slot.membership(id), None);
        assert_eq!(worker.slot.worker_state(), WorkerState::Working);
    }

    // ---- migration ----

    #[tokio::test]
    async fn resume_rotates_phase_and_migrates_elements() {
        let machine = StateMachine::new()
            .on_transition(1, |_ctx, _p| Transition::to(2))
            .on_migration(1, |_ctx, payload: &mut Payload| {
                let n = *payload.downcast_ref::<u32>().unwrap();
                if n == 0 { TERMINATED_STATE } else { 5 }
            });
        let matrix = Arc::new(
            Matrix::builder()
                .register(1, PhaseMachines::uniform(machine))
                .unwrap()
                .build(),
        );
        let (mut worker, _handle) = make_with_matrix(PulsePhase::Future, matrix);
        worker.slot.set_worker_state(WorkerState::Suspended);
        worker.activation_seen = true;

        let killed = worker.slot.create_element(1, Box::new(0u32));
        let survivor = worker.slot.create_element(1, Box::new(1u32));

        worker.suspended().await.unwrap();

        assert_eq!(worker.slot.phase(), PulsePhase::Present);
        assert_eq!(worker.slot.worker_state(), WorkerState::Initializing);
        assert_eq!(worker.slot.membership(killed), None);
        assert_eq!(worker.slot.membership(survivor), Some(ListKind::Active));
    }

    #[tokio::test]
    async fn past_slot_does_not_migrate_on_resume() {
        let (mut worker, _handle) = make_slot_and_worker(PulsePhase::Past);
        worker.slot.set_worker_state(WorkerState::Suspended);
        worker.activation_seen = true;
        let id = worker.slot.create_element(1, Box::new(1u32));

        worker.suspended().await.unwrap();

        // Past stays Past; the terminating migration handler never ran
        assert_eq!(worker.slot.phase(), PulsePhase::Past);
        assert_eq!(worker.slot.membership(id), Some(ListKind::Active));
    }

    // ---- full worker loop ----

    #[tokio::test]
    async fn worker_halts_on_unknown_signal_and_reports_state() {
        let (worker, handle) = make_slot_and_worker(PulsePhase::Present);
        let task = tokio::spawn(worker.run());

        handle
            .push_signal(9999999, SignalAck::noop())
            .await
            .unwrap();

        task.await.unwrap();
        let status = handle.status();
        assert!(!status.healthy);
        assert_eq!(status.phase, PulsePhase::Present);
        // pushing after the halt reports a closed queue
        assert!(handle
            .submit(InputEvent::New {
                machine: 1,
                payload: Box::new(0u32),
            })
            .is_err());
    }

    #[tokio::test]
    async fn worker_suspends_and_resumes_across_a_pulse() {
        let (worker, handle) = make_slot_and_worker(PulsePhase::Future);
        let shutdown = CancellationToken::new();
        let mut worker = worker;
        worker.shutdown = shutdown.clone();
        let task = tokio::spawn(worker.run());

        let (pending_ack, pending_fired) = SignalAck::new();
        handle
            .push_signal(PENDING_PULSE_SIGNAL, pending_ack)
            .await
            .unwrap();
        pending_fired.await.expect("pending observed");

        let (activate_ack, activate_fired) = SignalAck::new();
        handle
            .push_signal(ACTIVATE_PULSE_SIGNAL, activate_ack)
            .await
            .unwrap();
        activate_fired.await.expect("worker reached the barrier");

        let status = handle
            .wait_status(|s| s.phase == PulsePhase::Present && s.worker == WorkerState::Working)
            .await;
        assert_eq!(status.phase, PulsePhase::Present);

        shutdown.cancel();
        task.await.unwrap();
    }
}
