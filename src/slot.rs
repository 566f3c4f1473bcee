//! # Slot: the pulse-scoped container a single worker owns.
//!
//! A slot bundles everything one worker task operates on: the consumer
//! sides of the input and response queues, the three element lists, the
//! slot's pulse number and phase, and its worker state.
//!
//! ```text
//!              ┌──────────────────────────── Slot ───────────────────────┐
//!  submit ───► │ input queue ──► admission ──► [Active]                  │
//!              │                                  │ dispatch             │
//!  adapters ─► │ response queue ──► matching ──► [NotActive]──►[Response]│
//!              │                                                         │
//!              └── watch: SlotStatus (phase, pulse, worker, healthy) ────┘
//! ```
//!
//! ## Rules
//! - Only the owning worker mutates the lists; every other party goes
//!   through the queues on a [`SlotHandle`].
//! - An element is a member of exactly one list until it is freed.
//! - Element ids are slot-scoped and never reused.
//! - Response matching is strict: the element must be parked (NotActive)
//!   and the response's dispatch state must equal the element's.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::adapter::AdapterResponse;
use crate::config::Config;
use crate::element::{Element, ElementId, InputEvent, ListKind, Payload};
use crate::error::SubmitError;
use crate::events::{Bus, Event, EventKind};
use crate::matrix::{ElementState, INITIAL_STATE, MachineType, Matrix};
use crate::pulse::{PulseNumber, PulsePhase};
use crate::queue::{self, QueueReceiver, QueueSender, SignalAck};
use crate::worker::WorkerState;

/// Snapshot of a slot's externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    /// Temporal role at the current pulse.
    pub phase: PulsePhase,
    /// Pulse number the slot was created for.
    pub pulse: PulseNumber,
    /// Current worker state.
    pub worker: WorkerState,
    /// False once the worker has halted on a programming error.
    pub healthy: bool,
}

/// Producer-side handle for posting adapter responses into a slot.
///
/// Cheap to clone; safe to hand to adapter tasks. The response queue is
/// total-ordered: responses land in post order.
#[derive(Clone)]
pub struct Responder {
    tx: QueueSender<AdapterResponse>,
}

impl Responder {
    /// Posts a response, waiting for queue capacity if necessary.
    pub async fn post(&self, response: AdapterResponse) -> Result<(), SubmitError> {
        // the response queue carries plain events only, never signals
        self.tx.sink_push_wait(response).await
    }

    /// Posts a response without blocking.
    pub fn try_post(&self, response: AdapterResponse) -> Result<(), SubmitError> {
        self.tx.sink_push(response)
    }
}

/// Read-only view handed to handlers alongside the element payload.
pub struct SlotContext {
    element: ElementId,
    machine: MachineType,
    state: ElementState,
    phase: PulsePhase,
    pulse: PulseNumber,
    idle: std::time::Duration,
    responder: Responder,
}

impl SlotContext {
    /// Id of the element the handler runs for.
    pub fn element_id(&self) -> ElementId {
        self.element
    }

    /// Machine type of the element.
    pub fn machine_type(&self) -> MachineType {
        self.machine
    }

    /// Element state the handler was looked up with.
    pub fn state(&self) -> ElementState {
        self.state
    }

    /// Phase of the owning slot.
    pub fn phase(&self) -> PulsePhase {
        self.phase
    }

    /// Pulse number of the owning slot.
    pub fn pulse(&self) -> PulseNumber {
        self.pulse
    }

    /// How long the element has been waiting since its last activity.
    pub fn idle(&self) -> std::time::Duration {
        self.idle
    }

    /// Handle for posting responses into this slot from custom async flows.
    ///
    /// Most handlers never need this; dispatching through
    /// [`Transition::dispatch`](crate::Transition::dispatch) posts the
    /// response automatically.
    pub fn responder(&self) -> Responder {
        self.responder.clone()
    }
}

/// Cloneable producer-side handle to a slot, kept by the conveyor.
pub(crate) struct SlotHandle {
    input: QueueSender<InputEvent>,
    responses: QueueSender<AdapterResponse>,
    status: watch::Receiver<SlotStatus>,
    retire: CancellationToken,
}

impl SlotHandle {
    /// Pushes a data event; non-blocking.
    pub(crate) fn submit(&self, event: InputEvent) -> Result<(), SubmitError> {
        self.input.sink_push(event)
    }

    /// Pushes a control signal, waiting for capacity if necessary.
    pub(crate) async fn push_signal(&self, code: u32, ack: SignalAck) -> Result<(), SubmitError> {
        self.input.push_signal(code, ack).await
    }

    /// Responder for this slot's response queue.
    #[cfg(test)]
    pub(crate) fn responder(&self) -> Responder {
        Responder {
            tx: self.responses.clone(),
        }
    }

    /// Current status snapshot; stays readable after the worker exits.
    pub(crate) fn status(&self) -> SlotStatus {
        *self.status.borrow()
    }

    /// Waits until the worker state satisfies `pred` (or the worker is gone).
    #[cfg(test)]
    pub(crate) async fn wait_status(&self, pred: impl Fn(&SlotStatus) -> bool) -> SlotStatus {
        let mut rx = self.status.clone();
        loop {
            let current = *rx.borrow_and_update();
            if pred(&current) {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Tells the worker to drain to quiescence and exit.
    pub(crate) fn retire(&self) {
        self.retire.cancel();
    }
}

impl Clone for SlotHandle {
    fn clone(&self) -> Self {
        SlotHandle {
            input: self.input.clone(),
            responses: self.responses.clone(),
            status: self.status.clone(),
            retire: self.retire.clone(),
        }
    }
}

/// The worker-private state of one slot.
pub(crate) struct Slot {
    phase: PulsePhase,
    pulse: PulseNumber,
    worker_state: WorkerState,
    healthy: bool,

    pub(crate) input: QueueReceiver<InputEvent>,
    pub(crate) responses: QueueReceiver<AdapterResponse>,
    responder: Responder,
    retire: CancellationToken,

    matrix: Arc<Matrix>,
    bus: Bus,

    elements: HashMap<ElementId, Element>,
    lists: [VecDeque<ElementId>; 3],
    next_element_id: ElementId,

    status_tx: watch::Sender<SlotStatus>,
}

impl Slot {
    /// Creates a slot and the handle producers use to reach it.
    pub(crate) fn new(
        phase: PulsePhase,
        pulse: PulseNumber,
        matrix: Arc<Matrix>,
        bus: Bus,
        cfg: &Config,
    ) -> (Slot, SlotHandle) {
        let (input_tx, input_rx) = queue::bounded(cfg.input_capacity);
        let (resp_tx, resp_rx) = queue::bounded(cfg.response_capacity);
        let retire = CancellationToken::new();

        let status = SlotStatus {
            phase,
            pulse,
            worker: WorkerState::Initializing,
            healthy: true,
        };
        let (status_tx, status_rx) = watch::channel(status);

        let slot = Slot {
            phase,
            pulse,
            worker_state: WorkerState::Initializing,
            healthy: true,
            input: input_rx,
            responses: resp_rx,
            responder: Responder {
                tx: resp_tx.clone(),
            },
            retire: retire.clone(),
            matrix,
            bus,
            elements: HashMap::new(),
            lists: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            next_element_id: 1,
            status_tx,
        };
        let handle = SlotHandle {
            input: input_tx,
            responses: resp_tx,
            status: status_rx,
            retire,
        };
        (slot, handle)
    }

    pub(crate) fn phase(&self) -> PulsePhase {
        self.phase
    }

    pub(crate) fn pulse(&self) -> PulseNumber {
        self.pulse
    }

    pub(crate) fn worker_state(&self) -> WorkerState {
        self.worker_state
    }

    pub(crate) fn matrix(&self) -> &Arc<Matrix> {
        &self.matrix
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    pub(crate) fn responder(&self) -> Responder {
        self.responder.clone()
    }

    pub(crate) fn retire_token(&self) -> CancellationToken {
        self.retire.clone()
    }

    /// Moves the slot to its next phase at pulse activation.
    pub(crate) fn set_phase(&mut self, phase: PulsePhase) {
        self.phase = phase;
        self.publish_status();
    }

    /// Records a worker state change and announces it.
    pub(crate) fn set_worker_state(&mut self, state: WorkerState) {
        if self.worker_state == state {
            return;
        }
        self.worker_state = state;
        self.publish_status();
        self.bus.publish(
            Event::now(EventKind::WorkerStateChanged)
                .with_phase(self.phase)
                .with_pulse(self.pulse)
                .with_worker(state),
        );
    }

    /// Marks the slot unhealthy after a worker halt.
    pub(crate) fn mark_unhealthy(&mut self, diagnostic: &str) {
        self.healthy = false;
        self.publish_status();
        self.bus.publish(
            Event::now(EventKind::WorkerHalted)
                .with_phase(self.phase)
                .with_pulse(self.pulse)
                .with_worker(self.worker_state)
                .with_error(diagnostic),
        );
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(SlotStatus {
            phase: self.phase,
            pulse: self.pulse,
            worker: self.worker_state,
            healthy: self.healthy,
        });
    }

    /// Seeds a fresh element on the Active list and returns its id.
    pub(crate) fn create_element(&mut self, machine: MachineType, payload: Payload) -> ElementId {
        let id = self.next_element_id;
        self.next_element_id += 1;
        let element = Element::new(id, machine, INITIAL_STATE, payload);
        self.insert_element(element, ListKind::Active);
        id
    }

    /// Inserts `element` into `list`, updating its membership tag.
    pub(crate) fn insert_element(&mut self, mut element: Element, list: ListKind) {
        element.membership = list;
        self.lists[list.index()].push_back(element.id);
        self.elements.insert(element.id, element);
    }

    /// Removes an element from the map; the caller already holds its list
    /// slot (via [`take_list`](Slot::take_list)) or removes it explicitly.
    pub(crate) fn take_from_map(&mut self, id: ElementId) -> Option<Element> {
        self.elements.remove(&id)
    }

    /// Drains the id list for `kind`; the members stay in the map.
    pub(crate) fn take_list(&mut self, kind: ListKind) -> Vec<ElementId> {
        self.lists[kind.index()].drain(..).collect()
    }

    pub(crate) fn list_len(&self, kind: ListKind) -> usize {
        self.lists[kind.index()].len()
    }

    /// Where `id` currently lives, if it is still alive.
    pub(crate) fn membership(&self, id: ElementId) -> Option<ListKind> {
        self.elements.get(&id).map(|e| e.membership)
    }

    /// Pops the oldest element of `kind` out of the slot entirely.
    #[cfg(test)]
    pub(crate) fn pop_element(&mut self, kind: ListKind) -> Option<Element> {
        let id = self.lists[kind.index()].pop_front()?;
        self.elements.remove(&id)
    }

    /// Moves a matched adapter response onto its element.
    ///
    /// The element must be parked on NotActive and the response's dispatch
    /// state must equal the element's; otherwise the response is handed
    /// back for orphan handling.
    pub(crate) fn complete_response(
        &mut self,
        response: AdapterResponse,
    ) -> Result<ElementId, AdapterResponse> {
        let matched = match self.elements.get(&response.element) {
            Some(el) => {
                el.membership == ListKind::NotActive && el.dispatch_state == Some(response.state)
            }
            None => false,
        };
        if !matched {
            return Err(response);
        }

        let id = response.element;
        self.remove_from_list(id, ListKind::NotActive);
        let el = self.elements.get_mut(&id).expect("matched above");
        el.response = Some(response.result);
        el.membership = ListKind::Response;
        el.touch();
        self.lists[ListKind::Response.index()].push_back(id);
        Ok(id)
    }

    /// Re-activates a parked element with a continuation payload.
    pub(crate) fn reactivate(&mut self, id: ElementId, payload: Payload) {
        self.remove_from_list(id, ListKind::NotActive);
        if let Some(el) = self.elements.get_mut(&id) {
            el.payload = payload;
            el.dispatch_state = None;
            el.response = None;
            el.membership = ListKind::Active;
            el.touch();
            self.lists[ListKind::Active.index()].push_back(id);
        }
    }

    fn remove_from_list(&mut self, id: ElementId, kind: ListKind) {
        let list = &mut self.lists[kind.index()];
        if let Some(pos) = list.iter().position(|&x| x == id) {
            list.remove(pos);
        }
    }

    /// Builds the read-only view a handler receives for `element`.
    pub(crate) fn context_for(&self, element: &Element) -> SlotContext {
        SlotContext {
            element: element.id,
            machine: element.machine,
            state: element.state,
            phase: self.phase,
            pulse: self.pulse,
            idle: element.last_activity.elapsed(),
            responder: self.responder.clone(),
        }
    }

    /// Announces that an element reached the terminated state.
    pub(crate) fn publish_terminated(&self, element: &Element) {
        self.bus.publish(
            Event::now(EventKind::ElementTerminated)
                .with_phase(self.phase)
                .with_pulse(self.pulse)
                .with_element(element.id),
        );
    }

    /// Frees every element; returns how many were still alive.
    pub(crate) fn free_all(&mut self) -> usize {
        for list in &mut self.lists {
            list.clear();
        }
        let count = self.elements.len();
        for (_, el) in self.elements.drain() {
            self.bus.publish(
                Event::now(EventKind::ElementTerminated)
                    .with_phase(self.phase)
                    .with_pulse(self.pulse)
                    .with_element(el.id),
            );
        }
        count
    }

    /// Whether the slot holds no elements at all.
    pub(crate) fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Whether nothing is left to advance before suspension: elements may
    /// wait on adapters (NotActive) or for resumption (buffered Active),
    /// but no response work is pending.
    pub(crate) fn response_work_pending(&self) -> bool {
        self.list_len(ListKind::Response) > 0 || !self.responses.is_empty()
    }

    /// Sum of all live elements across the three lists.
    #[cfg(test)]
    pub(crate) fn element_count(&self) -> usize {
        self.elements.len()
    }
}
