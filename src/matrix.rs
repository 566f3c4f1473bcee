//! # State-machine registry: the phase × machine-type matrix.
//!
//! The [`Matrix`] is the frozen lookup table a conveyor runs against: for
//! each [`PulsePhase`] and registered [`MachineType`] it holds a
//! [`StateMachine`] descriptor, addressable at O(1).
//!
//! ```text
//!                machine 1      machine 2     …
//!   Future    ┌ StateMachine ┬ StateMachine ┐
//!   Present   ├ StateMachine ┼ StateMachine ┤
//!   Past      └ StateMachine ┴ StateMachine ┘
//! ```
//!
//! ## Rules
//! - Machine type 0 is reserved for the empty (terminated) machine.
//! - Machine types are append-only and must be registered in sequence
//!   (1, 2, 3, …); a single [`MatrixBuilder::register`] call supplies the
//!   descriptors for **all three** phases, so phases can never disagree on
//!   machine count.
//! - [`MatrixBuilder::build`] consumes the builder; the resulting matrix is
//!   immutable and shared by reference, so registration after a conveyor
//!   has started serving traffic is unrepresentable.
//!
//! A [`StateMachine`] maps element states to handlers:
//! - *transition* handlers advance an element and may dispatch adapter jobs,
//! - *response* handlers resume an element when its adapter result arrives,
//! - *migration* handlers run once when the element's slot changes phase.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::{AdapterJob, AdapterRef, AdapterResult};
use crate::element::Payload;
use crate::error::RegistryError;
use crate::pulse::PulsePhase;
use crate::slot::SlotContext;

/// Nonnegative state of an element; 0 is reserved for "terminated", 1 is
/// every machine's initial state.
pub type ElementState = u32;

/// Positive integer identifying a registered state machine.
pub type MachineType = u32;

/// The reserved "terminated" element state.
pub const TERMINATED_STATE: ElementState = 0;

/// The state every freshly seeded element starts in.
pub const INITIAL_STATE: ElementState = 1;

/// The machine type new events are seeded with unless the submitter picks
/// one explicitly.
pub const INITIAL_MACHINE: MachineType = 1;

/// Outcome of a transition or response handler.
///
/// A transition either completes synchronously (just a next state) or
/// asynchronously (a next state plus an adapter job that parks the element
/// until the response arrives). The dual return is a tagged value rather
/// than a sentinel.
///
/// ## Example
/// ```
/// use pulsevisor::Transition;
///
/// let done = Transition::finish();
/// let next = Transition::to(2).with_payload(42u64);
/// assert!(done.is_terminal());
/// assert!(!next.is_terminal());
/// ```
pub struct Transition {
    pub(crate) next: ElementState,
    pub(crate) payload: Option<Payload>,
    pub(crate) job: Option<AdapterJob>,
}

impl Transition {
    /// Advance the element to `state`.
    pub fn to(state: ElementState) -> Transition {
        Transition {
            next: state,
            payload: None,
            job: None,
        }
    }

    /// Terminate the element; it is removed from all lists and freed.
    pub fn finish() -> Transition {
        Transition::to(TERMINATED_STATE)
    }

    /// Replace the element's payload.
    pub fn with_payload(mut self, payload: impl std::any::Any + Send) -> Transition {
        self.payload = Some(Box::new(payload));
        self
    }

    /// Dispatch `job` to `adapter` and park the element until the response
    /// arrives.
    ///
    /// The element moves to the NotActive list; the response is matched
    /// against the state the dispatch occurred in.
    pub fn dispatch(mut self, adapter: AdapterRef, job: impl std::any::Any + Send) -> Transition {
        self.job = Some(AdapterJob {
            adapter,
            payload: Box::new(job),
        });
        self
    }

    /// Whether this transition terminates the element.
    pub fn is_terminal(&self) -> bool {
        self.next == TERMINATED_STATE
    }
}

/// Handler advancing an element that sits on the Active list.
pub type TransitionHandler = Arc<dyn Fn(&SlotContext, &mut Payload) -> Transition + Send + Sync>;

/// Handler resuming an element whose adapter response arrived.
pub type ResponseHandler =
    Arc<dyn Fn(&SlotContext, &mut Payload, AdapterResult) -> Transition + Send + Sync>;

/// Handler run once per element when its slot changes phase; returns the
/// element's state in the destination phase (0 terminates it).
pub type MigrationHandler = Arc<dyn Fn(&SlotContext, &mut Payload) -> ElementState + Send + Sync>;

/// Per-phase descriptor of one state machine: three handler maps keyed by
/// element state.
///
/// ## Example
/// ```
/// use pulsevisor::{StateMachine, Transition};
///
/// let machine = StateMachine::new()
///     .on_transition(1, |_ctx, _payload| Transition::to(2))
///     .on_transition(2, |_ctx, _payload| Transition::finish());
/// assert!(machine.transition(1).is_some());
/// assert!(machine.response(1).is_none());
/// ```
#[derive(Default, Clone)]
pub struct StateMachine {
    transitions: HashMap<ElementState, TransitionHandler>,
    responses: HashMap<ElementState, ResponseHandler>,
    migrations: HashMap<ElementState, MigrationHandler>,
}

impl StateMachine {
    /// Creates an empty descriptor.
    pub fn new() -> StateMachine {
        StateMachine::default()
    }

    /// Registers the transition handler for `state`.
    pub fn on_transition(
        mut self,
        state: ElementState,
        handler: impl Fn(&SlotContext, &mut Payload) -> Transition + Send + Sync + 'static,
    ) -> StateMachine {
        self.transitions.insert(state, Arc::new(handler));
        self
    }

    /// Registers the response handler for elements dispatched in `state`.
    pub fn on_response(
        mut self,
        state: ElementState,
        handler: impl Fn(&SlotContext, &mut Payload, AdapterResult) -> Transition + Send + Sync + 'static,
    ) -> StateMachine {
        self.responses.insert(state, Arc::new(handler));
        self
    }

    /// Registers the migration handler for `state`.
    pub fn on_migration(
        mut self,
        state: ElementState,
        handler: impl Fn(&SlotContext, &mut Payload) -> ElementState + Send + Sync + 'static,
    ) -> StateMachine {
        self.migrations.insert(state, Arc::new(handler));
        self
    }

    /// Looks up the transition handler for `state`.
    pub fn transition(&self, state: ElementState) -> Option<&TransitionHandler> {
        self.transitions.get(&state)
    }

    /// Looks up the response handler for dispatch state `state`.
    pub fn response(&self, state: ElementState) -> Option<&ResponseHandler> {
        self.responses.get(&state)
    }

    /// Looks up the migration handler for `state`.
    pub fn migration(&self, state: ElementState) -> Option<&MigrationHandler> {
        self.migrations.get(&state)
    }
}

/// The three per-phase descriptors a machine registers with.
pub struct PhaseMachines {
    /// Descriptor used while the element's slot is a Future slot.
    pub future: StateMachine,
    /// Descriptor used while the element's slot is the Present slot.
    pub present: StateMachine,
    /// Descriptor used while the element's slot is a Past slot.
    pub past: StateMachine,
}

impl PhaseMachines {
    /// Uses `machine` for all three phases.
    ///
    /// Handy for machines whose behavior does not depend on the slot's
    /// temporal role; handlers are shared, not rebuilt.
    pub fn uniform(machine: StateMachine) -> PhaseMachines {
        PhaseMachines {
            future: machine.clone(),
            present: machine.clone(),
            past: machine,
        }
    }
}

/// Builder for a [`Matrix`]. Machine types are appended in sequence across
/// all three phases at once.
pub struct MatrixBuilder {
    sets: [Vec<Arc<StateMachine>>; 3],
}

impl std::fmt::Debug for MatrixBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixBuilder")
            .field("sets", &[self.sets[0].len(), self.sets[1].len(), self.sets[2].len()])
            .finish()
    }
}

impl MatrixBuilder {
    fn new() -> MatrixBuilder {
        MatrixBuilder {
            sets: [Vec::new(), Vec::new(), Vec::new()],
        }
    }

    /// Registers `machine` under `machine_type`.
    ///
    /// Types must arrive in sequence starting at 1; a gap or repeat is
    /// rejected so the table stays dense and phases stay in step.
    pub fn register(
        mut self,
        machine_type: MachineType,
        phases: PhaseMachines,
    ) -> Result<MatrixBuilder, RegistryError> {
        let expected = (self.sets[0].len() + 1) as MachineType;
        if machine_type == 0 {
            return Err(RegistryError::ReservedType);
        }
        if machine_type != expected {
            return Err(RegistryError::OutOfSequence {
                expected,
                got: machine_type,
            });
        }
        self.sets[PulsePhase::Future.index()].push(Arc::new(phases.future));
        self.sets[PulsePhase::Present.index()].push(Arc::new(phases.present));
        self.sets[PulsePhase::Past.index()].push(Arc::new(phases.past));
        Ok(self)
    }

    /// Freezes the table.
    pub fn build(self) -> Matrix {
        Matrix { sets: self.sets }
    }
}

/// Frozen phase × machine-type registry. Immutable after construction and
/// shared by reference across all slot workers.
pub struct Matrix {
    sets: [Vec<Arc<StateMachine>>; 3],
}

impl Matrix {
    /// Starts building a matrix.
    pub fn builder() -> MatrixBuilder {
        MatrixBuilder::new()
    }

    /// Looks up the descriptor for (`phase`, `machine_type`).
    ///
    /// Returns `None` for machine type 0 (the empty machine) and for
    /// unregistered types.
    pub fn machine(&self, phase: PulsePhase, machine_type: MachineType) -> Option<&Arc<StateMachine>> {
        if machine_type == 0 {
            return None;
        }
        self.sets[phase.index()].get(machine_type as usize - 1)
    }

    /// Whether `machine_type` is registered.
    pub fn has_machine(&self, machine_type: MachineType) -> bool {
        machine_type != 0 && (machine_type as usize) <= self.sets[0].len()
    }

    /// Number of registered machines (the empty machine excluded).
    pub fn machine_count(&self) -> usize {
        self.sets[0].len()
    }
}
