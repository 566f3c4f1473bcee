//! Slot elements: one live FSM instance each, tracked by list membership.

use std::any::Any;
use std::fmt;
use std::time::Instant;

use crate::adapter::AdapterResult;
use crate::matrix::{ElementState, MachineType};

/// Slot-scoped unique element identifier.
pub type ElementId = u64;

/// Opaque payload carried by events and elements; handlers downcast it.
pub type Payload = Box<dyn Any + Send>;

/// A payload admitted from a slot's input queue.
pub enum InputEvent {
    /// Seed a fresh element for `machine`, starting at the initial state.
    New {
        /// Machine type the element runs.
        machine: MachineType,
        /// Event payload handed to the first transition handler.
        payload: Payload,
    },
    /// Re-activate a parked element instead of creating a new one.
    ///
    /// The continuation payload replaces the element's payload. A
    /// continuation for an element that is unknown or not parked is
    /// discarded with a debug diagnostic, like an orphan response.
    Continuation {
        /// The parked element to resume.
        element: ElementId,
        /// Replacement payload.
        payload: Payload,
    },
}

// the payload is opaque; only the routing fields are shown
impl fmt::Debug for InputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputEvent::New { machine, .. } => f
                .debug_struct("New")
                .field("machine", machine)
                .finish_non_exhaustive(),
            InputEvent::Continuation { element, .. } => f
                .debug_struct("Continuation")
                .field("element", element)
                .finish_non_exhaustive(),
        }
    }
}

/// Which of the slot's three lists an element currently sits on.
///
/// An element is a member of exactly one list at all times until it is
/// freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// Ready to be advanced on the next worker step.
    Active,
    /// Parked awaiting an adapter response.
    NotActive,
    /// An adapter response has arrived; the response handler runs next.
    Response,
}

impl ListKind {
    pub(crate) fn index(self) -> usize {
        match self {
            ListKind::Active => 0,
            ListKind::NotActive => 1,
            ListKind::Response => 2,
        }
    }

    /// Stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ListKind::Active => "active",
            ListKind::NotActive => "not_active",
            ListKind::Response => "response",
        }
    }
}

/// One in-flight FSM instance owned by a slot.
pub(crate) struct Element {
    pub(crate) id: ElementId,
    pub(crate) machine: MachineType,
    pub(crate) state: ElementState,
    pub(crate) payload: Payload,
    pub(crate) membership: ListKind,
    /// State the element was in when its adapter job was dispatched;
    /// responses must match it exactly.
    pub(crate) dispatch_state: Option<ElementState>,
    /// Result stored when the element moved to the Response list.
    pub(crate) response: Option<AdapterResult>,
    pub(crate) last_activity: Instant,
}

impl Element {
    pub(crate) fn new(id: ElementId, machine: MachineType, state: ElementState, payload: Payload) -> Self {
        Element {
            id,
            machine,
            state,
            payload,
            membership: ListKind::Active,
            dispatch_state: None,
            response: None,
            last_activity: Instant::now(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("id", &self.id)
            .field("machine", &self.machine)
            .field("state", &self.state)
            .field("membership", &self.membership)
            .field("dispatch_state", &self.dispatch_state)
            .finish_non_exhaustive()
    }
}
