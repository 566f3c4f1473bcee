//! # Runtime events emitted by the conveyor and its slot workers.
//!
//! The [`EventKind`] enum classifies events across three categories:
//! - **Pulse events**: the two-phase pulse protocol (prepared, activated)
//! - **Slot events**: worker lifecycle (state changes, resumption, halts)
//! - **Element events**: per-element outcomes (terminated, handler panics,
//!   orphaned responses)
//!
//! The [`Event`] struct carries metadata such as the slot's phase and pulse
//! number, the element id, and error text.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically, so subscribers can order events correctly even when they
//! are delivered through independent channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::element::ElementId;
use crate::pulse::{PulseNumber, PulsePhase};
use crate::worker::WorkerState;

static SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A pulse switch started; pending signals are being delivered.
    PulsePrepared,
    /// A pulse switch completed; the slot table has been rotated.
    PulseActivated,
    /// A slot worker moved to a new state.
    WorkerStateChanged,
    /// A slot worker halted on a programming error; the slot is unhealthy.
    WorkerHalted,
    /// An element reached the terminated state and was freed.
    ElementTerminated,
    /// A user handler panicked; the offending element was terminated.
    HandlerPanicked,
    /// An adapter response arrived with no matching parked element.
    OrphanResponse,
    /// Shutdown was requested; no further submissions are accepted.
    ShutdownRequested,
    /// All slot workers stopped within the grace period.
    AllStoppedWithin,
    /// The grace period elapsed with workers still running.
    GraceExceeded,
}

impl EventKind {
    /// Stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            EventKind::PulsePrepared => "pulse_prepared",
            EventKind::PulseActivated => "pulse_activated",
            EventKind::WorkerStateChanged => "worker_state_changed",
            EventKind::WorkerHalted => "worker_halted",
            EventKind::ElementTerminated => "element_terminated",
            EventKind::HandlerPanicked => "handler_panicked",
            EventKind::OrphanResponse => "orphan_response",
            EventKind::ShutdownRequested => "shutdown_requested",
            EventKind::AllStoppedWithin => "all_stopped_within",
            EventKind::GraceExceeded => "grace_exceeded",
        }
    }
}

/// A runtime event with optional context fields.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally monotonic sequence number.
    pub seq: u64,
    /// Wall-clock time the event was created.
    pub at: SystemTime,
    /// What happened.
    pub kind: EventKind,
    /// Phase of the slot the event concerns.
    pub phase: Option<PulsePhase>,
    /// Pulse number of the slot (or the pulse being switched to).
    pub pulse: Option<PulseNumber>,
    /// Element the event concerns.
    pub element: Option<ElementId>,
    /// Worker state after the event.
    pub worker: Option<WorkerState>,
    /// Error or diagnostic text.
    pub error: Option<String>,
}

impl Event {
    /// Creates an event stamped with the next sequence number.
    pub fn now(kind: EventKind) -> Event {
        Event {
            seq: SEQ.fetch_add(1, Ordering::Relaxed),
            at: SystemTime::now(),
            kind,
            phase: None,
            pulse: None,
            element: None,
            worker: None,
            error: None,
        }
    }

    /// Attaches the slot phase.
    pub fn with_phase(mut self, phase: PulsePhase) -> Event {
        self.phase = Some(phase);
        self
    }

    /// Attaches the pulse number.
    pub fn with_pulse(mut self, pulse: PulseNumber) -> Event {
        self.pulse = Some(pulse);
        self
    }

    /// Attaches the element id.
    pub fn with_element(mut self, element: ElementId) -> Event {
        self.element = Some(element);
        self
    }

    /// Attaches the worker state.
    pub fn with_worker(mut self, worker: WorkerState) -> Event {
        self.worker = Some(worker);
        self
    }

    /// Attaches diagnostic text.
    pub fn with_error(mut self, error: impl Into<String>) -> Event {
        self.error = Some(error.into());
        self
    }
}
