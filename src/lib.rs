//! # pulsevisor
//!
//! **Pulsevisor** is a pulse-sliced conveyor: a scheduler that advances a
//! large population of independent state machines ("elements") through
//! their lifecycles across three temporal phases (Future, Present, Past).
//!
//! Each phase is served by a slot with a single cooperative worker task;
//! producers reach a slot only through bounded MPSC queues, and a global
//! "pulse" event atomically re-classifies every slot.
//!
//! ## Features
//!
//! | Area            | Description                                                       | Key types / traits                        |
//! |-----------------|-------------------------------------------------------------------|-------------------------------------------|
//! | **Conveyor**    | Three-slot registry, submission API, pulse switching, shutdown.   | [`Conveyor`], [`ConveyorBuilder`]         |
//! | **Registry**    | Frozen phase × machine-type table of state-machine descriptors.   | [`Matrix`], [`StateMachine`], [`Transition`] |
//! | **Workers**     | Per-slot FSM loop: admission, element stepping, pulse barriers.   | [`WorkerState`], [`SlotStatus`]           |
//! | **Adapters**    | Off-worker async executors feeding the response queue.            | [`Adapter`], [`AdapterFn`]                |
//! | **Observer API**| Lifecycle events for logging and tests.                           | [`Observer`], [`Event`], [`EventKind`]    |
//! | **Errors**      | Typed errors per concern, with stable log labels.                 | [`SubmitError`], [`PulseError`], [`AdapterError`] |
//!
//! ## Example
//!
//! ```
//! use pulsevisor::{Conveyor, Matrix, PhaseMachines, StateMachine, Transition};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // A machine that terminates every element on its first step.
//!     let machine = StateMachine::new()
//!         .on_transition(1, |_ctx, _payload| Transition::finish());
//!     let matrix = Matrix::builder()
//!         .register(1, PhaseMachines::uniform(machine))?
//!         .build();
//!
//!     let conveyor = Conveyor::start(matrix, 22);
//!     conveyor.submit("hello").await?;
//!     conveyor.pulse(23).await?;
//!     conveyor.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency model
//!
//! - One worker task per slot; slot state is never touched off-task.
//! - The two queues per slot are the only cross-task touchpoints.
//! - The matrix is frozen before the conveyor starts and shared by
//!   reference.
//! - Handlers are synchronous and must not block; long work goes through
//!   an [`Adapter`].

mod adapter;
mod backoff;
mod config;
mod conveyor;
mod element;
mod error;
mod events;
mod matrix;
mod observer;
mod pulse;
pub mod queue;
mod slot;
mod worker;

// ---- Public re-exports ----

pub use adapter::{Adapter, AdapterFn, AdapterJob, AdapterRef, AdapterResponse, AdapterResult};
pub use backoff::{BackoffPolicy, Jitter};
pub use config::Config;
pub use conveyor::{Conveyor, ConveyorBuilder, ShutdownReport};
pub use element::{ElementId, InputEvent, ListKind, Payload};
pub use error::{
    AdapterError, PulseError, RegistryError, RuntimeError, SubmitError, WorkerError,
};
pub use events::{Bus, Event, EventKind, EventStream};
pub use matrix::{
    ElementState, INITIAL_MACHINE, INITIAL_STATE, MachineType, Matrix, MatrixBuilder,
    MigrationHandler, PhaseMachines, ResponseHandler, StateMachine, TERMINATED_STATE, Transition,
    TransitionHandler,
};
pub use observer::{LogObserver, Observer};
pub use pulse::{PulseNumber, PulsePhase};
pub use queue::{ACTIVATE_PULSE_SIGNAL, PENDING_PULSE_SIGNAL, QueueItem, SignalAck};
pub use slot::{Responder, SlotContext, SlotStatus};
pub use worker::WorkerState;
