//! # Error types used by the conveyor runtime, workers, and adapters.
//!
//! This module defines one error enum per concern:
//!
//! - [`SubmitError`] failures on the producer side of a slot queue.
//! - [`PulseError`] rejected pulse transitions at the conveyor API.
//! - [`WorkerError`] programming errors that halt a slot worker.
//! - [`AdapterError`] failures reported by adapter executions.
//! - [`RuntimeError`] failures of the conveyor runtime itself.
//!
//! All types provide `as_label()` returning a short stable snake_case label
//! for logs. [`AdapterError`] additionally has `is_retryable()` / `is_fatal()`.

use std::time::Duration;

use thiserror::Error;

use crate::pulse::PulseNumber;

/// Errors returned when pushing into a slot queue.
///
/// The bounded input queue is the sole back-pressure point of the conveyor:
/// producers that hit [`SubmitError::Full`] are expected to retry with
/// backoff (see [`BackoffPolicy`](crate::BackoffPolicy)).
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Queue capacity is exceeded; retry later.
    #[error("queue full")]
    Full,

    /// The owning slot is gone (worker halted or conveyor shut down).
    #[error("queue closed")]
    Closed,
}

impl SubmitError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SubmitError::Full => "submit_full",
            SubmitError::Closed => "submit_closed",
        }
    }
}

/// Errors returned by [`Conveyor::pulse`](crate::Conveyor::pulse).
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseError {
    /// The requested pulse number does not exceed the latest activated one.
    ///
    /// Rejected before any state mutation.
    #[error("pulse {requested} is not greater than current pulse {current}")]
    NotIncreasing {
        /// The latest pulse number the conveyor has activated.
        current: PulseNumber,
        /// The rejected pulse number.
        requested: PulseNumber,
    },

    /// Another pulse transition is still in flight.
    #[error("pulse switch already in progress")]
    AlreadyInProgress,

    /// The conveyor has been shut down.
    #[error("conveyor closed")]
    Closed,
}

impl PulseError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            PulseError::NotIncreasing { .. } => "pulse_not_increasing",
            PulseError::AlreadyInProgress => "pulse_in_progress",
            PulseError::Closed => "pulse_closed",
        }
    }
}

/// Programming errors detected inside a slot worker.
///
/// These are not recoverable: the worker halts, marks its slot unhealthy,
/// and the diagnostic is published on the event bus. Element-level faults
/// (handler panics, missing handlers) are contained and do **not** surface
/// here.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerError {
    /// A drained queue item carried a signal code outside the known set.
    #[error("Unknown signal: {code}")]
    UnknownSignal {
        /// The offending signal code.
        code: u32,
    },
}

impl WorkerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::UnknownSignal { .. } => "worker_unknown_signal",
        }
    }
}

/// Errors produced by adapter executions.
///
/// Adapters report these through the response queue; the element's response
/// handler decides what to do with them. Timeouts are an adapter concern:
/// the scheduler never times out a dispatched job on its own.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AdapterError {
    /// The adapter gave up on the job after its own deadline.
    #[error("adapter timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The job failed but may succeed if dispatched again.
    #[error("adapter failed: {reason}")]
    Fail { reason: String },

    /// The job was abandoned because the runtime is shutting down.
    ///
    /// This is **not an error** in the traditional sense; it signals
    /// intentional termination.
    #[error("adapter canceled")]
    Canceled,
}

impl AdapterError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            AdapterError::Timeout { .. } => "adapter_timeout",
            AdapterError::Fail { .. } => "adapter_failed",
            AdapterError::Canceled => "adapter_canceled",
        }
    }

    /// Indicates whether the error type is safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Timeout { .. } | AdapterError::Fail { .. })
    }

    /// Indicates whether the error is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Canceled)
    }
}

/// Errors rejected at state-machine registration time.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// Machine types must be registered in sequence (1, 2, 3, …) so the
    /// matrix stays dense across all three phases.
    #[error("machine type {got} registered out of sequence (expected {expected})")]
    OutOfSequence {
        /// The next machine type the builder would accept.
        expected: crate::matrix::MachineType,
        /// The machine type that was passed.
        got: crate::matrix::MachineType,
    },

    /// Machine type 0 is reserved for the empty (terminated) machine.
    #[error("machine type 0 is reserved")]
    ReservedType,
}

impl RegistryError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RegistryError::OutOfSequence { .. } => "registry_out_of_sequence",
            RegistryError::ReservedType => "registry_reserved_type",
        }
    }
}

/// Errors produced by the conveyor runtime itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some slot workers remained stuck.
    #[error("shutdown grace {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Descriptions of the slots that did not stop in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }
}
