//! # Adapter abstraction for off-worker asynchronous work.
//!
//! Handlers must be non-blocking; anything slow (I/O, long compute) is
//! handed to an [`Adapter`]. The worker spawns the adapter call on the
//! runtime, parks the element, and posts exactly one [`AdapterResponse`]
//! per job back into the owning slot's response queue.
//!
//! - **[`Adapter`]** — trait for implementing async job executors
//! - **[`AdapterRef`]** — shared handle (`Arc<dyn Adapter>`) handlers attach
//!   to a [`Transition::dispatch`](crate::Transition::dispatch)
//! - **[`AdapterFn`]** — function-backed implementation wrapping closures
//!
//! ## Rules
//! - Adapters never touch slot state; the response queue is the only way
//!   back in.
//! - The worker, not the adapter, stamps the response with the element id
//!   and dispatch state, so the one-response-per-job contract holds by
//!   construction.
//! - Adapters are not ordered with respect to each other.
//! - Timeouts are the adapter's concern; a deadline that fires is reported
//!   as an [`AdapterError::Timeout`] response, never enforced by the
//!   scheduler.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::element::{ElementId, Payload};
use crate::error::AdapterError;
use crate::matrix::ElementState;

/// Result of one adapter execution: a payload for the response handler or
/// a typed error.
pub type AdapterResult = Result<Payload, AdapterError>;

/// Shared handle to an adapter object.
pub type AdapterRef = Arc<dyn Adapter>;

/// Asynchronous executor of jobs dispatched by transition handlers.
///
/// ## Example
/// ```
/// use async_trait::async_trait;
/// use pulsevisor::{Adapter, AdapterResult};
/// use pulsevisor::Payload;
///
/// struct Echo;
///
/// #[async_trait]
/// impl Adapter for Echo {
///     fn name(&self) -> &str {
///         "echo"
///     }
///
///     async fn process(&self, job: Payload) -> AdapterResult {
///         Ok(job)
///     }
/// }
/// ```
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Returns a stable, human-readable adapter name for logs.
    fn name(&self) -> &str;

    /// Executes one job and returns its result.
    ///
    /// Called on the runtime, off the slot worker. Implementations own
    /// their deadlines and report expiry as [`AdapterError::Timeout`].
    async fn process(&self, job: Payload) -> AdapterResult;
}

/// Function-backed adapter implementation.
///
/// Wraps a closure that creates a fresh future per job, mirroring how
/// handlers are plain `Fn`s: no shared mutable state unless the closure
/// captures an `Arc` explicitly.
///
/// ## Example
/// ```
/// use pulsevisor::{AdapterFn, AdapterRef, Payload};
///
/// let double: AdapterRef = AdapterFn::arc("double", |job: Payload| async move {
///     let n = job.downcast::<u64>().map(|n| *n).unwrap_or(0);
///     Ok(Box::new(n * 2) as Payload)
/// });
/// assert_eq!(double.name(), "double");
/// ```
pub struct AdapterFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> AdapterFn<F> {
    /// Creates a new function-backed adapter.
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Creates the adapter and returns it as a shared handle.
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F, Fut> Adapter for AdapterFn<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AdapterResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, job: Payload) -> AdapterResult {
        (self.f)(job).await
    }
}

/// A job a transition handler hands off: the adapter to run and the payload
/// it receives.
pub struct AdapterJob {
    pub(crate) adapter: AdapterRef,
    pub(crate) payload: Payload,
}

/// An adapter result addressed back to the element that dispatched it.
///
/// Matching is strict: the target element must sit on the NotActive list
/// and `state` must equal the state the dispatch occurred in; anything else
/// is discarded with a debug diagnostic.
pub struct AdapterResponse {
    /// The element the job belonged to.
    pub element: ElementId,
    /// The element state at dispatch time.
    pub state: ElementState,
    /// The adapter's result or error.
    pub result: AdapterResult,
}

// the result payload is opaque; show only the addressing fields
impl std::fmt::Debug for AdapterResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterResponse")
            .field("element", &self.element)
            .field("state", &self.state)
            .field("ok", &self.result.is_ok())
            .finish_non_exhaustive()
    }
}
