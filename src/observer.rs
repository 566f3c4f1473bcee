//! Observer hook for runtime events.
//!
//! An [`Observer`] consumes [`Event`]s from the bus on a dedicated listener
//! task, so slow observers never block slot workers. [`LogObserver`]
//! forwards events to `tracing`.

use async_trait::async_trait;

use crate::events::{Bus, Event, EventKind};

/// Consumer of runtime events.
#[async_trait]
pub trait Observer: Send + Sync + 'static {
    /// Called once per published event, in sequence order per listener.
    async fn on_event(&self, event: &Event);
}

/// Observer that forwards events to `tracing`.
///
/// Pulse and shutdown milestones log at info, element terminations at
/// debug, faults at warn or error.
pub struct LogObserver;

#[async_trait]
impl Observer for LogObserver {
    async fn on_event(&self, e: &Event) {
        let label = e.kind.as_label();
        match e.kind {
            EventKind::PulsePrepared | EventKind::PulseActivated => {
                tracing::info!(event = label, pulse = ?e.pulse, "pulse");
            }
            EventKind::WorkerStateChanged => {
                tracing::debug!(
                    event = label,
                    phase = ?e.phase.map(|p| p.as_label()),
                    pulse = ?e.pulse,
                    worker = ?e.worker,
                    "worker state",
                );
            }
            EventKind::WorkerHalted => {
                tracing::error!(
                    event = label,
                    phase = ?e.phase.map(|p| p.as_label()),
                    pulse = ?e.pulse,
                    error = ?e.error,
                    "worker halted",
                );
            }
            EventKind::ElementTerminated => {
                tracing::debug!(event = label, element = ?e.element, "element freed");
            }
            EventKind::HandlerPanicked => {
                tracing::warn!(event = label, element = ?e.element, error = ?e.error, "handler panicked");
            }
            EventKind::OrphanResponse => {
                tracing::debug!(event = label, element = ?e.element, "orphan response discarded");
            }
            EventKind::ShutdownRequested | EventKind::AllStoppedWithin => {
                tracing::info!(event = label, "shutdown");
            }
            EventKind::GraceExceeded => {
                tracing::warn!(event = label, "shutdown grace exceeded");
            }
        }
    }
}

/// Spawns a listener task that feeds bus events to `observer` until the bus
/// is dropped. Lag is handled by the stream itself.
pub(crate) fn spawn_listener(bus: &Bus, observer: std::sync::Arc<dyn Observer>) {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            observer.on_event(&ev).await;
        }
    });
}
