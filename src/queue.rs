//! # Slot queues: bounded MPSC channels of events and in-band signals.
//!
//! Every slot owns two of these queues (input and adapter responses). The
//! push side is multi-producer and cloneable; the drain side belongs to the
//! slot's worker alone.
//!
//! ```text
//!  producers ──► QueueSender ──► bounded channel ──► QueueReceiver ──► worker
//!   (many)        (clone)                              (single)
//! ```
//!
//! Items are tagged with a discriminant ([`QueueItem`]): data events and
//! control signals share one channel, which preserves producer-local
//! ordering between an event and a signal pushed after it.
//!
//! ## Rules
//! - [`QueueSender::sink_push`] is non-blocking; a saturated queue returns
//!   [`SubmitError::Full`] and the producer retries with backoff. The queue
//!   is the sole back-pressure point.
//! - [`QueueSender::push_signal`] attaches a [`SignalAck`] that fires
//!   **exactly once** after the consumer has drained the signal.
//! - [`QueueReceiver::drain`] returns every queued item in push order; the
//!   worker walks the batch twice, signals first, then events.
//! - Items re-queued by the consumer (a retained activation signal) are
//!   observed before anything still sitting in the channel.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::error::SubmitError;

/// Signal code announcing that a new pulse is pending: the worker should
/// stop admitting work and quiesce.
pub const PENDING_PULSE_SIGNAL: u32 = 1;

/// Signal code activating a pending pulse: the worker suspends so the
/// conveyor can relabel its slot.
pub const ACTIVATE_PULSE_SIGNAL: u32 = 2;

/// One-shot acknowledgement attached to a signal.
///
/// Fires exactly once, after the consumer has drained the signal it rides
/// on. The conveyor uses these acks as the barrier of the two-phase pulse
/// protocol; tests that do not care use [`SignalAck::noop`].
pub struct SignalAck(Option<oneshot::Sender<()>>);

impl SignalAck {
    /// Creates an ack and the receiver that completes when it fires.
    pub fn new() -> (SignalAck, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (SignalAck(Some(tx)), rx)
    }

    /// An ack nobody is waiting on.
    pub fn noop() -> SignalAck {
        SignalAck(None)
    }

    /// Fires the ack. Subsequent calls are no-ops.
    pub(crate) fn fire(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for SignalAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SignalAck")
            .field(&self.0.as_ref().map(|_| "pending").unwrap_or("fired"))
            .finish()
    }
}

/// An item on a slot queue: a data event or an in-band control signal.
#[derive(Debug)]
pub enum QueueItem<T> {
    /// A data event carried to the worker's admission step.
    Event(T),
    /// A control signal; unknown codes halt the worker.
    Signal {
        /// Signal code ([`PENDING_PULSE_SIGNAL`], [`ACTIVATE_PULSE_SIGNAL`]).
        code: u32,
        /// Fired once the consumer has drained this item.
        ack: SignalAck,
    },
}

impl<T> QueueItem<T> {
    /// Whether this item is a control signal.
    pub fn is_signal(&self) -> bool {
        matches!(self, QueueItem::Signal { .. })
    }
}

/// Creates a bounded queue with the given capacity (clamped to at least 1).
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueSender { tx },
        QueueReceiver {
            rx,
            stash: VecDeque::new(),
        },
    )
}

/// Producer side of a slot queue. Cheap to clone; any number of producers
/// may push concurrently.
pub struct QueueSender<T> {
    tx: mpsc::Sender<QueueItem<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        QueueSender {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send> QueueSender<T> {
    /// Pushes a data event without blocking.
    ///
    /// Returns [`SubmitError::Full`] when the bounded capacity is exceeded
    /// and [`SubmitError::Closed`] when the consumer is gone.
    pub fn sink_push(&self, event: T) -> Result<(), SubmitError> {
        self.tx.try_send(QueueItem::Event(event)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Pushes a data event, waiting for capacity if necessary.
    ///
    /// Used by adapter tasks posting responses; they run off-worker and may
    /// wait out back-pressure instead of dropping results.
    pub async fn sink_push_wait(&self, event: T) -> Result<(), SubmitError> {
        self.tx
            .send(QueueItem::Event(event))
            .await
            .map_err(|_| SubmitError::Closed)
    }

    /// Pushes a control signal, waiting for capacity if necessary.
    ///
    /// Signals must not be dropped by back-pressure, so this path is allowed
    /// to wait; it never overtakes events pushed earlier by the same
    /// producer.
    pub async fn push_signal(&self, code: u32, ack: SignalAck) -> Result<(), SubmitError> {
        self.tx
            .send(QueueItem::Signal { code, ack })
            .await
            .map_err(|_| SubmitError::Closed)
    }
}

/// Consumer side of a slot queue. Owned by exactly one worker.
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<QueueItem<T>>,
    /// Items the worker put back; drained ahead of the channel.
    stash: VecDeque<QueueItem<T>>,
}

impl<T> QueueReceiver<T> {
    /// Drains every queued item in push order.
    pub fn drain(&mut self) -> Vec<QueueItem<T>> {
        let mut batch: Vec<QueueItem<T>> = self.stash.drain(..).collect();
        while let Ok(item) = self.rx.try_recv() {
            batch.push(item);
        }
        batch
    }

    /// Drains up to `limit` items in push order.
    pub fn drain_capped(&mut self, limit: usize) -> Vec<QueueItem<T>> {
        let limit = limit.max(1);
        let mut batch = Vec::new();
        while batch.len() < limit {
            match self.stash.pop_front() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        while batch.len() < limit {
            match self.rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        batch
    }

    /// Receives a batch of up to `limit` items, parking the caller for at
    /// most `wait` when the queue is empty.
    ///
    /// Returns an empty batch on timeout. A closed, empty queue also waits
    /// out `wait` so a retiring worker does not spin.
    pub async fn recv_batch(&mut self, limit: usize, wait: Duration) -> Vec<QueueItem<T>> {
        if !self.stash.is_empty() {
            return self.drain_capped(limit);
        }
        let mut batch = Vec::new();
        match time::timeout(wait, self.rx.recv_many(&mut batch, limit.max(1))).await {
            Ok(0) => time::sleep(wait).await,
            Ok(_) | Err(_) => {}
        }
        batch
    }

    /// Puts an item back so the next drain observes it first.
    ///
    /// Used by the worker to retain an activation signal for its suspending
    /// loop; the signal's ack stays pending until the item is processed.
    pub(crate) fn requeue(&mut self, item: QueueItem<T>) {
        self.stash.push_back(item);
    }

    /// Number of queued items, including any re-queued ones.
    pub fn len(&self) -> usize {
        self.stash.len() + self.rx.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
