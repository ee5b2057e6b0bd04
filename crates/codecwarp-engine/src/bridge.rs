//! Ordered delivery from the worker thread to the owner context.
//!
//! The worker posts [`Delivery`] values into an unbounded channel; a
//! dispatcher task running on the owner's runtime turns them into
//! [`OutputEvent`]s and invokes the session handlers in posting order.
//! When the owner has gone away the post reports [`PostOutcome::TargetGone`]
//! and the delivery is dropped on the spot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use codecwarp_core::{
    BoundaryMetadata, ErrorEvent, OutputEvent, ResourceKind, SessionConfig, SessionError, Tracked,
};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::backpressure::QueueAccounting;

/// Callback receiving outputs
pub type OutputHandler = Box<dyn FnMut(OutputEvent) + Send + 'static>;

/// Callback receiving per-item errors
pub type ErrorHandler = Box<dyn FnMut(ErrorEvent) + Send + 'static>;

/// Output and error callbacks registered at configure time
pub struct SessionHandlers {
    on_output: OutputHandler,
    on_error: ErrorHandler,
}

impl SessionHandlers {
    pub fn new(
        on_output: impl FnMut(OutputEvent) + Send + 'static,
        on_error: impl FnMut(ErrorEvent) + Send + 'static,
    ) -> Self {
        Self {
            on_output: Box::new(on_output),
            on_error: Box::new(on_error),
        }
    }

    /// Handlers that forward every event into a channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let errors = tx.clone();
        let handlers = Self::new(
            move |event| {
                let _ = tx.send(SessionEvent::Output(event));
            },
            move |event| {
                let _ = errors.send(SessionEvent::Error(event));
            },
        );
        (handlers, rx)
    }
}

/// An event as seen by a channel-backed handler pair
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Output(OutputEvent),
    Error(ErrorEvent),
}

impl SessionEvent {
    pub fn sequence_id(&self) -> Option<u64> {
        match self {
            SessionEvent::Output(e) => Some(e.sequence_id),
            SessionEvent::Error(e) => e.sequence_id,
        }
    }
}

/// Codec output as produced on the worker thread
#[derive(Debug)]
pub(crate) struct RawOutput {
    pub sequence_id: u64,
    pub data: Bytes,
    pub timestamp_us: i64,
    pub duration_us: Option<u64>,
    pub key_frame: bool,
    pub description: Option<Bytes>,
    pub coded_size: Option<(u32, u32)>,
}

pub(crate) type FlushAck = oneshot::Sender<Result<(), SessionError>>;

pub(crate) enum Delivery {
    Output(RawOutput),
    Error(ErrorEvent),
    /// Dropped by the worker without output
    Discarded { sequence_id: u64 },
    FlushComplete {
        barrier: Option<u64>,
        ack: FlushAck,
        result: Result<(), SessionError>,
    },
}

struct Envelope {
    delivery: Delivery,
    _tracked: Tracked,
}

/// Result of posting a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostOutcome {
    Queued,
    /// The owner context is gone; the delivery was dropped
    TargetGone,
}

/// Worker-side end of the bridge
pub(crate) struct BridgeSender {
    tx: mpsc::UnboundedSender<Envelope>,
    pending: Arc<AtomicUsize>,
}

impl BridgeSender {
    pub fn post(&self, delivery: Delivery) -> PostOutcome {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let envelope = Envelope {
            delivery,
            _tracked: Tracked::new(ResourceKind::Delivery),
        };

        match self.tx.send(envelope) {
            Ok(()) => PostOutcome::Queued,
            Err(mpsc::error::SendError(envelope)) => {
                // Only the payload and our own counter are touched here
                drop(envelope);
                self.pending.fetch_sub(1, Ordering::AcqRel);
                PostOutcome::TargetGone
            }
        }
    }
}

/// Owner-side end of the bridge
pub(crate) struct Dispatcher {
    rx: mpsc::UnboundedReceiver<Envelope>,
    pending: Arc<AtomicUsize>,
    handlers: SessionHandlers,
    config: SessionConfig,
    /// First sequence id of this configuration; temporal layers count from it
    layer_base: u64,
    accounting: Arc<QueueAccounting>,
    _tracked: Tracked,
}

/// Create a connected sender/dispatcher pair
pub(crate) fn channel(
    handlers: SessionHandlers,
    config: SessionConfig,
    layer_base: u64,
    accounting: Arc<QueueAccounting>,
    pending: Arc<AtomicUsize>,
) -> (BridgeSender, Dispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = BridgeSender {
        tx,
        pending: Arc::clone(&pending),
    };
    let dispatcher = Dispatcher {
        rx,
        pending,
        handlers,
        config,
        layer_base,
        accounting,
        _tracked: Tracked::new(ResourceKind::Dispatcher),
    };
    (sender, dispatcher)
}

impl Dispatcher {
    /// Deliver until every sender is gone
    pub async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            // Released even if a handler panics
            let _pending = PendingMark(Arc::clone(&self.pending));
            let Envelope { delivery, _tracked } = envelope;
            self.dispatch(delivery);
        }
        debug!("dispatcher for {} session finished", self.config.role);
    }

    fn dispatch(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Output(raw) => {
                let sequence_id = raw.sequence_id;
                let event = self.output_event(raw);
                (self.handlers.on_output)(event);
                self.accounting.resolve(sequence_id);
            }
            Delivery::Error(event) => {
                let sequence_id = event.sequence_id;
                (self.handlers.on_error)(event);
                if let Some(sequence_id) = sequence_id {
                    self.accounting.resolve(sequence_id);
                }
            }
            Delivery::Discarded { sequence_id } => {
                self.accounting.resolve(sequence_id);
            }
            Delivery::FlushComplete {
                barrier,
                ack,
                result,
            } => {
                if let Some(barrier) = barrier {
                    self.accounting.resolve_through(barrier);
                }
                // The flush future may have been dropped
                let _ = ack.send(result);
            }
        }
    }

    fn output_event(&self, raw: RawOutput) -> OutputEvent {
        let metadata = if raw.key_frame {
            let (coded_width, coded_height) = raw
                .coded_size
                .unwrap_or((self.config.width, self.config.height));
            Some(BoundaryMetadata {
                codec: self.config.codec.clone(),
                coded_width,
                coded_height,
                description: raw.description.or_else(|| self.config.description.clone()),
            })
        } else {
            None
        };

        let position = raw.sequence_id.saturating_sub(self.layer_base);
        OutputEvent {
            sequence_id: raw.sequence_id,
            data: raw.data,
            timestamp_us: raw.timestamp_us,
            duration_us: raw.duration_us,
            is_boundary: raw.key_frame,
            metadata,
            temporal_layer: self
                .config
                .scalability
                .map(|mode| mode.temporal_layer(position)),
        }
    }
}

struct PendingMark(Arc<AtomicUsize>);

impl Drop for PendingMark {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Cancelled with deliveries still queued (e.g. the runtime shut down)
        self.rx.close();
        while let Ok(envelope) = self.rx.try_recv() {
            drop(envelope);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
