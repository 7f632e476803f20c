//! The sink contract and its shared queue plumbing
//!
//! A sink is any consumer of a stream's packets: an RTMP player, an
//! HTTP-FLV response, the HLS segmenter feed, a recording file, a
//! static-push uplink. The dispatcher only ever sees this trait; the
//! heterogeneity lives behind it.
//!
//! `write` must never suspend the dispatcher. Every concrete sink is
//! built on `SinkQueue`: a bounded queue the dispatcher offers into with
//! `try_send`, drained by the sink's own writer task. Overflow is a
//! sink-local failure, never a global one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::media::{Info, Packet, RwBaser};

/// Bounded queue capacity for every sink.
pub const SINK_QUEUE_CAPACITY: usize = 500;

/// Why a sink was closed. Carried to the writer task so transports can be
/// released appropriately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The stream itself shut down (publisher left or timed out).
    StreamClosed,
    /// The consumer detached (player disconnect, uplink stop).
    Detached,
    /// The sink's queue overflowed repeatedly.
    QueueOverflow,
    /// The sink's writer stopped draining within its timeout.
    IdleTimeout,
    /// The sink's transport failed.
    TransportError,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::StreamClosed => "stream closed",
            CloseReason::Detached => "detached",
            CloseReason::QueueOverflow => "queue overflow",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::TransportError => "transport error",
        };
        f.write_str(s)
    }
}

/// Uniform consumer contract.
pub trait Sink: Send + Sync {
    /// Enqueue a packet without blocking. `Error::QueueFull` when the
    /// bounded queue is full.
    fn write(&self, packet: Arc<Packet>) -> Result<()>;

    /// False once the transport failed or the writer stopped draining.
    fn alive(&self) -> bool;

    /// Idempotent. Releases the transport and commits any artifact.
    fn close(&self, reason: CloseReason);

    /// Identity of this consumer.
    fn info(&self) -> &Info;
}

/// Dispatcher-facing half of a sink's bounded queue.
///
/// Cheap to clone; writer tasks keep a clone to flip the closed flag on
/// transport errors.
#[derive(Clone)]
pub struct SinkQueue {
    tx: mpsc::Sender<Arc<Packet>>,
    baser: Arc<RwBaser>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    close_reason: Arc<Mutex<Option<CloseReason>>>,
}

/// Writer-task half of the queue.
pub struct SinkReceiver {
    rx: mpsc::Receiver<Arc<Packet>>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
}

impl SinkQueue {
    /// Create the queue pair for one sink.
    pub fn new(capacity: usize, write_timeout: Duration) -> (Self, SinkReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());
        let queue = Self {
            tx,
            baser: Arc::new(RwBaser::new(write_timeout)),
            closed: closed.clone(),
            close_notify: close_notify.clone(),
            close_reason: Arc::new(Mutex::new(None)),
        };
        let receiver = SinkReceiver {
            rx,
            closed,
            close_notify,
        };
        (queue, receiver)
    }

    /// Non-blocking enqueue.
    pub fn offer(&self, packet: Arc<Packet>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SinkClosed);
        }
        match self.tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
                Err(Error::SinkClosed)
            }
        }
    }

    /// Open and recently drained.
    pub fn alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.baser.alive()
    }

    /// Close exactly once; later calls are no-ops.
    pub fn close(&self, reason: CloseReason) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            *self.close_reason.lock().expect("close_reason poisoned") = Some(reason);
            self.close_notify.notify_one();
        }
    }

    /// The reason recorded by the first `close` call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().expect("close_reason poisoned")
    }

    /// Timestamp/liveness state for this endpoint's writer.
    pub fn baser(&self) -> Arc<RwBaser> {
        self.baser.clone()
    }

    /// Whether two handles belong to the same queue instance.
    pub fn same_channel(&self, other: &SinkQueue) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl SinkReceiver {
    /// Next queued packet, or `None` once the sink is closed.
    ///
    /// Close wins over queued packets: after `close` the remaining queue
    /// contents are only reachable through [`SinkReceiver::try_next`],
    /// for writers that drain on shutdown.
    pub async fn next(&mut self) -> Option<Arc<Packet>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.close_notify.notified() => None,
            packet = self.rx.recv() => packet,
        }
    }

    /// Non-blocking pop of whatever is still queued.
    pub fn try_next(&mut self) -> Option<Arc<Packet>> {
        self.rx.try_recv().ok()
    }
}
