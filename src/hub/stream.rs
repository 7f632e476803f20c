//! Per-stream dispatch
//!
//! One task per live session pulls packets from the publisher, feeds the
//! prelude cache and offers each packet to every registered sink without
//! ever blocking on any of them. A slow sink overflows its own queue and
//! is removed; the publisher and the other sinks never wait.
//!
//! The sink set is owned by the dispatch task. Registration and removal
//! arrive over a control channel drained ahead of each read, so a newly
//! added sink is primed with the cache replay before it can see a live
//! packet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::media::{Cache, Info, Packet, RwBaser};

use super::sink::{CloseReason, Sink};

/// Consecutive queue-full drops before a sink is declared dead.
pub const SINK_DROP_LIMIT: u32 = 3;

/// Capacity of the publisher's ingest channel. Small on purpose: back
/// pressure belongs on the publishing connection, not in hub memory.
const PUBLISH_QUEUE_CAPACITY: usize = 32;

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// Created, no packet seen yet.
    Idle = 0,
    /// Packets flowing.
    Publishing = 1,
    /// Dispatch finished; the registry entry is garbage.
    Closed = 2,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::Publishing,
            2 => StreamState::Closed,
            _ => StreamState::Idle,
        }
    }
}

/// Stream tuning, derived from configuration at creation time.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Publisher considered gone after this much silence.
    pub read_timeout: Duration,
    /// GOP ring size for the subscriber prelude.
    pub gop_num: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            gop_num: 1,
        }
    }
}

enum StreamOp {
    AddSink(Arc<dyn Sink>),
    RemoveSink(String),
    Close,
}

struct Shared {
    state: AtomicU8,
    /// The publisher endpoint's rebase/idle state; the registry probes it.
    reader_baser: RwBaser,
}

/// Cloneable reference to a live stream's dispatch task.
#[derive(Clone)]
pub struct StreamHandle {
    info: Info,
    shared: Arc<Shared>,
    ops: mpsc::UnboundedSender<StreamOp>,
}

impl StreamHandle {
    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn key(&self) -> &str {
        &self.info.key
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// True while the publisher has delivered a packet within the read
    /// timeout. Used by the registry's GC.
    pub fn publisher_alive(&self) -> bool {
        self.shared.reader_baser.alive()
    }

    /// Register a consumer. It is primed with the cache prelude on the
    /// next dispatch tick, before any live packet reaches it.
    pub fn add_sink(&self, sink: Arc<dyn Sink>) -> Result<()> {
        if self.state() == StreamState::Closed {
            return Err(Error::NoPublisher(self.info.key.clone()));
        }
        self.ops
            .send(StreamOp::AddSink(sink))
            .map_err(|_| Error::NoPublisher(self.info.key.clone()))
    }

    /// Detach a consumer by uid. Idempotent; unknown uids are no-ops.
    pub fn remove_sink(&self, uid: &str) {
        let _ = self.ops.send(StreamOp::RemoveSink(uid.to_string()));
    }

    /// Shut the stream down. Idempotent; remaining queued packets are
    /// delivered best effort before sinks are closed.
    pub fn close(&self) {
        let _ = self.ops.send(StreamOp::Close);
    }
}

/// Publisher-facing half of a stream: where the ingest collaborator
/// pushes assembled packets.
pub struct Publisher {
    handle: StreamHandle,
    tx: mpsc::Sender<Packet>,
}

impl Publisher {
    /// Deliver one packet. Suspends when the dispatcher is momentarily
    /// behind; fails once the stream is closed.
    pub async fn write(&self, packet: Packet) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| Error::StreamClosed)
    }

    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }
}

/// Create a stream and spawn its dispatch task.
pub(crate) fn spawn(info: Info, config: StreamConfig) -> Publisher {
    let (packet_tx, packet_rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        state: AtomicU8::new(StreamState::Idle as u8),
        reader_baser: RwBaser::new(config.read_timeout),
    });
    let handle = StreamHandle {
        info: info.clone(),
        shared: shared.clone(),
        ops: ops_tx,
    };

    let dispatcher = Dispatcher {
        info,
        cache: Cache::new(config.gop_num),
        shared,
        sinks: HashMap::new(),
        read_timeout: config.read_timeout,
    };
    tokio::spawn(dispatcher.run(packet_rx, ops_rx));

    Publisher {
        handle,
        tx: packet_tx,
    }
}

struct SinkEntry {
    sink: Arc<dyn Sink>,
    full_drops: u32,
}

struct Dispatcher {
    info: Info,
    cache: Cache,
    shared: Arc<Shared>,
    sinks: HashMap<String, SinkEntry>,
    read_timeout: Duration,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut packets: mpsc::Receiver<Packet>,
        mut ops: mpsc::UnboundedReceiver<StreamOp>,
    ) {
        self.shared.reader_baser.set_pre_time();
        let mut deadline = Instant::now() + self.read_timeout;

        loop {
            tokio::select! {
                biased;
                op = ops.recv() => match op {
                    Some(StreamOp::AddSink(sink)) => self.admit(sink),
                    Some(StreamOp::RemoveSink(uid)) => {
                        if let Some(entry) = self.sinks.remove(&uid) {
                            entry.sink.close(CloseReason::Detached);
                            tracing::debug!(stream = %self.info.key, sink = %uid, "Sink detached");
                        }
                    }
                    Some(StreamOp::Close) | None => {
                        self.drain(&mut packets);
                        self.shutdown(&mut ops, CloseReason::StreamClosed);
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!(stream = %self.info.key, "Publisher idle, closing stream");
                    self.shutdown(&mut ops, CloseReason::StreamClosed);
                    return;
                }
                packet = packets.recv() => match packet {
                    Some(packet) => {
                        deadline = Instant::now() + self.read_timeout;
                        if let Err(e) = self.dispatch(packet) {
                            tracing::warn!(
                                stream = %self.info.key,
                                error = %e,
                                "Publisher stream invalid, closing"
                            );
                            self.shutdown(&mut ops, CloseReason::StreamClosed);
                            return;
                        }
                    }
                    None => {
                        tracing::info!(stream = %self.info.key, "Publisher disconnected");
                        self.shutdown(&mut ops, CloseReason::StreamClosed);
                        return;
                    }
                },
            }
        }
    }

    /// Prime a new sink with the cache prelude, then admit it to the set.
    fn admit(&mut self, sink: Arc<dyn Sink>) {
        let uid = sink.info().uid.clone();
        if let Err(e) = self.cache.send(|p| sink.write(p)) {
            tracing::warn!(
                stream = %self.info.key,
                sink = %uid,
                error = %e,
                "Cache replay failed, rejecting sink"
            );
            sink.close(close_reason_for(&e));
            return;
        }
        tracing::info!(
            stream = %self.info.key,
            sink = %uid,
            frames = self.cache.frame_count(),
            "Sink attached"
        );
        if let Some(old) = self.sinks.insert(uid, SinkEntry { sink, full_drops: 0 }) {
            old.sink.close(CloseReason::Detached);
        }
    }

    /// Route one publisher packet: cache, then offer to every sink.
    fn dispatch(&mut self, packet: Packet) -> Result<()> {
        if self.shared.state.load(Ordering::Acquire) == StreamState::Idle as u8 {
            self.shared
                .state
                .store(StreamState::Publishing as u8, Ordering::Release);
            tracing::info!(stream = %self.info.key, "Publishing started");
        }

        self.shared.reader_baser.set_pre_time();
        self.shared
            .reader_baser
            .record_timestamp(packet.timestamp, packet.kind)?;

        let packet = Arc::new(packet);
        self.cache.write(&packet);

        let mut dead: Vec<(String, CloseReason)> = Vec::new();
        for (uid, entry) in &mut self.sinks {
            if !entry.sink.alive() {
                dead.push((uid.clone(), CloseReason::IdleTimeout));
                continue;
            }
            match entry.sink.write(packet.clone()) {
                Ok(()) => entry.full_drops = 0,
                Err(Error::QueueFull) => {
                    entry.full_drops += 1;
                    tracing::warn!(
                        stream = %self.info.key,
                        sink = %uid,
                        drops = entry.full_drops,
                        "Sink queue full, packet dropped"
                    );
                    if entry.full_drops >= SINK_DROP_LIMIT {
                        dead.push((uid.clone(), CloseReason::QueueOverflow));
                    }
                }
                Err(_) => dead.push((uid.clone(), CloseReason::TransportError)),
            }
        }
        for (uid, reason) in dead {
            if let Some(entry) = self.sinks.remove(&uid) {
                entry.sink.close(reason);
                tracing::warn!(
                    stream = %self.info.key,
                    sink = %uid,
                    reason = %reason,
                    "Sink removed"
                );
            }
        }
        Ok(())
    }

    /// Best-effort delivery of packets already queued by the publisher.
    fn drain(&mut self, packets: &mut mpsc::Receiver<Packet>) {
        while let Ok(packet) = packets.try_recv() {
            if self.dispatch(packet).is_err() {
                break;
            }
        }
    }

    fn shutdown(&mut self, ops: &mut mpsc::UnboundedReceiver<StreamOp>, reason: CloseReason) {
        self.shared
            .state
            .store(StreamState::Closed as u8, Ordering::Release);
        for (_, entry) in self.sinks.drain() {
            entry.sink.close(reason);
        }
        // Sinks that raced registration against the close are still owed
        // their close call.
        while let Ok(op) = ops.try_recv() {
            if let StreamOp::AddSink(sink) = op {
                sink.close(reason);
            }
        }
        tracing::info!(stream = %self.info.key, "Stream closed");
    }
}

fn close_reason_for(error: &Error) -> CloseReason {
    match error {
        Error::QueueFull => CloseReason::QueueOverflow,
        _ => CloseReason::TransportError,
    }
}
