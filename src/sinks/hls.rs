//! HLS feed sink
//!
//! The segmenter lives outside the hub; it slices on keyframes and owns
//! the playlist and TS files. This sink only feeds it packets through the
//! standard bounded queue and tells it, on close, whether the playlist
//! should outlive the publisher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::media::{Info, Packet};

use crate::hub::sink::{CloseReason, Sink, SinkQueue, SinkReceiver, SINK_QUEUE_CAPACITY};

/// The external HLS segmenter.
#[async_trait]
pub trait Segmenter: Send {
    /// Absorb one media packet.
    async fn feed(&mut self, packet: Arc<Packet>) -> Result<()>;

    /// The stream ended; finalize the playlist, keeping it on disk when
    /// `keep_playlist` is set.
    async fn finish(&mut self, keep_playlist: bool) -> Result<()>;
}

pub struct HlsSink {
    info: Info,
    queue: SinkQueue,
}

impl HlsSink {
    pub fn spawn(
        info: Info,
        segmenter: Box<dyn Segmenter>,
        keep_after_end: bool,
        write_timeout: Duration,
    ) -> Arc<Self> {
        let (queue, rx) = SinkQueue::new(SINK_QUEUE_CAPACITY, write_timeout);
        tokio::spawn(feed_loop(rx, segmenter, keep_after_end, queue.clone(), info.clone()));
        Arc::new(Self { info, queue })
    }
}

impl Sink for HlsSink {
    fn write(&self, packet: Arc<Packet>) -> Result<()> {
        self.queue.offer(packet)
    }

    fn alive(&self) -> bool {
        self.queue.alive()
    }

    fn close(&self, reason: CloseReason) {
        self.queue.close(reason);
    }

    fn info(&self) -> &Info {
        &self.info
    }
}

async fn feed_loop(
    mut rx: SinkReceiver,
    mut segmenter: Box<dyn Segmenter>,
    keep_after_end: bool,
    queue: SinkQueue,
    info: Info,
) {
    let baser = queue.baser();
    while let Some(packet) = rx.next().await {
        if let Err(e) = segmenter.feed(packet).await {
            tracing::error!(sink = %info, error = %e, "Segmenter rejected packet");
            queue.close(CloseReason::TransportError);
            break;
        }
        baser.set_pre_time();
    }
    if let Err(e) = segmenter.finish(keep_after_end).await {
        tracing::warn!(sink = %info, error = %e, "Segmenter finish failed");
    }
    tracing::debug!(sink = %info, reason = ?queue.close_reason(), "HLS sink finished");
}
