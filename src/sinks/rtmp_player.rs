//! RTMP player sink
//!
//! Wraps an outbound chunk writer on a live player connection. The writer
//! task rebases timestamps onto the player's timeline, re-frames each
//! packet as a `ChunkStream` and dies on the first transport error.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::media::{ChunkStream, Info, Packet};

use super::ChunkWriter;
use crate::hub::sink::{CloseReason, Sink, SinkQueue, SinkReceiver, SINK_QUEUE_CAPACITY};

pub struct RtmpPlayerSink {
    info: Info,
    queue: SinkQueue,
}

impl RtmpPlayerSink {
    /// Wrap a player connection and spawn its writer task.
    pub fn spawn(
        info: Info,
        writer: Box<dyn ChunkWriter>,
        stream_id: u32,
        write_timeout: Duration,
    ) -> Arc<Self> {
        let (queue, rx) = SinkQueue::new(SINK_QUEUE_CAPACITY, write_timeout);
        tokio::spawn(write_loop(rx, writer, stream_id, queue.clone(), info.clone()));
        Arc::new(Self { info, queue })
    }
}

impl Sink for RtmpPlayerSink {
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

async fn write_loop(
    mut rx: SinkReceiver,
    mut writer: Box<dyn ChunkWriter>,
    stream_id: u32,
    queue: SinkQueue,
    info: Info,
) {
    let baser = queue.baser();
    // Packets replayed from the cache carry the publisher's absolute
    // timestamps; this endpoint starts its own timeline at them.
    while let Some(packet) = rx.next().await {
        let timestamp = baser.rebase(packet.timestamp, packet.kind);
        if let Err(e) = baser.record_timestamp(timestamp, packet.kind) {
            tracing::warn!(sink = %info, error = %e, "Player timeline broken");
            queue.close(CloseReason::TransportError);
            break;
        }
        let chunk = ChunkStream::from_packet(&packet, timestamp, stream_id);
        if let Err(e) = writer.write_chunk(chunk).await {
            tracing::debug!(sink = %info, error = %e, "Player write failed");
            queue.close(CloseReason::TransportError);
            break;
        }
        baser.set_pre_time();
    }
    let _ = writer.shutdown().await;
    tracing::debug!(sink = %info, reason = ?queue.close_reason(), "Player sink finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct MockWriter {
        chunks: Arc<Mutex<Vec<ChunkStream>>>,
        fail_after: Option<usize>,
        shutdowns: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl ChunkWriter for MockWriter {
        async fn write_chunk(&mut self, chunk: ChunkStream) -> Result<()> {
            let mut chunks = self.chunks.lock().unwrap();
            if matches!(self.fail_after, Some(n) if chunks.len() >= n) {
                return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
            }
            chunks.push(chunk);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            let _ = self.shutdowns.send(());
            Ok(())
        }
    }

    fn sink_with_writer(
        fail_after: Option<usize>,
    ) -> (
        Arc<RtmpPlayerSink>,
        Arc<Mutex<Vec<ChunkStream>>>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let writer = Box::new(MockWriter {
            chunks: chunks.clone(),
            fail_after,
            shutdowns: shutdown_tx,
        });
        let info = Info::new("rtmp://player", "live/test").unwrap();
        let sink = RtmpPlayerSink::spawn(info, writer, 7, Duration::from_secs(10));
        (sink, chunks, shutdown_rx)
    }

    fn keyframe(ts: u32) -> Arc<Packet> {
        Arc::new(Packet::video(ts, Bytes::from_static(&[0x17, 0x01, 0xAA])))
    }

    #[tokio::test]
    async fn test_packets_become_chunks_in_order() {
        let (sink, chunks, _shutdown) = sink_with_writer(None);

        sink.write(keyframe(0)).unwrap();
        sink.write(keyframe(33)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let chunks = chunks.lock().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].type_id, 9);
        assert_eq!(chunks[0].stream_id, 7);
        assert_eq!(chunks[0].timestamp, 0);
        assert_eq!(chunks[1].timestamp, 33);
        assert_eq!(chunks[1].length as usize, chunks[1].data.len());
    }

    #[tokio::test]
    async fn test_transport_error_kills_sink_and_shuts_down() {
        let (sink, chunks, mut shutdown) = sink_with_writer(Some(1));

        sink.write(keyframe(0)).unwrap();
        sink.write(keyframe(33)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(chunks.lock().unwrap().len(), 1);
        assert!(!sink.alive());
        shutdown.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_shuts_transport_down() {
        let (sink, _chunks, mut shutdown) = sink_with_writer(None);

        sink.close(CloseReason::Detached);
        shutdown.recv().await.unwrap();
        assert!(!sink.alive());
    }
}
