//! Static-push uplinks
//!
//! Every configured upstream RTMP destination gets one `StaticPush`: an
//! outbound publisher with its own connection state, packet queue and
//! relay task. Uplinks double as stream sinks, so the dispatcher fans
//! out to them like to any player; an uplink failure removes only that
//! uplink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::media::{ChunkStream, Info, Packet};
use crate::sinks::ChunkWriter;

use crate::hub::sink::{CloseReason, Sink, SinkQueue, SinkReceiver, SINK_QUEUE_CAPACITY};

/// Dials an upstream server and completes the publish handshake,
/// implemented by the RTMP client collaborator.
#[async_trait]
pub trait UplinkConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<UplinkSession>;
}

/// A connected, publish-ready uplink.
pub struct UplinkSession {
    pub writer: Box<dyn ChunkWriter>,
    /// Message stream id negotiated with the upstream server.
    pub stream_id: u32,
}

/// One upstream destination.
pub struct StaticPush {
    info: Info,
    connector: Arc<dyn UplinkConnector>,
    write_timeout: Duration,
    started: AtomicBool,
    /// Present while the relay task runs.
    queue: Mutex<Option<SinkQueue>>,
}

impl StaticPush {
    fn new(
        url: &str,
        connector: Arc<dyn UplinkConnector>,
        write_timeout: Duration,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            info: Info::new(url, push_key(url)?)?,
            connector,
            write_timeout,
            started: AtomicBool::new(false),
            queue: Mutex::new(None),
        }))
    }

    pub fn url(&self) -> &str {
        &self.info.url
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Connect and spawn the relay task. Fails with `AlreadyStarted` when
    /// the uplink is running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted(self.info.url.clone()));
        }

        let session = match self.connector.connect(&self.info.url).await {
            Ok(session) => session,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                tracing::error!(uplink = %self.info.url, error = %e, "Uplink connect failed");
                return Err(e);
            }
        };
        tracing::info!(
            uplink = %self.info.url,
            stream_id = session.stream_id,
            "Static push started"
        );

        let (queue, rx) = SinkQueue::new(SINK_QUEUE_CAPACITY, self.write_timeout);
        *self.queue.lock().expect("queue poisoned") = Some(queue.clone());
        tokio::spawn(relay_loop(rx, session, queue, Arc::clone(self)));
        Ok(())
    }

    /// Signal the relay task to drain its queue and close the client.
    /// Idempotent, and a later `start` reconnects immediately.
    pub fn stop(&self) {
        if self.started.swap(false, Ordering::AcqRel) {
            if let Some(queue) = self.queue.lock().expect("queue poisoned").as_ref() {
                queue.close(CloseReason::Detached);
            }
        }
    }
}

impl Sink for StaticPush {
    /// Packets sent while the uplink is down are silently dropped; the
    /// uplink only relays what it can deliver.
    fn write(&self, packet: Arc<Packet>) -> Result<()> {
        let queue = self.queue.lock().expect("queue poisoned");
        match queue.as_ref() {
            Some(queue) => queue.offer(packet),
            None => Ok(()),
        }
    }

    fn alive(&self) -> bool {
        let queue = self.queue.lock().expect("queue poisoned");
        match queue.as_ref() {
            // A closed queue stays in place after the relay ends, so a
            // dead uplink reads as dead until the next `start`.
            Some(queue) => queue.alive(),
            None => true,
        }
    }

    fn close(&self, _reason: CloseReason) {
        self.stop();
    }

    fn info(&self) -> &Info {
        &self.info
    }
}

async fn relay_loop(
    mut rx: SinkReceiver,
    session: UplinkSession,
    queue: SinkQueue,
    push: Arc<StaticPush>,
) {
    let mut writer = session.writer;
    let stream_id = session.stream_id;
    let baser = queue.baser();
    let mut transport_ok = true;

    while let Some(packet) = rx.next().await {
        if let Err(e) = forward(&mut writer, &packet, stream_id, &queue).await {
            tracing::error!(uplink = %push.info.url, error = %e, "Uplink write failed");
            queue.close(CloseReason::TransportError);
            transport_ok = false;
            break;
        }
        baser.set_pre_time();
    }

    // Stop was signaled: relay what is already queued before closing.
    if transport_ok {
        while let Some(packet) = rx.try_next() {
            if forward(&mut writer, &packet, stream_id, &queue).await.is_err() {
                break;
            }
        }
    }
    let _ = writer.shutdown().await;

    queue.close(CloseReason::Detached);
    // Only reset the start flag if no newer run has replaced this queue.
    {
        let current = push.queue.lock().expect("queue poisoned");
        let is_current = current
            .as_ref()
            .map(|q| q.same_channel(&queue))
            .unwrap_or(false);
        drop(current);
        if is_current {
            push.started.store(false, Ordering::Release);
        }
    }
    tracing::info!(
        uplink = %push.info.url,
        reason = ?queue.close_reason(),
        "Static push stopped"
    );
}

async fn forward(
    writer: &mut Box<dyn ChunkWriter>,
    packet: &Arc<Packet>,
    stream_id: u32,
    queue: &SinkQueue,
) -> Result<()> {
    let baser = queue.baser();
    let timestamp = baser.rebase(packet.timestamp, packet.kind);
    baser.record_timestamp(timestamp, packet.kind)?;
    writer
        .write_chunk(ChunkStream::from_packet(packet, timestamp, stream_id))
        .await
}

/// Registry of uplinks, one per destination URL.
pub struct StaticPushRegistry {
    pushes: RwLock<HashMap<String, Arc<StaticPush>>>,
    connector: Arc<dyn UplinkConnector>,
    write_timeout: Duration,
}

impl StaticPushRegistry {
    pub fn new(connector: Arc<dyn UplinkConnector>, write_timeout: Duration) -> Self {
        Self {
            pushes: RwLock::new(HashMap::new()),
            connector,
            write_timeout,
        }
    }

    /// Fetch the uplink for a URL, creating it on first sight.
    pub async fn get_or_create(&self, url: &str) -> Result<Arc<StaticPush>> {
        {
            let pushes = self.pushes.read().await;
            if let Some(push) = pushes.get(url) {
                return Ok(push.clone());
            }
        }
        let mut pushes = self.pushes.write().await;
        if let Some(push) = pushes.get(url) {
            return Ok(push.clone());
        }
        let push = StaticPush::new(url, self.connector.clone(), self.write_timeout)?;
        pushes.insert(url.to_string(), push.clone());
        tracing::debug!(uplink = %url, "Static push created");
        Ok(push)
    }

    pub async fn get(&self, url: &str) -> Option<Arc<StaticPush>> {
        self.pushes.read().await.get(url).cloned()
    }

    /// Signal an uplink to stop and release its registry entry.
    pub async fn stop(&self, url: &str) {
        let removed = self.pushes.write().await.remove(url);
        match removed {
            Some(push) => {
                push.stop();
                tracing::debug!(uplink = %url, "Static push released");
            }
            None => tracing::debug!(uplink = %url, "Static push release: unknown url"),
        }
    }

    pub async fn len(&self) -> usize {
        self.pushes.read().await.len()
    }
}

/// The `app/name` portion of an upstream publish URL.
fn push_key(url: &str) -> Result<String> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let mut segments = without_scheme.split('/');
    let _host = segments.next();
    let rest: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
    match rest.as_slice() {
        [app, name] => Ok(format!("{app}/{name}")),
        _ => Err(Error::InvalidKey(url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct MockUplink {
        connects: AtomicUsize,
        fail_connect: AtomicBool,
        chunks: mpsc::UnboundedSender<ChunkStream>,
        fail_writes: Arc<AtomicBool>,
    }

    struct MockUplinkWriter {
        chunks: mpsc::UnboundedSender<ChunkStream>,
        fail_writes: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ChunkWriter for MockUplinkWriter {
        async fn write_chunk(&mut self, chunk: ChunkStream) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
            }
            let _ = self.chunks.send(chunk);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl UplinkConnector for MockUplink {
        async fn connect(&self, _url: &str) -> Result<UplinkSession> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(UplinkSession {
                writer: Box::new(MockUplinkWriter {
                    chunks: self.chunks.clone(),
                    fail_writes: self.fail_writes.clone(),
                }),
                stream_id: 3,
            })
        }
    }

    fn connector() -> (Arc<MockUplink>, mpsc::UnboundedReceiver<ChunkStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(MockUplink {
                connects: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
                chunks: tx,
                fail_writes: Arc::new(AtomicBool::new(false)),
            }),
            rx,
        )
    }

    fn keyframe(ts: u32) -> Arc<Packet> {
        Arc::new(Packet::video(ts, Bytes::from_static(&[0x17, 0x01, 0xAA])))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_push_key_parsing() {
        assert_eq!(push_key("rtmp://up1.example:1935/live/foo").unwrap(), "live/foo");
        assert_eq!(push_key("rtmp://up1/live/foo").unwrap(), "live/foo");
        assert!(push_key("rtmp://up1/live").is_err());
        assert!(push_key("rtmp://up1/a/b/c").is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_allows_restart() {
        let (uplink, _chunks) = connector();
        let registry = StaticPushRegistry::new(uplink.clone(), Duration::from_secs(10));

        let push = registry
            .get_or_create("rtmp://up1/live/foo")
            .await
            .unwrap();
        push.start().await.unwrap();
        assert!(matches!(
            push.start().await,
            Err(Error::AlreadyStarted(_))
        ));

        push.stop();
        settle().await;
        assert!(!push.is_started());

        push.start().await.unwrap();
        assert!(push.is_started());
        assert_eq!(uplink.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_packets_relay_as_chunks() {
        let (uplink, mut chunks) = connector();
        let registry = StaticPushRegistry::new(uplink, Duration::from_secs(10));
        let push = registry
            .get_or_create("rtmp://up1/live/foo")
            .await
            .unwrap();
        push.start().await.unwrap();

        push.write(keyframe(100)).unwrap();
        push.write(Arc::new(Packet::audio(110, Bytes::from_static(&[0xAF, 0x01]))))
            .unwrap();

        let first = chunks.recv().await.unwrap();
        assert_eq!(first.type_id, 9);
        assert_eq!(first.stream_id, 3);
        assert_eq!(first.timestamp, 100);
        let second = chunks.recv().await.unwrap();
        assert_eq!(second.type_id, 8);
    }

    #[tokio::test]
    async fn test_writes_before_start_are_dropped() {
        let (uplink, _chunks) = connector();
        let registry = StaticPushRegistry::new(uplink, Duration::from_secs(10));
        let push = registry
            .get_or_create("rtmp://up1/live/foo")
            .await
            .unwrap();

        // No uplink yet; the packet vanishes without error.
        push.write(keyframe(0)).unwrap();
        assert!(push.alive());
    }

    #[tokio::test]
    async fn test_transport_failure_marks_uplink_dead() {
        let (uplink, _chunks) = connector();
        let registry = StaticPushRegistry::new(uplink.clone(), Duration::from_secs(10));
        let push = registry
            .get_or_create("rtmp://up1/live/foo")
            .await
            .unwrap();
        push.start().await.unwrap();

        uplink.fail_writes.store(true, Ordering::SeqCst);
        push.write(keyframe(0)).unwrap();
        settle().await;

        assert!(!push.is_started());
        assert!(!push.alive());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_uplink_restartable() {
        let (uplink, _chunks) = connector();
        let registry = StaticPushRegistry::new(uplink.clone(), Duration::from_secs(10));
        let push = registry
            .get_or_create("rtmp://up1/live/foo")
            .await
            .unwrap();

        uplink.fail_connect.store(true, Ordering::SeqCst);
        assert!(push.start().await.is_err());
        assert!(!push.is_started());

        uplink.fail_connect.store(false, Ordering::SeqCst);
        push.start().await.unwrap();
        assert!(push.is_started());
    }

    #[tokio::test]
    async fn test_registry_stop_releases_entry() {
        let (uplink, _chunks) = connector();
        let registry = StaticPushRegistry::new(uplink, Duration::from_secs(10));

        let push = registry
            .get_or_create("rtmp://up1/live/foo")
            .await
            .unwrap();
        push.start().await.unwrap();
        assert_eq!(registry.len().await, 1);

        registry.stop("rtmp://up1/live/foo").await;
        settle().await;
        assert_eq!(registry.len().await, 0);
        assert!(!push.is_started());

        // A fresh entry can be created and started again.
        let again = registry
            .get_or_create("rtmp://up1/live/foo")
            .await
            .unwrap();
        again.start().await.unwrap();
    }
}
