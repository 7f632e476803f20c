//! FLV recording sink
//!
//! Writes the session to `<flv_dir>/<app>/<name>[_<unix_seconds>].flv`,
//! same tag framing as the HTTP-FLV sink. In singleton mode the suffix is
//! omitted and the file is truncated, so a re-publish overwrites the
//! previous recording; otherwise every publish produces a new file.
//!
//! On close the file is flushed and, when archiving is enabled, handed to
//! the MP4 worker. Disk trouble only ever kills this sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::amf::{metadata_reform, ReformMode};
use crate::archive::{mp4_output_path, Mp4Archiver};
use crate::error::Result;
use crate::media::{flv, Info, Packet};

use crate::hub::sink::{CloseReason, Sink, SinkQueue, SinkReceiver, SINK_QUEUE_CAPACITY};

pub struct FlvFileSink {
    info: Info,
    path: PathBuf,
    queue: SinkQueue,
}

impl FlvFileSink {
    /// Open the recording file (creating `<flv_dir>/<app>/` on demand)
    /// and spawn the writer task.
    pub async fn create(
        info: &Info,
        flv_dir: &Path,
        singleton: bool,
        write_timeout: Duration,
        archiver: Option<Arc<Mp4Archiver>>,
    ) -> Result<Arc<Self>> {
        let dir = flv_dir.join(info.app());
        fs::create_dir_all(&dir).await?;

        let path = if singleton {
            dir.join(format!("{}.flv", info.name()))
        } else {
            let stamp = chrono::Utc::now().timestamp();
            dir.join(format!("{}_{}.flv", info.name(), stamp))
        };
        let mut file = fs::File::create(&path).await?;
        file.write_all(&flv::encode_file_header()).await?;
        tracing::info!(stream = %info.key, file = %path.display(), "Recording started");

        let (queue, rx) = SinkQueue::new(SINK_QUEUE_CAPACITY, write_timeout);
        let sink = Arc::new(Self {
            info: Info {
                uid: uuid::Uuid::new_v4().to_string(),
                url: format!("file://{}", path.display()),
                key: info.key.clone(),
            },
            path: path.clone(),
            queue: queue.clone(),
        });
        tokio::spawn(record_loop(rx, file, path, queue, sink.info.clone(), archiver));
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FlvFileSink {
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

async fn record_loop(
    mut rx: SinkReceiver,
    mut file: fs::File,
    path: PathBuf,
    queue: SinkQueue,
    info: Info,
    archiver: Option<Arc<Mp4Archiver>>,
) {
    let baser = queue.baser();
    while let Some(packet) = rx.next().await {
        let payload = if packet.is_metadata() {
            match metadata_reform(&packet.data, ReformMode::Delete) {
                Ok(reformed) => reformed,
                Err(e) => {
                    tracing::warn!(sink = %info, error = %e, "Bad metadata, recording stopped");
                    queue.close(CloseReason::TransportError);
                    break;
                }
            }
        } else {
            packet.data.clone()
        };

        let timestamp = baser.rebase(packet.timestamp, packet.kind);
        if baser.record_timestamp(timestamp, packet.kind).is_err() {
            queue.close(CloseReason::TransportError);
            break;
        }
        let tag = flv::encode_tag(packet.kind.type_id(), timestamp, &payload);
        if let Err(e) = file.write_all(&tag).await {
            tracing::error!(sink = %info, error = %e, "Recording write failed");
            queue.close(CloseReason::TransportError);
            break;
        }
        baser.set_pre_time();
    }

    if let Err(e) = file.flush().await {
        tracing::error!(sink = %info, error = %e, "Recording flush failed");
    }
    drop(file);
    tracing::info!(
        sink = %info,
        file = %path.display(),
        reason = ?queue.close_reason(),
        "Recording finished"
    );
    if let Some(archiver) = archiver {
        archiver.enqueue(path.clone(), mp4_output_path(&path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn info() -> Info {
        Info::new("rtmp://localhost/live/movie", "live/movie").unwrap()
    }

    fn keyframe(ts: u32) -> Arc<Packet> {
        Arc::new(Packet::video(ts, Bytes::from_static(&[0x17, 0x01, 0xAA])))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_singleton_naming_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlvFileSink::create(&info(), dir.path(), true, Duration::from_secs(10), None)
            .await
            .unwrap();

        assert_eq!(sink.path(), dir.path().join("live").join("movie.flv"));

        sink.write(keyframe(0)).unwrap();
        settle().await;
        sink.close(CloseReason::StreamClosed);
        settle().await;

        let written = std::fs::read(sink.path()).unwrap();
        assert_eq!(&written[..3], b"FLV");
        // Header (9) + prev-tag-size (4) + one tag (11 + 3 + 4).
        assert_eq!(written.len(), 13 + 18);
        assert_eq!(written[13], 9); // video tag follows the prelude
    }

    #[tokio::test]
    async fn test_timestamped_naming() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlvFileSink::create(&info(), dir.path(), false, Duration::from_secs(10), None)
            .await
            .unwrap();

        let name = sink.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("movie_"));
        assert!(name.ends_with(".flv"));
        assert_ne!(name, "movie_.flv");
    }

    #[tokio::test]
    async fn test_singleton_republish_truncates() {
        let dir = tempfile::tempdir().unwrap();

        let first = FlvFileSink::create(&info(), dir.path(), true, Duration::from_secs(10), None)
            .await
            .unwrap();
        first.write(keyframe(0)).unwrap();
        first.write(keyframe(33)).unwrap();
        settle().await;
        first.close(CloseReason::StreamClosed);
        settle().await;
        let long = std::fs::read(first.path()).unwrap().len();

        let second = FlvFileSink::create(&info(), dir.path(), true, Duration::from_secs(10), None)
            .await
            .unwrap();
        settle().await;
        second.close(CloseReason::StreamClosed);
        settle().await;

        let short = std::fs::read(second.path()).unwrap().len();
        assert_eq!(first.path(), second.path());
        assert!(short < long);
        assert_eq!(short, 13); // header + prev-tag-size only
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FlvFileSink::create(&info(), dir.path(), true, Duration::from_secs(10), None)
            .await
            .unwrap();

        sink.close(CloseReason::Detached);
        sink.close(CloseReason::StreamClosed);
        settle().await;

        assert!(!sink.alive());
        assert!(matches!(sink.write(keyframe(0)), Err(crate::error::Error::SinkClosed)));
    }
}
