//! HTTP-FLV sink
//!
//! Streams an FLV file body into an HTTP response: the FLV header once,
//! then one tag per packet. The HTTP layer owns the connection and hands
//! over the bounded body channel; when the client goes away the channel
//! closes and the sink dies with it.
//!
//! Metadata passes through the AMF rewrite so recording-oriented fields
//! the server cannot vouch for never reach players.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::amf::{metadata_reform, ReformMode};
use crate::error::Result;
use crate::media::{flv, Info, Packet};

use crate::hub::sink::{CloseReason, Sink, SinkQueue, SinkReceiver, SINK_QUEUE_CAPACITY};

pub struct HttpFlvSink {
    info: Info,
    queue: SinkQueue,
}

impl HttpFlvSink {
    /// Wrap an HTTP response body channel and spawn the muxing task.
    pub fn spawn(info: Info, body: mpsc::Sender<Bytes>, write_timeout: Duration) -> Arc<Self> {
        let (queue, rx) = SinkQueue::new(SINK_QUEUE_CAPACITY, write_timeout);
        tokio::spawn(mux_loop(rx, body, queue.clone(), info.clone()));
        Arc::new(Self { info, queue })
    }
}

impl Sink for HttpFlvSink {
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

async fn mux_loop(mut rx: SinkReceiver, body: mpsc::Sender<Bytes>, queue: SinkQueue, info: Info) {
    if body.send(flv::encode_file_header()).await.is_err() {
        queue.close(CloseReason::TransportError);
        return;
    }

    let baser = queue.baser();
    while let Some(packet) = rx.next().await {
        let payload = if packet.is_metadata() {
            match metadata_reform(&packet.data, ReformMode::Delete) {
                Ok(reformed) => reformed,
                Err(e) => {
                    tracing::warn!(sink = %info, error = %e, "Bad metadata, closing");
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
        if body.send(tag).await.is_err() {
            tracing::debug!(sink = %info, "FLV client went away");
            queue.close(CloseReason::TransportError);
            break;
        }
        baser.set_pre_time();
    }
    // Dropping `body` ends the HTTP response.
    tracing::debug!(sink = %info, reason = ?queue.close_reason(), "HTTP-FLV sink finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::{decode_all, AmfValue};
    use bytes::{BufMut, BytesMut};

    fn sink() -> (Arc<HttpFlvSink>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        let info = Info::new("http://localhost/live/test.flv", "live/test").unwrap();
        (HttpFlvSink::spawn(info, tx, Duration::from_secs(10)), rx)
    }

    fn metadata_packet() -> Arc<Packet> {
        // "@setDataFrame", "onMetaData", { duration: 1, width: 640 }
        let mut buf = BytesMut::new();
        for s in ["@setDataFrame", "onMetaData"] {
            buf.put_u8(0x02);
            buf.put_u16(s.len() as u16);
            buf.put_slice(s.as_bytes());
        }
        buf.put_u8(0x03);
        for (key, value) in [("duration", 1.0f64), ("width", 640.0)] {
            buf.put_u16(key.len() as u16);
            buf.put_slice(key.as_bytes());
            buf.put_u8(0x00);
            buf.put_f64(value);
        }
        buf.put_u16(0);
        buf.put_u8(0x09);
        Arc::new(Packet::metadata(0, buf.freeze()))
    }

    #[tokio::test]
    async fn test_header_precedes_tags() {
        let (sink, mut rx) = sink();

        sink.write(Arc::new(Packet::video(
            0,
            Bytes::from_static(&[0x17, 0x01, 0xAA]),
        )))
        .unwrap();

        let header = rx.recv().await.unwrap();
        assert_eq!(&header[..3], b"FLV");
        assert_eq!(header[4], 0x05);
        assert_eq!(&header[9..13], &[0, 0, 0, 0]);

        let tag = rx.recv().await.unwrap();
        assert_eq!(tag[0], 9);
        let prev = u32::from_be_bytes(tag[tag.len() - 4..].try_into().unwrap());
        assert_eq!(prev as usize, tag.len() - 4);
    }

    #[tokio::test]
    async fn test_metadata_is_reformed() {
        let (sink, mut rx) = sink();

        sink.write(metadata_packet()).unwrap();

        let _header = rx.recv().await.unwrap();
        let tag = rx.recv().await.unwrap();
        assert_eq!(tag[0], 18);

        let body_len = tag.len() - flv::TAG_HEADER_LEN - 4;
        let mut body = Bytes::copy_from_slice(&tag[flv::TAG_HEADER_LEN..][..body_len]);
        let values = decode_all(&mut body).unwrap();

        assert_eq!(values[0], AmfValue::String("onMetaData".into()));
        let AmfValue::Object(props) = &values[1] else {
            panic!("expected object");
        };
        assert!(props.iter().any(|(k, _)| k == "width"));
        assert!(!props.iter().any(|(k, _)| k == "duration"));
    }

    #[tokio::test]
    async fn test_client_disconnect_kills_sink() {
        let (sink, rx) = sink();
        drop(rx);

        sink.write(Arc::new(Packet::video(
            0,
            Bytes::from_static(&[0x17, 0x01, 0xAA]),
        )))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!sink.alive());
    }
}
