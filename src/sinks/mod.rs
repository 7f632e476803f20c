//! Concrete stream consumers
//!
//! Each sink owns a bounded queue and a writer task; the dispatcher only
//! sees the `Sink` trait. Transports below the assembled-message boundary
//! (the RTMP chunk layer, the HLS TS writer) are collaborators reached
//! through the narrow traits defined here.

pub mod flv_file;
pub mod hls;
pub mod http_flv;
pub mod rtmp_player;

use async_trait::async_trait;

use crate::error::Result;
use crate::media::ChunkStream;

pub use flv_file::FlvFileSink;
pub use hls::{HlsSink, Segmenter};
pub use http_flv::HttpFlvSink;
pub use rtmp_player::RtmpPlayerSink;

/// Outbound RTMP message writer, implemented by the chunk-layer
/// collaborator over a live connection.
#[async_trait]
pub trait ChunkWriter: Send {
    /// Frame and send one assembled message.
    async fn write_chunk(&mut self, chunk: ChunkStream) -> Result<()>;

    /// Release the underlying transport.
    async fn shutdown(&mut self) -> Result<()>;
}
