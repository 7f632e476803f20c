//! Media packet and stream identity types
//!
//! A `Packet` is the unit that crosses every boundary in the hub: one RTMP
//! message body (equivalently, one FLV tag body) plus its classification
//! and timestamp. Payloads are `Bytes`, so fanning a packet out to many
//! sinks reference-counts the data instead of copying it.

use bytes::Bytes;

use crate::error::{Error, Result};

/// FLV/RTMP message type ids.
pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;
pub const TAG_SCRIPT_DATA: u8 = 18;

/// What a packet carries. Exactly one of the three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Video,
    Audio,
    /// Script-data tag (`onMetaData`).
    Metadata,
}

impl PacketKind {
    /// The FLV tag type id / RTMP message type id for this kind.
    pub fn type_id(&self) -> u8 {
        match self {
            PacketKind::Audio => TAG_AUDIO,
            PacketKind::Video => TAG_VIDEO,
            PacketKind::Metadata => TAG_SCRIPT_DATA,
        }
    }
}

/// One media unit flowing from a publisher to the sinks.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    /// Milliseconds, monotonic within a session. The wire may wrap at
    /// 24 bits; the full 32-bit value is stored here.
    pub timestamp: u32,
    /// RTMP message stream id.
    pub stream_id: u32,
    /// The message body (FLV tag body), including codec header bytes.
    pub data: Bytes,
}

impl Packet {
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            kind: PacketKind::Video,
            timestamp,
            stream_id: 0,
            data,
        }
    }

    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            kind: PacketKind::Audio,
            timestamp,
            stream_id: 0,
            data,
        }
    }

    pub fn metadata(timestamp: u32, data: Bytes) -> Self {
        Self {
            kind: PacketKind::Metadata,
            timestamp,
            stream_id: 0,
            data,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == PacketKind::Audio
    }

    pub fn is_metadata(&self) -> bool {
        self.kind == PacketKind::Metadata
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// The RTMP-framed form of a packet, ready for a chunk writer.
///
/// Invariant: `length == data.len()`.
#[derive(Debug, Clone)]
pub struct ChunkStream {
    pub type_id: u8,
    pub length: u32,
    pub timestamp: u32,
    pub stream_id: u32,
    pub data: Bytes,
}

impl ChunkStream {
    /// Re-frame a packet for an outbound connection, with the timestamp
    /// already rebased for that endpoint.
    pub fn from_packet(packet: &Packet, timestamp: u32, stream_id: u32) -> Self {
        Self {
            type_id: packet.kind.type_id(),
            length: packet.data.len() as u32,
            timestamp,
            stream_id,
            data: packet.data.clone(),
        }
    }
}

/// Identity of one stream endpoint (publisher, player, recorder, uplink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    /// Unique per endpoint.
    pub uid: String,
    /// Source or target URL.
    pub url: String,
    /// `"<app>/<name>"`. Contains exactly one `/`.
    pub key: String,
}

impl Info {
    /// Build an identity with a fresh uid, validating the key form.
    pub fn new(url: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        parse_key(&key)?;
        Ok(Self {
            uid: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            key,
        })
    }

    /// The application part of the key.
    pub fn app(&self) -> &str {
        self.key.split('/').next().unwrap_or("")
    }

    /// The stream-name part of the key.
    pub fn name(&self) -> &str {
        self.key.split('/').nth(1).unwrap_or("")
    }
}

impl std::fmt::Display for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.key, self.uid)
    }
}

/// Split and validate an `app/name` key.
pub fn parse_key(key: &str) -> Result<(&str, &str)> {
    let mut parts = key.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(app), Some(name))
            if !app.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((app, name))
        }
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}
