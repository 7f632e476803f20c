//! livehub: a live-stream relay hub
//!
//! Publishers push media in over RTMP; subscribers pull the same session
//! out over RTMP, HTTP-FLV or HLS, while the hub optionally records to
//! FLV (with MP4 archiving) and relays to configured upstream servers.
//!
//! This crate is the media plane: per-stream dispatch with independent
//! per-sink back-pressure, the subscriber prelude cache, timestamp
//! rebasing, and the consumer lifecycles. The protocol edges (TCP accept
//! loops, the RTMP chunk codec, AMF command parsing, the HLS TS writer,
//! the admin API) are collaborators behind the narrow traits in
//! [`sinks`] and [`relay`].
//!
//! # Overview
//!
//! - Ingest a publish with [`hub::StreamService::start_publish`] and feed
//!   it assembled packets.
//! - Attach players with `play_rtmp` / `play_http_flv` / `attach_hls`.
//! - Recording and static push attach themselves according to
//!   [`config::Settings`].

pub mod amf;
pub mod archive;
pub mod config;
pub mod error;
pub mod hub;
pub mod media;
pub mod relay;
pub mod sinks;

pub use config::Settings;
pub use error::{Error, Result};
pub use hub::{CloseReason, Sink, StreamRegistry, StreamService};
pub use media::{Cache, ChunkStream, Info, Packet, PacketKind, RwBaser};
