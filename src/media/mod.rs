//! Media-plane value types
//!
//! This module provides:
//! - The `Packet` / `ChunkStream` / `Info` types crossing every boundary
//! - FLV tag classification and byte-level muxing
//! - The per-stream subscriber prelude (`Cache`)
//! - Per-endpoint timestamp rebasing and idle tracking (`RwBaser`)

pub mod cache;
pub mod flv;
pub mod packet;
pub mod timebase;

pub use cache::Cache;
pub use packet::{ChunkStream, Info, Packet, PacketKind};
pub use timebase::RwBaser;
