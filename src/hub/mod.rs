//! Publish/subscribe hub
//!
//! The hub routes media from one publisher to any number of heterogeneous
//! consumers with independent back-pressure:
//!
//! ```text
//!                       Arc<StreamRegistry>
//!                  ┌──────────────────────────┐
//!                  │ streams: HashMap<Key,    │
//!                  │   StreamHandle>          │
//!                  └────────────┬─────────────┘
//!                               │
//!   [Publisher] ──packets──► dispatch task ──┬─► sink queue ─► RTMP player
//!                               │ Cache      ├─► sink queue ─► HTTP-FLV
//!                               │ (prelude)  ├─► sink queue ─► FLV file
//!                               │            ├─► sink queue ─► HLS feed
//!                               │            └─► sink queue ─► static push
//! ```
//!
//! Every sink owns a bounded queue the dispatcher offers into without
//! blocking. A sink that cannot keep up overflows and is removed; the
//! publisher and the remaining sinks never wait on it. `bytes::Bytes`
//! payloads are reference-counted, so the fan-out never copies media.

pub mod registry;
pub mod service;
pub mod sink;
pub mod stream;

pub use registry::StreamRegistry;
pub use service::StreamService;
pub use sink::{CloseReason, Sink, SinkQueue, SinkReceiver, SINK_QUEUE_CAPACITY};
pub use stream::{Publisher, StreamConfig, StreamHandle, StreamState, SINK_DROP_LIMIT};
