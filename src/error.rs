//! Crate-wide error type
//!
//! Sink-local failures (`QueueFull`, a dead transport) are handled by the
//! dispatcher removing that sink; publisher-side failures (`IdleTimeout`,
//! `InvalidTimestamp`) are terminal for the whole stream.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for hub, sink and relay operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Stream key is not of the form `app/name`.
    #[error("invalid stream key: {0:?}")]
    InvalidKey(String),

    /// Application is unknown or not configured with `live: true`.
    #[error("application disabled: {0}")]
    AppDisabled(String),

    /// A second publisher tried to claim a key that is already live.
    #[error("stream already publishing: {0}")]
    AlreadyPublishing(String),

    /// A subscriber arrived before any publisher on the key.
    #[error("no publisher for stream: {0}")]
    NoPublisher(String),

    /// A sink's bounded queue rejected a packet.
    #[error("sink queue full")]
    QueueFull,

    /// No activity on an endpoint within its configured timeout.
    #[error("idle timeout")]
    IdleTimeout,

    /// Outgoing timestamps went backwards; the endpoint is closed.
    #[error("non-monotonic timestamp: {last} -> {current}")]
    InvalidTimestamp { last: u32, current: u32 },

    /// `start()` called on an uplink that is already running.
    #[error("static push already started: {0}")]
    AlreadyStarted(String),

    /// The stream's dispatch task has shut down.
    #[error("stream closed")]
    StreamClosed,

    /// The sink was closed and no longer accepts packets.
    #[error("sink closed")]
    SinkClosed,

    /// Network or file I/O failure.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// MP4 transcode failure. Logged only; never affects live serving.
    #[error("archive: {0}")]
    Archive(String),

    /// Malformed AMF0 script data.
    #[error("metadata: {0}")]
    Metadata(String),

    /// Configuration could not be loaded or deserialized.
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
}
