//! Process-wide stream registry
//!
//! Publishers and subscribers rendezvous here on the `app/name` key. The
//! map is read-heavy (every subscriber lookup) and only written on
//! publisher start and garbage collection, so it sits behind an `RwLock`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::media::Info;

use super::stream::{self, Publisher, StreamConfig, StreamHandle, StreamState};

/// How often the GC task sweeps by default.
pub const GC_INTERVAL: Duration = Duration::from_secs(5);

/// Registry of all live streams.
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, StreamHandle>>,
    config: StreamConfig,
}

impl StreamRegistry {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Claim a key for publishing and spawn its dispatch task.
    ///
    /// A key already held by a live stream (idle or publishing) is
    /// refused; only closed or absent entries are replaced, so at most
    /// one publishing stream exists per key.
    pub async fn publish(&self, info: Info) -> Result<Publisher> {
        let mut streams = self.streams.write().await;

        if let Some(existing) = streams.get(&info.key) {
            if existing.state() != StreamState::Closed {
                tracing::warn!(
                    stream = %info.key,
                    uid = %info.uid,
                    "Publish refused, key already live"
                );
                return Err(Error::AlreadyPublishing(info.key.clone()));
            }
        }

        let publisher = stream::spawn(info.clone(), self.config.clone());
        streams.insert(info.key.clone(), publisher.handle().clone());
        tracing::info!(stream = %info.key, uid = %info.uid, "Publisher registered");
        Ok(publisher)
    }

    /// Look up the stream a subscriber should attach to.
    ///
    /// Subscribers arriving before any publisher are rejected; only
    /// published streams are playable.
    pub async fn subscriber_target(&self, key: &str) -> Result<StreamHandle> {
        let streams = self.streams.read().await;
        match streams.get(key) {
            Some(handle) if handle.state() != StreamState::Closed => Ok(handle.clone()),
            _ => Err(Error::NoPublisher(key.to_string())),
        }
    }

    /// Whether a key currently has a live stream.
    pub async fn is_live(&self, key: &str) -> bool {
        let streams = self.streams.read().await;
        streams
            .get(key)
            .map(|h| h.state() != StreamState::Closed)
            .unwrap_or(false)
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// One GC sweep: drop closed entries, close streams whose publisher
    /// has been silent beyond the read timeout.
    pub async fn gc_tick(&self) {
        let mut streams = self.streams.write().await;
        streams.retain(|key, handle| match handle.state() {
            StreamState::Closed => {
                tracing::debug!(stream = %key, "Stream entry removed by GC");
                false
            }
            _ => {
                if !handle.publisher_alive() {
                    tracing::info!(stream = %key, "Stream idle beyond timeout, closing");
                    handle.close();
                }
                true
            }
        });
    }

    /// Spawn the periodic GC task. Returns the handle for shutdown.
    pub fn spawn_gc_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.gc_tick().await;
            }
        })
    }
}
