//! Per-endpoint timestamp rebase and idle tracking
//!
//! Every endpoint (the publisher's reader, each sink's writer) owns one
//! `RwBaser`. It turns the publisher's absolute timestamps into the
//! monotonic relative timeline the endpoint's peer expects, detects
//! backward jumps, and tracks last-activity time for liveness probes.
//!
//! All state is atomic: the dispatcher probes `alive()` while the sink's
//! writer task records timestamps and activity.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

use super::packet::PacketKind;

/// Timestamp rebase + idle detector for one endpoint.
#[derive(Debug)]
pub struct RwBaser {
    epoch: Instant,
    timeout: Duration,
    /// Milliseconds since `epoch` of the last processed packet.
    last_activity: AtomicU64,
    video: Lane,
    audio: Lane,
}

/// Rebase state for one media type.
#[derive(Debug, Default)]
struct Lane {
    /// Offset subtracted from incoming timestamps.
    base: AtomicU32,
    /// Last outgoing timestamp, for monotonicity checks.
    last: AtomicU32,
    /// Set on origin change; the next packet recomputes `base`.
    rebase_pending: AtomicBool,
}

impl RwBaser {
    pub fn new(timeout: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            timeout,
            last_activity: AtomicU64::new(0),
            video: Lane::default(),
            audio: Lane::default(),
        }
    }

    fn lane(&self, kind: PacketKind) -> Option<&Lane> {
        match kind {
            PacketKind::Video => Some(&self.video),
            PacketKind::Audio => Some(&self.audio),
            // Script data rides the session timeline untouched.
            PacketKind::Metadata => None,
        }
    }

    /// Stamp the endpoint as active. Called for every processed packet.
    pub fn set_pre_time(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity.store(now, Ordering::Relaxed);
    }

    /// True while the endpoint has seen activity within its timeout.
    pub fn alive(&self) -> bool {
        let last = self.last_activity.load(Ordering::Relaxed);
        let now = self.epoch.elapsed().as_millis() as u64;
        now.saturating_sub(last) < self.timeout.as_millis() as u64
    }

    /// Schedule a rebase of both media lanes. The next packet of each type
    /// continues the outgoing timeline at `last + 1` regardless of the new
    /// origin's clock.
    pub fn mark_origin_change(&self) {
        self.video.rebase_pending.store(true, Ordering::Relaxed);
        self.audio.rebase_pending.store(true, Ordering::Relaxed);
    }

    /// Map an incoming absolute timestamp to the endpoint's outgoing
    /// timeline.
    pub fn rebase(&self, timestamp: u32, kind: PacketKind) -> u32 {
        let Some(lane) = self.lane(kind) else {
            return timestamp;
        };
        if lane.rebase_pending.swap(false, Ordering::Relaxed) {
            let last = lane.last.load(Ordering::Relaxed);
            lane.base
                .store(timestamp.wrapping_sub(last).wrapping_sub(1), Ordering::Relaxed);
        }
        timestamp.wrapping_sub(lane.base.load(Ordering::Relaxed))
    }

    /// Record an outgoing timestamp, rejecting backward jumps.
    pub fn record_timestamp(&self, timestamp: u32, kind: PacketKind) -> Result<()> {
        let Some(lane) = self.lane(kind) else {
            return Ok(());
        };
        let last = lane.last.load(Ordering::Relaxed);
        if timestamp < last {
            return Err(Error::InvalidTimestamp {
                last,
                current: timestamp,
            });
        }
        lane.last.store(timestamp, Ordering::Relaxed);
        Ok(())
    }

    /// Current base offset for a media type.
    pub fn base_timestamp(&self, kind: PacketKind) -> u32 {
        self.lane(kind)
            .map(|l| l.base.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
