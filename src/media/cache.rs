//! Per-stream subscriber prelude
//!
//! A subscriber that joins mid-session needs more than the next live
//! packet: the decoder wants the stream metadata, the video and audio
//! sequence headers, and a run of frames starting at a keyframe. The
//! `Cache` keeps exactly that: the latest metadata and sequence headers
//! plus a ring of the most recent complete GOPs.
//!
//! Replaying the cache into a new sink yields a decodable stream whose
//! first video frame is a keyframe.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::Result;

use super::flv;
use super::packet::Packet;

/// Prelude cache for one live stream.
#[derive(Debug)]
pub struct Cache {
    metadata: Option<Arc<Packet>>,
    video_seq_header: Option<Arc<Packet>>,
    audio_seq_header: Option<Arc<Packet>>,
    /// Ring of complete GOPs, oldest first. Each GOP is a keyframe plus
    /// the frames up to the next keyframe.
    gops: VecDeque<Vec<Arc<Packet>>>,
    capacity: usize,
}

impl Cache {
    /// Create a cache retaining up to `gop_num` GOPs (at least one).
    pub fn new(gop_num: usize) -> Self {
        let capacity = gop_num.max(1);
        Self {
            metadata: None,
            video_seq_header: None,
            audio_seq_header: None,
            gops: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Classify and absorb one packet from the publisher.
    pub fn write(&mut self, packet: &Arc<Packet>) {
        if packet.is_metadata() {
            self.metadata = Some(packet.clone());
            return;
        }
        if flv::is_audio_sequence_header(packet) {
            self.audio_seq_header = Some(packet.clone());
            return;
        }
        if flv::is_video_sequence_header(packet) {
            self.video_seq_header = Some(packet.clone());
            return;
        }
        if packet.is_video() && flv::is_keyframe(packet) {
            if self.gops.len() == self.capacity {
                self.gops.pop_front();
            }
            self.gops.push_back(vec![packet.clone()]);
            return;
        }
        // Audio frames and inter frames belong to the GOP in progress.
        // Before the first keyframe there is nothing a subscriber could
        // decode, so they are dropped.
        if let Some(current) = self.gops.back_mut() {
            current.push(packet.clone());
        }
    }

    /// Replay the prelude in decodable order: metadata, video sequence
    /// header, audio sequence header, then every retained GOP oldest
    /// first. Original timestamps are preserved. The first write failure
    /// aborts the replay.
    pub fn send<F>(&self, mut write: F) -> Result<()>
    where
        F: FnMut(Arc<Packet>) -> Result<()>,
    {
        if let Some(meta) = &self.metadata {
            write(meta.clone())?;
        }
        if let Some(video) = &self.video_seq_header {
            write(video.clone())?;
        }
        if let Some(audio) = &self.audio_seq_header {
            write(audio.clone())?;
        }
        for gop in &self.gops {
            for packet in gop {
                write(packet.clone())?;
            }
        }
        Ok(())
    }

    /// Number of complete GOPs currently retained.
    pub fn gop_count(&self) -> usize {
        self.gops.len()
    }

    /// Total buffered frames across all retained GOPs.
    pub fn frame_count(&self) -> usize {
        self.gops.iter().map(|g| g.len()).sum()
    }
}
