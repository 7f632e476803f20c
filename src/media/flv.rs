//! FLV tag classification and byte-level muxing
//!
//! RTMP audio/video message bodies are FLV tag bodies. Classification
//! inspects the first one or two payload bytes:
//!
//! ```text
//! Video: | FrameType (4 bits) | CodecID (4 bits) | [AVC packet type] ...
//! Audio: | SoundFormat (4 bits) | rate/size/type (4 bits) | [AAC packet type] ...
//! ```
//!
//! The muxing half emits the on-the-wire FLV file framing shared by the
//! HTTP-FLV and file sinks:
//!
//! ```text
//! "FLV" 0x01 0x05 0x00000009 | u32 prev-tag-size = 0
//! | type(1) len(3) ts-low(3) ts-ext(1) stream-id(3)=0 | body | u32 prev-tag-size |
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::packet::Packet;

/// FLV file header: signature, version 1, audio+video flags, header size 9.
pub const FLV_HEADER: [u8; 9] = [0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09];

/// Length of the per-tag header.
pub const TAG_HEADER_LEN: usize = 11;

/// Video frame type, upper nibble of the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe
        )
    }
}

/// Video codec id, lower nibble of the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    SorensonH263 = 2,
    ScreenVideo = 3,
    Vp6 = 4,
    Vp6Alpha = 5,
    ScreenVideoV2 = 6,
    Avc = 7,
    Hevc = 12,
    Av1 = 13,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            2 => Some(VideoCodec::SorensonH263),
            3 => Some(VideoCodec::ScreenVideo),
            4 => Some(VideoCodec::Vp6),
            5 => Some(VideoCodec::Vp6Alpha),
            6 => Some(VideoCodec::ScreenVideoV2),
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            13 => Some(VideoCodec::Av1),
            _ => None,
        }
    }

    /// Codecs that carry a separate sequence-header packet (packet-type
    /// byte 0) with decoder configuration.
    pub fn has_sequence_header(&self) -> bool {
        matches!(self, VideoCodec::Avc | VideoCodec::Hevc)
    }
}

/// Audio sound format, upper nibble of the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    LinearPcmPlatform = 0,
    Adpcm = 1,
    Mp3 = 2,
    LinearPcmLe = 3,
    Nellymoser16kMono = 4,
    Nellymoser8kMono = 5,
    Nellymoser = 6,
    G711ALaw = 7,
    G711MuLaw = 8,
    Aac = 10,
    Speex = 11,
    Mp38k = 14,
    DeviceSpecific = 15,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            0 => Some(AudioFormat::LinearPcmPlatform),
            1 => Some(AudioFormat::Adpcm),
            2 => Some(AudioFormat::Mp3),
            3 => Some(AudioFormat::LinearPcmLe),
            4 => Some(AudioFormat::Nellymoser16kMono),
            5 => Some(AudioFormat::Nellymoser8kMono),
            6 => Some(AudioFormat::Nellymoser),
            7 => Some(AudioFormat::G711ALaw),
            8 => Some(AudioFormat::G711MuLaw),
            10 => Some(AudioFormat::Aac),
            11 => Some(AudioFormat::Speex),
            14 => Some(AudioFormat::Mp38k),
            15 => Some(AudioFormat::DeviceSpecific),
            _ => None,
        }
    }
}

/// Video keyframe check, frame-type nibble == 1 (or a server-generated
/// keyframe).
pub fn is_keyframe(packet: &Packet) -> bool {
    if !packet.is_video() || packet.data.is_empty() {
        return false;
    }
    VideoFrameType::from_byte(packet.data[0])
        .map(|ft| ft.is_keyframe())
        .unwrap_or(false)
}

/// AVC/HEVC decoder-configuration packet: codec with a sequence-header
/// concept and packet-type byte == 0.
pub fn is_video_sequence_header(packet: &Packet) -> bool {
    if !packet.is_video() || packet.data.len() < 2 {
        return false;
    }
    VideoCodec::from_byte(packet.data[0])
        .map(|c| c.has_sequence_header())
        .unwrap_or(false)
        && packet.data[1] == 0
}

/// AAC AudioSpecificConfig packet: AAC format and packet-type byte == 0.
pub fn is_audio_sequence_header(packet: &Packet) -> bool {
    if !packet.is_audio() || packet.data.len() < 2 {
        return false;
    }
    AudioFormat::from_byte(packet.data[0]) == Some(AudioFormat::Aac) && packet.data[1] == 0
}

/// Encode the FLV file prelude: header plus the leading previous-tag-size
/// of zero.
pub fn encode_file_header() -> Bytes {
    let mut buf = BytesMut::with_capacity(FLV_HEADER.len() + 4);
    buf.put_slice(&FLV_HEADER);
    buf.put_u32(0);
    buf.freeze()
}

/// Encode one complete FLV tag: 11-byte header, body, trailing
/// previous-tag-size of `TAG_HEADER_LEN + body.len()`.
pub fn encode_tag(type_id: u8, timestamp: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TAG_HEADER_LEN + body.len() + 4);

    buf.put_u8(type_id);
    put_u24(&mut buf, body.len() as u32);
    put_u24(&mut buf, timestamp & 0x00FF_FFFF);
    buf.put_u8(((timestamp >> 24) & 0xFF) as u8);
    put_u24(&mut buf, 0); // stream id, always 0 in files
    buf.put_slice(body);
    buf.put_u32((TAG_HEADER_LEN + body.len()) as u32);

    buf.freeze()
}

fn put_u24(buf: &mut BytesMut, v: u32) {
    buf.put_u8(((v >> 16) & 0xFF) as u8);
    buf.put_u8(((v >> 8) & 0xFF) as u8);
    buf.put_u8((v & 0xFF) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::packet::{TAG_SCRIPT_DATA, TAG_VIDEO};
    use bytes::Bytes;

    fn video(first: u8, second: u8) -> Packet {
        Packet::video(0, Bytes::copy_from_slice(&[first, second, 0, 0, 0]))
    }

    #[test]
    fn test_keyframe_detection() {
        assert!(is_keyframe(&video(0x17, 0x01)));
        assert!(is_keyframe(&video(0x47, 0x01))); // generated keyframe
        assert!(!is_keyframe(&video(0x27, 0x01))); // inter frame
        assert!(!is_keyframe(&Packet::audio(0, Bytes::from_static(&[0xAF, 0x01]))));
        assert!(!is_keyframe(&Packet::video(0, Bytes::new())));
    }

    #[test]
    fn test_video_sequence_header() {
        assert!(is_video_sequence_header(&video(0x17, 0x00))); // AVC
        assert!(is_video_sequence_header(&video(0x1C, 0x00))); // HEVC
        assert!(!is_video_sequence_header(&video(0x17, 0x01))); // NALU
        assert!(!is_video_sequence_header(&video(0x14, 0x00))); // VP6
    }

    #[test]
    fn test_audio_sequence_header() {
        let aac_header = Packet::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        let aac_raw = Packet::audio(0, Bytes::from_static(&[0xAF, 0x01, 0x21]));
        let mp3 = Packet::audio(0, Bytes::from_static(&[0x2F, 0x00]));

        assert!(is_audio_sequence_header(&aac_header));
        assert!(!is_audio_sequence_header(&aac_raw));
        assert!(!is_audio_sequence_header(&mp3));
    }

    #[test]
    fn test_short_payloads_never_classify() {
        let one_byte = Packet::video(0, Bytes::from_static(&[0x17]));
        assert!(!is_video_sequence_header(&one_byte));
        assert!(is_keyframe(&one_byte)); // frame type needs only one byte
    }

    #[test]
    fn test_file_header_bytes() {
        let h = encode_file_header();
        assert_eq!(&h[..3], b"FLV");
        assert_eq!(h[3], 1); // version
        assert_eq!(h[4], 0x05); // audio + video
        assert_eq!(&h[5..9], &[0, 0, 0, 9]);
        assert_eq!(&h[9..], &[0, 0, 0, 0]); // leading prev-tag-size
    }

    #[test]
    fn test_tag_layout() {
        let body = [0xAAu8; 5];
        let tag = encode_tag(TAG_VIDEO, 0x0102_0304, &body);

        assert_eq!(tag.len(), TAG_HEADER_LEN + 5 + 4);
        assert_eq!(tag[0], TAG_VIDEO);
        assert_eq!(&tag[1..4], &[0, 0, 5]); // 24-bit length
        assert_eq!(&tag[4..7], &[0x02, 0x03, 0x04]); // low 24 timestamp bits
        assert_eq!(tag[7], 0x01); // extended timestamp byte
        assert_eq!(&tag[8..11], &[0, 0, 0]); // stream id
        assert_eq!(&tag[11..16], &body);
    }

    #[test]
    fn test_previous_tag_size_covers_header_and_body() {
        for len in [0usize, 1, 17, 4096] {
            let body = vec![0u8; len];
            let tag = encode_tag(TAG_SCRIPT_DATA, 0, &body);
            let trailer = &tag[tag.len() - 4..];
            let prev = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
            assert_eq!(prev as usize, TAG_HEADER_LEN + len);
        }
    }

    #[test]
    fn test_codec_tables() {
        assert_eq!(VideoCodec::from_byte(0x17), Some(VideoCodec::Avc));
        assert_eq!(VideoCodec::from_byte(0x1C), Some(VideoCodec::Hevc));
        assert_eq!(VideoCodec::from_byte(0x1D), Some(VideoCodec::Av1));
        assert_eq!(VideoCodec::from_byte(0x11), None);
        assert_eq!(AudioFormat::from_byte(0xAF), Some(AudioFormat::Aac));
        assert_eq!(AudioFormat::from_byte(0x90), None);
        assert_eq!(
            VideoFrameType::from_byte(0x50),
            Some(VideoFrameType::VideoInfoFrame)
        );
    }
}
