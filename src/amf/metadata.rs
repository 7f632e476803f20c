//! AMF0 script-data rewrite
//!
//! Publishers send stream metadata as an AMF0-encoded `@setDataFrame`
//! command wrapping an `onMetaData` object. Before that object is written
//! into an FLV body (file or HTTP stream) it has to be reshaped: the
//! wrapper string is dropped and recording-oriented fields the server
//! cannot vouch for (`duration`, `filesize`) are removed.
//!
//! Only the value subset that appears in metadata is modeled here; RTMP
//! command parsing lives with the chunk-layer collaborator.
//!
//! Type markers used:
//! ```text
//! 0x00 Number   0x01 Boolean   0x02 String      0x03 Object
//! 0x05 Null     0x06 Undefined 0x08 ECMA Array  0x09 Object End
//! 0x0A Strict Array             0x0B Date        0x0C Long String
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Nesting cap so malformed input cannot recurse unboundedly.
const MAX_NESTING_DEPTH: usize = 32;

/// The RTMP wrapper stripped from metadata before FLV muxing.
const SET_DATA_FRAME: &str = "@setDataFrame";

/// Fields removed in [`ReformMode::Delete`].
const REFORMED_FIELDS: [&str; 2] = ["duration", "filesize"];

/// Decoded AMF0 value. Object and array properties keep their original
/// order so a rewrite round-trips faithfully.
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, AmfValue)>),
    EcmaArray(Vec<(String, AmfValue)>),
    StrictArray(Vec<AmfValue>),
    Date(f64),
    Null,
    Undefined,
}

/// What [`metadata_reform`] does with the reformed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReformMode {
    /// Remove `duration` and `filesize`.
    Delete,
    /// Stamp zeroed `duration` and `filesize` placeholders.
    Add,
}

/// Rewrite a script-data payload for FLV output.
///
/// Strips a leading `@setDataFrame` wrapper if present and applies the
/// reform mode to the metadata object. The payload must decode to a name
/// string plus an object or ECMA array.
pub fn metadata_reform(data: &[u8], mode: ReformMode) -> Result<Bytes> {
    let mut buf = Bytes::copy_from_slice(data);
    let mut values = decode_all(&mut buf)?;

    if matches!(values.first(), Some(AmfValue::String(s)) if s == SET_DATA_FRAME) {
        values.remove(0);
    }

    if values.len() != 2 {
        return Err(Error::Metadata(format!(
            "expected name and object, got {} values",
            values.len()
        )));
    }
    if !matches!(values[0], AmfValue::String(_)) {
        return Err(Error::Metadata("metadata name is not a string".into()));
    }

    let props = match &mut values[1] {
        AmfValue::Object(props) | AmfValue::EcmaArray(props) => props,
        other => {
            return Err(Error::Metadata(format!(
                "metadata body is not an object: {other:?}"
            )))
        }
    };
    match mode {
        ReformMode::Delete => {
            props.retain(|(key, _)| !REFORMED_FIELDS.contains(&key.as_str()));
        }
        ReformMode::Add => {
            for field in REFORMED_FIELDS {
                if !props.iter().any(|(key, _)| key == field) {
                    props.push((field.to_string(), AmfValue::Number(0.0)));
                }
            }
        }
    }

    let mut out = BytesMut::new();
    for value in &values {
        encode(&mut out, value);
    }
    Ok(out.freeze())
}

/// Decode every AMF0 value in the buffer.
pub fn decode_all(buf: &mut Bytes) -> Result<Vec<AmfValue>> {
    let mut values = Vec::new();
    while buf.has_remaining() {
        values.push(decode_value(buf, 0)?);
    }
    Ok(values)
}

fn decode_value(buf: &mut Bytes, depth: usize) -> Result<AmfValue> {
    if depth > MAX_NESTING_DEPTH {
        return Err(Error::Metadata("nesting too deep".into()));
    }
    if buf.is_empty() {
        return Err(Error::Metadata("unexpected end of data".into()));
    }

    match buf.get_u8() {
        MARKER_NUMBER => {
            ensure(buf, 8)?;
            Ok(AmfValue::Number(buf.get_f64()))
        }
        MARKER_BOOLEAN => {
            ensure(buf, 1)?;
            Ok(AmfValue::Boolean(buf.get_u8() != 0))
        }
        MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
        MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
        MARKER_OBJECT => Ok(AmfValue::Object(read_properties(buf, depth)?)),
        MARKER_ECMA_ARRAY => {
            // The leading count is a hint; properties still end with the
            // object-end sequence.
            ensure(buf, 4)?;
            let _count = buf.get_u32();
            Ok(AmfValue::EcmaArray(read_properties(buf, depth)?))
        }
        MARKER_STRICT_ARRAY => {
            ensure(buf, 4)?;
            let count = buf.get_u32() as usize;
            let mut elements = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                elements.push(decode_value(buf, depth + 1)?);
            }
            Ok(AmfValue::StrictArray(elements))
        }
        MARKER_DATE => {
            ensure(buf, 10)?;
            let millis = buf.get_f64();
            let _timezone = buf.get_i16();
            Ok(AmfValue::Date(millis))
        }
        MARKER_NULL => Ok(AmfValue::Null),
        MARKER_UNDEFINED => Ok(AmfValue::Undefined),
        marker => Err(Error::Metadata(format!("unsupported marker 0x{marker:02x}"))),
    }
}

fn read_properties(buf: &mut Bytes, depth: usize) -> Result<Vec<(String, AmfValue)>> {
    let mut props = Vec::new();
    loop {
        let key = read_utf8(buf)?;
        if key.is_empty() {
            // Some encoders omit the trailing end marker on the last
            // object; treat exhaustion as the end.
            if buf.is_empty() || buf.get_u8() == MARKER_OBJECT_END {
                break;
            }
            return Err(Error::Metadata("missing object end marker".into()));
        }
        props.push((key, decode_value(buf, depth + 1)?));
    }
    Ok(props)
}

fn read_utf8(buf: &mut Bytes) -> Result<String> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| Error::Metadata(e.to_string()))
}

fn read_utf8_long(buf: &mut Bytes) -> Result<String> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| Error::Metadata(e.to_string()))
}

fn ensure(buf: &Bytes, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::Metadata("unexpected end of data".into()));
    }
    Ok(())
}

fn encode(buf: &mut BytesMut, value: &AmfValue) {
    match value {
        AmfValue::Number(n) => {
            buf.put_u8(MARKER_NUMBER);
            buf.put_f64(*n);
        }
        AmfValue::Boolean(b) => {
            buf.put_u8(MARKER_BOOLEAN);
            buf.put_u8(u8::from(*b));
        }
        AmfValue::String(s) => {
            if s.len() > u16::MAX as usize {
                buf.put_u8(MARKER_LONG_STRING);
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            } else {
                buf.put_u8(MARKER_STRING);
                put_utf8(buf, s);
            }
        }
        AmfValue::Object(props) => {
            buf.put_u8(MARKER_OBJECT);
            put_properties(buf, props);
        }
        AmfValue::EcmaArray(props) => {
            buf.put_u8(MARKER_ECMA_ARRAY);
            buf.put_u32(props.len() as u32);
            put_properties(buf, props);
        }
        AmfValue::StrictArray(elements) => {
            buf.put_u8(MARKER_STRICT_ARRAY);
            buf.put_u32(elements.len() as u32);
            for element in elements {
                encode(buf, element);
            }
        }
        AmfValue::Date(millis) => {
            buf.put_u8(MARKER_DATE);
            buf.put_f64(*millis);
            buf.put_i16(0);
        }
        AmfValue::Null => buf.put_u8(MARKER_NULL),
        AmfValue::Undefined => buf.put_u8(MARKER_UNDEFINED),
    }
}

fn put_properties(buf: &mut BytesMut, props: &[(String, AmfValue)]) {
    for (key, value) in props {
        put_utf8(buf, key);
        encode(buf, value);
    }
    buf.put_u16(0);
    buf.put_u8(MARKER_OBJECT_END);
}

fn put_utf8(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}
