//! AMF0 script-data handling
//!
//! Only the metadata subset lives here; RTMP command AMF parsing is the
//! chunk-layer collaborator's concern.

pub mod metadata;

pub use metadata::{decode_all, metadata_reform, AmfValue, ReformMode};
