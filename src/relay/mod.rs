//! Upstream relays

pub mod static_push;

pub use static_push::{StaticPush, StaticPushRegistry, UplinkConnector, UplinkSession};
