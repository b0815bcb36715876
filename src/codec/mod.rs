//! Codecs for persisting client-side state.
//!
//! Nothing here touches the SysEx wire; the device speaks its own byte
//! format (see [`crate::protocol`]). These codecs serialize catalog
//! snapshots and configuration:
//!
//! - [`MsgPackCodec`] - compact MessagePack via `rmp-serde`
//! - [`JsonCodec`] - human-readable JSON via `serde_json`
//!
//! # Example
//!
//! ```
//! use k2_client::codec::{JsonCodec, MsgPackCodec};
//! use k2_client::message::ObjectKind;
//!
//! let packed = MsgPackCodec::encode(&ObjectKind::Program).unwrap();
//! let kind: ObjectKind = MsgPackCodec::decode(&packed).unwrap();
//! assert_eq!(kind, ObjectKind::Program);
//!
//! let text = JsonCodec::encode(&kind).unwrap();
//! assert_eq!(JsonCodec::decode::<ObjectKind>(&text).unwrap(), kind);
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;
