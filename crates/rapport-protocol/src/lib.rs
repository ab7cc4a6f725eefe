//! # rapport-protocol
//!
//! Wire protocol definitions for Rapport.
//!
//! This crate defines the binary protocol spoken over a Rapport WebSocket:
//! frame types, the codec, error codes and versioning.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake
//! - `Subscribe` / `Unsubscribe` - Scope membership
//! - `Like` / `Accept` / `Reject` / `Withdraw` - Match requests
//! - `Send` / `History` / `MarkRead` / `Typing` - Conversations
//! - `Sync` / `SyncState` / `Resync` - Reconnect recovery
//! - `Event` - Pushed changes
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use rapport_protocol::{codec, Frame};
//!
//! let frame = Frame::connect("alice");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod errors;
pub mod frames;
pub mod version;

pub use codec::{decode, decode_from, encode, encode_into, ProtocolError, MAX_FRAME_SIZE};
pub use errors::ErrorCode;
pub use frames::{Frame, FrameType, InboxEntry};
pub use version::{Version, PROTOCOL_VERSION};
