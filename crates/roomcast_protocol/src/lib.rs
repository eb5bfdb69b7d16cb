#![forbid(unsafe_code)]

pub mod envelope;

pub use envelope::{
	ClientAction, EnvelopeError, MessageView, NotificationBody, RoomView, ServerEvent, UserView, decode_client_frame,
	encode_server_frame,
};

/// Default maximum inbound frame size in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;
}
