#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use roomcast_domain::{Message, MessageId, Room, RoomId, UserProfile};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding inbound or encoding outbound frames.
#[derive(Debug, Error)]
pub enum EnvelopeError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("invalid envelope: {0}")]
	Json(#[from] serde_json::Error),
}

/// Inbound client action, dispatched by the `type` tag.
///
/// The set is closed: an unknown tag is a recoverable decode error, never a
/// silent no-op.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientAction {
	/// Create a room and immediately join it under the same `request_id`.
	/// Only valid before the connection has joined a room.
	Create {
		request_id: String,
		#[serde(default)]
		name: Option<String>,
		#[serde(default)]
		is_private: bool,
		#[serde(default)]
		is_group: bool,
	},

	/// Register a correlation-scoped live subscription to a room.
	JoinRoom { request_id: String, pk: RoomId },

	/// Revoke a subscription: the exact `(request_id, room)` pair when a
	/// `request_id` is given, every pair for the room otherwise.
	LeaveRoom {
		pk: RoomId,
		#[serde(default)]
		request_id: Option<String>,
	},

	/// Persist a message into an explicitly named room.
	CreateMessage { pk: RoomId, message: String },

	/// Persist a message into the connection's path room.
	ChatMessage { message: String },

	/// Replay full history, to the requesting connection only.
	GetMessages {
		#[serde(default)]
		pk: Option<RoomId>,
	},
}

/// Outbound server envelope, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	ChatMessage {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		request_id: Option<String>,
		message: MessageView,
	},

	MessageHistory { messages: Vec<MessageView> },

	Notification {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		request_id: Option<String>,
		#[serde(flatten)]
		body: NotificationBody,
	},

	/// Recoverable per-message error; never closes the connection.
	Error { message: String },
}

/// Payload of a `notification` envelope, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationBody {
	RoomCreated { room: RoomView },
	MemberAdded { pk: RoomId, user: UserView },
	MemberRemoved { pk: RoomId, user: UserView },
}

/// Serialized identity: `{ id, email, username }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserView {
	pub id: i64,
	pub email: String,
	pub username: String,
}

impl From<&UserProfile> for UserView {
	fn from(profile: &UserProfile) -> Self {
		Self {
			id: profile.id.as_i64(),
			email: profile.email.clone(),
			username: profile.username.clone(),
		}
	}
}

/// Serialized message. The field set is fixed for client compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
	pub id: i64,
	pub room: i64,
	pub user: UserView,
	pub text: String,
	/// ISO-8601 creation timestamp.
	pub created_at: String,
	/// Human-formatted creation timestamp (`%d-%m-%Y %H:%M:%S`).
	pub created_at_formatted: String,
}

impl From<&Message> for MessageView {
	fn from(msg: &Message) -> Self {
		let created = DateTime::<Utc>::from_timestamp_millis(msg.created_at).unwrap_or(DateTime::UNIX_EPOCH);

		Self {
			id: msg.id.as_i64(),
			room: msg.room.as_i64(),
			user: UserView::from(&msg.author),
			text: msg.text.clone(),
			created_at: created.to_rfc3339_opts(SecondsFormat::Micros, true),
			created_at_formatted: created.format("%d-%m-%Y %H:%M:%S").to_string(),
		}
	}
}

impl MessageView {
	pub fn message_id(&self) -> MessageId {
		MessageId::new(self.id)
	}
}

/// Serialized room. The field set is fixed for client compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomView {
	pub pk: i64,
	pub name: Option<String>,
	pub messages: Vec<MessageView>,
	pub current_users: Vec<UserView>,
	pub last_message: Option<MessageView>,
	pub creator: UserView,
	pub is_private: bool,
	pub is_group: bool,
}

impl RoomView {
	/// Assemble a room view from the room row and its loaded relations.
	/// `messages` must already be in creation order.
	pub fn new(room: &Room, creator: &UserProfile, current_users: &[UserProfile], messages: Vec<MessageView>) -> Self {
		let last_message = messages.last().cloned();

		Self {
			pk: room.id.as_i64(),
			name: room.name.clone(),
			last_message,
			messages,
			current_users: current_users.iter().map(UserView::from).collect(),
			creator: UserView::from(creator),
			is_private: room.is_private,
			is_group: room.is_group,
		}
	}
}

/// Decode an inbound text frame, enforcing the frame-size cap before parsing.
pub fn decode_client_frame(text: &str, max_frame_size: usize) -> Result<ClientAction, EnvelopeError> {
	if text.len() > max_frame_size {
		return Err(EnvelopeError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	Ok(serde_json::from_str(text)?)
}

/// Encode an outbound envelope as a JSON text frame.
pub fn encode_server_frame(event: &ServerEvent) -> Result<String, EnvelopeError> {
	Ok(serde_json::to_string(event)?)
}
