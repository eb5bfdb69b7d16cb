#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and group names from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid numeric id: {0}")]
	InvalidId(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! numeric_id {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(i64);

		impl $name {
			pub const fn new(id: i64) -> Self {
				Self(id)
			}

			pub const fn as_i64(self) -> i64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				s.parse::<i64>()
					.map(Self)
					.map_err(|_| ParseIdError::InvalidId(s.to_string()))
			}
		}
	};
}

numeric_id! {
	/// Storage-assigned user identifier.
	UserId
}

numeric_id! {
	/// Storage-assigned room identifier.
	RoomId
}

numeric_id! {
	/// Storage-assigned message identifier.
	MessageId
}

/// Identity view carried on messages and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: UserId,
	pub email: String,
	pub username: String,
}

/// A resolved connection identity.
///
/// `Anonymous` is a distinguished sentinel: it is never authorized for room
/// access, and resolving a bad token yields it instead of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
	Anonymous,
	User(UserProfile),
}

impl Identity {
	pub fn is_anonymous(&self) -> bool {
		matches!(self, Identity::Anonymous)
	}

	pub fn user(&self) -> Option<&UserProfile> {
		match self {
			Identity::Anonymous => None,
			Identity::User(profile) => Some(profile),
		}
	}

	pub fn user_id(&self) -> Option<UserId> {
		self.user().map(|u| u.id)
	}
}

/// Maximum member count of a private, non-group room.
pub const PRIVATE_ROOM_CAPACITY: usize = 2;

/// A chat room with its current member set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
	pub id: RoomId,
	pub name: Option<String>,
	pub creator: UserId,
	pub is_private: bool,
	pub is_group: bool,
	pub members: Vec<UserId>,
}

impl Room {
	pub fn is_member(&self, user: UserId) -> bool {
		self.members.contains(&user)
	}

	/// Whether the private-room capacity applies to this room.
	pub fn is_capped(&self) -> bool {
		self.is_private && !self.is_group
	}
}

/// A persisted chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub id: MessageId,
	pub room: RoomId,
	pub author: UserProfile,
	pub text: String,
	/// Assigned at persistence time, unix milliseconds.
	pub created_at: i64,
}

/// A named broadcast channel.
///
/// Two families exist: per-room messaging groups and per-user notification
/// groups. The string forms (`room__{id}`, `user__{id}`) are stable and
/// round-trip through [`Group::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {
	Room(RoomId),
	User(UserId),
}

impl Group {
	pub const ROOM_PREFIX: &'static str = "room__";
	pub const USER_PREFIX: &'static str = "user__";

	pub const fn room(id: RoomId) -> Self {
		Group::Room(id)
	}

	pub const fn user(id: UserId) -> Self {
		Group::User(id)
	}

	/// Parse a group name of the form `room__{id}` or `user__{id}`.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		if let Some(rest) = s.strip_prefix(Self::ROOM_PREFIX) {
			return Ok(Group::Room(rest.parse()?));
		}
		if let Some(rest) = s.strip_prefix(Self::USER_PREFIX) {
			return Ok(Group::User(rest.parse()?));
		}

		Err(ParseIdError::InvalidFormat(format!(
			"expected room__{{id}} or user__{{id}}, got {s:?}"
		)))
	}
}

impl fmt::Display for Group {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Group::Room(id) => write!(f, "{}{}", Self::ROOM_PREFIX, id),
			Group::User(id) => write!(f, "{}{}", Self::USER_PREFIX, id),
		}
	}
}

impl FromStr for Group {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Group::parse(s)
	}
}

/// A typed event raised after a successful durable write.
///
/// Carries enough of the written entity to determine the affected broadcast
/// groups and to build the outbound view without another storage read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
	MessageCreated(Message),
	MemberAdded { room: RoomId, user: UserProfile },
	MemberRemoved { room: RoomId, user: UserProfile },
}

impl ChangeEvent {
	/// Groups interested in this change.
	///
	/// A message affects its room group; a membership change affects the
	/// room group and the affected user's notification group.
	pub fn affected_groups(&self) -> Vec<Group> {
		match self {
			ChangeEvent::MessageCreated(msg) => vec![Group::room(msg.room)],
			ChangeEvent::MemberAdded { room, user } | ChangeEvent::MemberRemoved { room, user } => {
				vec![Group::room(*room), Group::user(user.id)]
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn numeric_id_parse_and_display() {
		assert_eq!("42".parse::<RoomId>().unwrap(), RoomId::new(42));
		assert_eq!(UserId::new(7).to_string(), "7");
		assert!("".parse::<UserId>().is_err());
		assert!("abc".parse::<MessageId>().is_err());
	}

	#[test]
	fn group_format_parse_roundtrip() {
		let g = Group::room(RoomId::new(3));
		assert_eq!(g.to_string(), "room__3");
		assert_eq!(Group::parse("room__3").unwrap(), g);

		let g = Group::user(UserId::new(12));
		assert_eq!(g.to_string(), "user__12");
		assert_eq!("user__12".parse::<Group>().unwrap(), g);
	}

	#[test]
	fn group_parse_rejects_malformed() {
		assert!(Group::parse("").is_err());
		assert!(Group::parse("room_3").is_err());
		assert!(Group::parse("room__").is_err());
		assert!(Group::parse("room__abc").is_err());
		assert!(Group::parse("channel__1").is_err());
	}

	#[test]
	fn anonymous_identity_has_no_user() {
		assert!(Identity::Anonymous.is_anonymous());
		assert_eq!(Identity::Anonymous.user_id(), None);

		let identity = Identity::User(UserProfile {
			id: UserId::new(1),
			email: "a@example.com".to_string(),
			username: "a".to_string(),
		});
		assert!(!identity.is_anonymous());
		assert_eq!(identity.user_id(), Some(UserId::new(1)));
	}

	#[test]
	fn message_change_affects_room_group_only() {
		let msg = Message {
			id: MessageId::new(1),
			room: RoomId::new(5),
			author: UserProfile {
				id: UserId::new(2),
				email: "b@example.com".to_string(),
				username: "b".to_string(),
			},
			text: "hi".to_string(),
			created_at: 0,
		};

		assert_eq!(
			ChangeEvent::MessageCreated(msg).affected_groups(),
			vec![Group::room(RoomId::new(5))]
		);
	}

	#[test]
	fn membership_change_affects_room_and_user_groups() {
		let user = UserProfile {
			id: UserId::new(9),
			email: "c@example.com".to_string(),
			username: "c".to_string(),
		};
		let groups = ChangeEvent::MemberAdded {
			room: RoomId::new(4),
			user,
		}
		.affected_groups();

		assert_eq!(groups, vec![Group::room(RoomId::new(4)), Group::user(UserId::new(9))]);
	}

	#[test]
	fn private_room_capacity_applies_to_private_non_group_only() {
		let mut room = Room {
			id: RoomId::new(1),
			name: None,
			creator: UserId::new(1),
			is_private: true,
			is_group: false,
			members: vec![UserId::new(1)],
		};
		assert!(room.is_capped());

		room.is_group = true;
		assert!(!room.is_capped());

		room.is_group = false;
		room.is_private = false;
		assert!(!room.is_capped());
	}
}
