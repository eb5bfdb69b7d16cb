#![forbid(unsafe_code)]

use roomcast_domain::{Identity, Room};

/// Whether `identity` may read or write `room`: the creator and current
/// members may, anonymous identities never may.
///
/// Callers re-evaluate this on every privileged action against a freshly
/// loaded room; membership can change between a join and a later send, so
/// the answer is never cached per-connection.
pub fn can_access(identity: &Identity, room: &Room) -> bool {
	match identity.user() {
		Some(user) => room.creator == user.id || room.is_member(user.id),
		None => false,
	}
}

pub fn can_join(identity: &Identity, room: &Room) -> bool {
	can_access(identity, room)
}

pub fn can_send(identity: &Identity, room: &Room) -> bool {
	can_access(identity, room)
}
