#![forbid(unsafe_code)]

use anyhow::Context as _;
use roomcast_domain::{ChangeEvent, Message, MessageId, PRIVATE_ROOM_CAPACITY, Room, RoomId, UserId, UserProfile};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::broadcast;

use crate::util::time::unix_ms_now;

/// Capacity of the change-event broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Typed gateway failures. Every variant's message is safe to surface to the
/// caller; infrastructure errors are wrapped separately.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("room not found")]
	RoomNotFound,

	#[error("user not found")]
	UserNotFound,

	#[error("email or username already registered")]
	DuplicateUser,

	#[error("room is full")]
	RoomFull,

	#[error("author is not a member of the room")]
	NotAMember,

	#[error("message text must not be empty")]
	EmptyMessage,

	#[error("message text exceeds {max} characters")]
	MessageTooLong { max: usize },

	#[error("storage error")]
	Database(#[from] sqlx::Error),
}

/// The only component that touches durable storage.
///
/// Every successful mutation emits a typed [`ChangeEvent`] on a broadcast
/// channel after the write commits; the change router is the registered
/// listener.
#[derive(Clone)]
pub struct Store {
	pool: SqlitePool,
	changes: broadcast::Sender<ChangeEvent>,
	max_message_chars: usize,
}

impl Store {
	/// Connect to the database and run migrations.
	pub async fn connect(database_url: &str, max_message_chars: usize) -> anyhow::Result<Self> {
		// A shared in-memory database needs a single pooled connection;
		// separate connections would each see an empty database.
		let max_connections = if database_url.contains(":memory:") { 1 } else { 16 };

		let pool = SqlitePoolOptions::new()
			.max_connections(max_connections)
			.connect(database_url)
			.await
			.context("connect sqlite")?;

		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

		Ok(Self {
			pool,
			changes,
			max_message_chars,
		})
	}

	/// Subscribe to change events emitted after successful writes.
	pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
		self.changes.subscribe()
	}

	pub async fn create_user(&self, email: &str, username: &str, password_hash: &str) -> Result<UserProfile, StoreError> {
		let result = sqlx::query("INSERT INTO users (email, username, password_hash, created_at) VALUES (?, ?, ?, ?)")
			.bind(email)
			.bind(username)
			.bind(password_hash)
			.bind(unix_ms_now())
			.execute(&self.pool)
			.await;

		let result = match result {
			Ok(r) => r,
			Err(e) => {
				if e.as_database_error().is_some_and(|db| db.is_unique_violation()) {
					return Err(StoreError::DuplicateUser);
				}
				return Err(e.into());
			}
		};

		Ok(UserProfile {
			id: UserId::new(result.last_insert_rowid()),
			email: email.to_string(),
			username: username.to_string(),
		})
	}

	pub async fn get_user(&self, id: UserId) -> Result<UserProfile, StoreError> {
		let row: Option<(i64, String, String)> = sqlx::query_as("SELECT id, email, username FROM users WHERE id = ?")
			.bind(id.as_i64())
			.fetch_optional(&self.pool)
			.await?;

		row.map(user_profile_from_row).ok_or(StoreError::UserNotFound)
	}

	/// Look up a user with their password hash, for credential checks.
	pub async fn user_by_email(&self, email: &str) -> Result<(UserProfile, String), StoreError> {
		let row: Option<(i64, String, String, String)> =
			sqlx::query_as("SELECT id, email, username, password_hash FROM users WHERE email = ?")
				.bind(email)
				.fetch_optional(&self.pool)
				.await?;

		let (id, email, username, password_hash) = row.ok_or(StoreError::UserNotFound)?;
		Ok((user_profile_from_row((id, email, username)), password_hash))
	}

	pub async fn list_users(&self) -> Result<Vec<UserProfile>, StoreError> {
		let rows: Vec<(i64, String, String)> = sqlx::query_as("SELECT id, email, username FROM users ORDER BY id ASC")
			.fetch_all(&self.pool)
			.await?;

		Ok(rows.into_iter().map(user_profile_from_row).collect())
	}

	/// User ids from `ids` that do not exist, in input order.
	pub async fn missing_users(&self, ids: &[UserId]) -> Result<Vec<UserId>, StoreError> {
		let mut missing = Vec::new();
		for id in ids {
			let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE id = ?")
				.bind(id.as_i64())
				.fetch_optional(&self.pool)
				.await?;
			if found.is_none() {
				missing.push(*id);
			}
		}

		Ok(missing)
	}

	/// Create a room; the creator becomes its first member.
	pub async fn create_room(
		&self,
		name: Option<&str>,
		is_private: bool,
		is_group: bool,
		creator: UserId,
	) -> Result<Room, StoreError> {
		let now = unix_ms_now();
		let mut tx = self.pool.begin().await?;

		let result = sqlx::query("INSERT INTO rooms (name, creator_id, is_private, is_group, created_at) VALUES (?, ?, ?, ?, ?)")
			.bind(name)
			.bind(creator.as_i64())
			.bind(is_private)
			.bind(is_group)
			.bind(now)
			.execute(&mut *tx)
			.await?;
		let room_id = result.last_insert_rowid();

		sqlx::query("INSERT INTO room_members (room_id, user_id, joined_at) VALUES (?, ?, ?)")
			.bind(room_id)
			.bind(creator.as_i64())
			.bind(now)
			.execute(&mut *tx)
			.await?;

		tx.commit().await?;

		metrics::counter!("roomcast_server_rooms_created_total").increment(1);

		Ok(Room {
			id: RoomId::new(room_id),
			name: name.map(str::to_string),
			creator,
			is_private,
			is_group,
			members: vec![creator],
		})
	}

	pub async fn get_room(&self, id: RoomId) -> Result<Room, StoreError> {
		let row: Option<(i64, Option<String>, i64, bool, bool)> =
			sqlx::query_as("SELECT id, name, creator_id, is_private, is_group FROM rooms WHERE id = ?")
				.bind(id.as_i64())
				.fetch_optional(&self.pool)
				.await?;

		let (room_id, name, creator_id, is_private, is_group) = row.ok_or(StoreError::RoomNotFound)?;

		let members: Vec<(i64,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = ? ORDER BY user_id ASC")
			.bind(room_id)
			.fetch_all(&self.pool)
			.await?;

		Ok(Room {
			id: RoomId::new(room_id),
			name,
			creator: UserId::new(creator_id),
			is_private,
			is_group,
			members: members.into_iter().map(|(uid,)| UserId::new(uid)).collect(),
		})
	}

	pub async fn rooms_created_by(&self, creator: UserId) -> Result<Vec<Room>, StoreError> {
		let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM rooms WHERE creator_id = ? ORDER BY id ASC")
			.bind(creator.as_i64())
			.fetch_all(&self.pool)
			.await?;

		let mut rooms = Vec::with_capacity(rows.len());
		for (id,) in rows {
			rooms.push(self.get_room(RoomId::new(id)).await?);
		}

		Ok(rooms)
	}

	/// Current member profiles of a room, in join order.
	pub async fn room_member_profiles(&self, room: RoomId) -> Result<Vec<UserProfile>, StoreError> {
		let rows: Vec<(i64, String, String)> = sqlx::query_as(
			"SELECT u.id, u.email, u.username FROM room_members m \
			JOIN users u ON u.id = m.user_id WHERE m.room_id = ? ORDER BY m.joined_at ASC, u.id ASC",
		)
		.bind(room.as_i64())
		.fetch_all(&self.pool)
		.await?;

		Ok(rows.into_iter().map(user_profile_from_row).collect())
	}

	/// Add a user to a room's current member set.
	///
	/// Idempotent: returns false (and emits nothing) if already a member.
	/// An add that would push a private non-group room past
	/// [`PRIVATE_ROOM_CAPACITY`] is rejected inside the transaction and the
	/// member set is unchanged.
	pub async fn add_member(&self, room: RoomId, user: UserId) -> Result<bool, StoreError> {
		let mut tx = self.pool.begin().await?;

		let row: Option<(bool, bool)> = sqlx::query_as("SELECT is_private, is_group FROM rooms WHERE id = ?")
			.bind(room.as_i64())
			.fetch_optional(&mut *tx)
			.await?;
		let (is_private, is_group) = row.ok_or(StoreError::RoomNotFound)?;

		let existing: Option<(i64,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = ? AND user_id = ?")
			.bind(room.as_i64())
			.bind(user.as_i64())
			.fetch_optional(&mut *tx)
			.await?;
		if existing.is_some() {
			return Ok(false);
		}

		if is_private && !is_group {
			let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM room_members WHERE room_id = ?")
				.bind(room.as_i64())
				.fetch_one(&mut *tx)
				.await?;
			if count as usize >= PRIVATE_ROOM_CAPACITY {
				return Err(StoreError::RoomFull);
			}
		}

		let profile = {
			let row: Option<(i64, String, String)> = sqlx::query_as("SELECT id, email, username FROM users WHERE id = ?")
				.bind(user.as_i64())
				.fetch_optional(&mut *tx)
				.await?;
			row.map(user_profile_from_row).ok_or(StoreError::UserNotFound)?
		};

		sqlx::query("INSERT INTO room_members (room_id, user_id, joined_at) VALUES (?, ?, ?)")
			.bind(room.as_i64())
			.bind(user.as_i64())
			.bind(unix_ms_now())
			.execute(&mut *tx)
			.await?;

		tx.commit().await?;

		self.emit(ChangeEvent::MemberAdded { room, user: profile });
		Ok(true)
	}

	/// Remove a user from a room's current member set. No-op if absent.
	pub async fn remove_member(&self, room: RoomId, user: UserId) -> Result<bool, StoreError> {
		let profile = {
			let row: Option<(i64, String, String)> = sqlx::query_as("SELECT id, email, username FROM users WHERE id = ?")
				.bind(user.as_i64())
				.fetch_optional(&self.pool)
				.await?;
			match row.map(user_profile_from_row) {
				Some(p) => p,
				None => return Ok(false),
			}
		};

		let result = sqlx::query("DELETE FROM room_members WHERE room_id = ? AND user_id = ?")
			.bind(room.as_i64())
			.bind(user.as_i64())
			.execute(&self.pool)
			.await?;

		if result.rows_affected() == 0 {
			return Ok(false);
		}

		self.emit(ChangeEvent::MemberRemoved { room, user: profile });
		Ok(true)
	}

	/// Persist a message.
	///
	/// The creator-or-member check here is authoritative and independent of
	/// any authorization the caller already performed; a rejection persists
	/// nothing and emits nothing.
	pub async fn create_message(&self, room: RoomId, author: UserId, text: &str) -> Result<Message, StoreError> {
		let text = text.trim();
		if text.is_empty() {
			return Err(StoreError::EmptyMessage);
		}
		if text.chars().count() > self.max_message_chars {
			return Err(StoreError::MessageTooLong {
				max: self.max_message_chars,
			});
		}

		let mut tx = self.pool.begin().await?;

		let row: Option<(i64,)> = sqlx::query_as("SELECT creator_id FROM rooms WHERE id = ?")
			.bind(room.as_i64())
			.fetch_optional(&mut *tx)
			.await?;
		let (creator_id,) = row.ok_or(StoreError::RoomNotFound)?;

		if creator_id != author.as_i64() {
			let member: Option<(i64,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = ? AND user_id = ?")
				.bind(room.as_i64())
				.bind(author.as_i64())
				.fetch_optional(&mut *tx)
				.await?;
			if member.is_none() {
				return Err(StoreError::NotAMember);
			}
		}

		let profile = {
			let row: Option<(i64, String, String)> = sqlx::query_as("SELECT id, email, username FROM users WHERE id = ?")
				.bind(author.as_i64())
				.fetch_optional(&mut *tx)
				.await?;
			row.map(user_profile_from_row).ok_or(StoreError::UserNotFound)?
		};

		let created_at = unix_ms_now();
		let result = sqlx::query("INSERT INTO messages (room_id, user_id, text, created_at) VALUES (?, ?, ?, ?)")
			.bind(room.as_i64())
			.bind(author.as_i64())
			.bind(text)
			.bind(created_at)
			.execute(&mut *tx)
			.await?;

		tx.commit().await?;

		metrics::counter!("roomcast_server_messages_created_total").increment(1);

		let message = Message {
			id: MessageId::new(result.last_insert_rowid()),
			room,
			author: profile,
			text: text.to_string(),
			created_at,
		};

		self.emit(ChangeEvent::MessageCreated(message.clone()));
		Ok(message)
	}

	/// Full message history of a room, creation order ascending.
	pub async fn list_messages(&self, room: RoomId) -> Result<Vec<Message>, StoreError> {
		let rows: Vec<(i64, i64, i64, String, String, String, i64)> = sqlx::query_as(
			"SELECT m.id, m.room_id, u.id, u.email, u.username, m.text, m.created_at \
			FROM messages m JOIN users u ON u.id = m.user_id \
			WHERE m.room_id = ? ORDER BY m.created_at ASC, m.id ASC",
		)
		.bind(room.as_i64())
		.fetch_all(&self.pool)
		.await?;

		Ok(rows
			.into_iter()
			.map(|(id, room_id, user_id, email, username, text, created_at)| Message {
				id: MessageId::new(id),
				room: RoomId::new(room_id),
				author: user_profile_from_row((user_id, email, username)),
				text,
				created_at,
			})
			.collect())
	}

	fn emit(&self, event: ChangeEvent) {
		metrics::counter!("roomcast_server_change_events_total").increment(1);
		// No receivers is fine; the router may not be running in tests.
		let _ = self.changes.send(event);
	}
}

fn user_profile_from_row((id, email, username): (i64, String, String)) -> UserProfile {
	UserProfile {
		id: UserId::new(id),
		email,
		username,
	}
}
