#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use roomcast_domain::{Group, Identity, RoomId, UserProfile};
use roomcast_protocol::{
	ClientAction, MessageView, NotificationBody, RoomView, ServerEvent, decode_client_frame, encode_server_frame,
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::SecretString;
use crate::server::store::StoreError;
use crate::server::{AppState, access, auth};

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Maximum inbound frame size in bytes.
	pub max_frame_bytes: usize,

	pub auth_hmac_secret: SecretString,
	pub token_ttl: Duration,
}

/// Connection phases. `create` is only accepted pre-join; everything else
/// room-scoped is accepted in either phase with per-action authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Authenticated,
	Joined,
}

struct ConnContext {
	conn_id: u64,
	identity: Identity,
	path_room: Option<RoomId>,
	phase: Phase,
}

/// Recoverable per-action failures, surfaced as `error` envelopes.
#[derive(Debug, thiserror::Error)]
enum ActionError {
	#[error("{0}")]
	Invalid(String),

	#[error(transparent)]
	Store(#[from] StoreError),
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> u64 {
	NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
	pub token: Option<String>,
}

/// Room messaging endpoint: `GET /ws/chat/{room_id}?token=...`.
///
/// Handshake-phase failures (anonymous identity, unknown room, missing
/// authorization) reject the upgrade outright: the connection is closed
/// with no payload and no history.
pub async fn chat_ws(
	State(state): State<AppState>,
	Path(room_id): Path<i64>,
	Query(query): Query<TokenQuery>,
	ws: WebSocketUpgrade,
) -> Response {
	let identity = auth::resolve_identity(
		&state.store,
		query.token.as_deref(),
		state.settings.auth_hmac_secret.expose(),
	)
	.await;

	if identity.is_anonymous() {
		metrics::counter!("roomcast_server_handshake_rejected_total").increment(1);
		warn!(room_id, "rejecting room connection: anonymous identity");
		return StatusCode::UNAUTHORIZED.into_response();
	}

	let room = match state.store.get_room(RoomId::new(room_id)).await {
		Ok(room) => room,
		Err(StoreError::RoomNotFound) => {
			metrics::counter!("roomcast_server_handshake_rejected_total").increment(1);
			warn!(room_id, "rejecting room connection: room not found");
			return StatusCode::NOT_FOUND.into_response();
		}
		Err(e) => {
			error!(room_id, error = %e, "failed to load room during handshake");
			return StatusCode::INTERNAL_SERVER_ERROR.into_response();
		}
	};

	if !access::can_join(&identity, &room) {
		metrics::counter!("roomcast_server_handshake_rejected_total").increment(1);
		warn!(room_id, "rejecting room connection: not authorized");
		return StatusCode::FORBIDDEN.into_response();
	}

	ws.on_upgrade(move |socket| handle_socket(socket, state, identity, Some(room.id)))
}

/// User-notification endpoint: `GET /ws/notifications?token=...`.
///
/// Scoped to the caller's own identity; carries out-of-band alerts
/// unrelated to a specific room. Also accepts the pre-join action set.
pub async fn notifications_ws(State(state): State<AppState>, Query(query): Query<TokenQuery>, ws: WebSocketUpgrade) -> Response {
	let identity = auth::resolve_identity(
		&state.store,
		query.token.as_deref(),
		state.settings.auth_hmac_secret.expose(),
	)
	.await;

	if identity.is_anonymous() {
		metrics::counter!("roomcast_server_handshake_rejected_total").increment(1);
		warn!("rejecting notification connection: anonymous identity");
		return StatusCode::UNAUTHORIZED.into_response();
	}

	ws.on_upgrade(move |socket| handle_socket(socket, state, identity, None))
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity, path_room: Option<RoomId>) {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("roomcast_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("roomcast_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;
	metrics::counter!("roomcast_server_connections_total").increment(1);

	let conn_id = next_conn_id();
	info!(
		conn_id,
		user = identity.user().map(|u| u.username.as_str()).unwrap_or("<anonymous>"),
		room = path_room.map(|r| r.as_i64()).unwrap_or(-1),
		"connection established"
	);

	let mut outbound = state.hub.register_conn(conn_id).await;
	let (mut ws_tx, mut ws_rx) = socket.split();

	let writer = tokio::spawn(async move {
		while let Some(event) = outbound.recv().await {
			let text = match encode_server_frame(&event) {
				Ok(text) => text,
				Err(e) => {
					error!(error = %e, "failed to encode outbound frame");
					continue;
				}
			};

			metrics::counter!("roomcast_server_frames_out_total").increment(1);
			if ws_tx.send(Message::Text(text.into())).await.is_err() {
				break;
			}
		}
	});

	let mut conn = ConnContext {
		conn_id,
		identity,
		path_room,
		phase: if path_room.is_some() {
			Phase::Joined
		} else {
			Phase::Authenticated
		},
	};

	// Path-room connections enter the broadcast group immediately and get
	// the initial history replay; notification connections enter their own
	// user group instead.
	if let Some(room_id) = conn.path_room {
		state.hub.join(Group::room(room_id), conn_id).await;
		if let Err(e) = send_history(&state, conn_id, room_id).await {
			state.hub.send_to(conn_id, error_event(conn_id, e.into())).await;
		}
	} else if let Some(user_id) = conn.identity.user_id() {
		state.hub.join(Group::user(user_id), conn_id).await;
	}

	while let Some(frame) = ws_rx.next().await {
		let msg = match frame {
			Ok(msg) => msg,
			Err(e) => {
				debug!(conn_id, error = %e, "websocket receive error");
				break;
			}
		};

		match msg {
			Message::Text(text) => {
				metrics::counter!("roomcast_server_frames_in_total").increment(1);

				let action = match decode_client_frame(text.as_str(), state.settings.max_frame_bytes) {
					Ok(action) => action,
					Err(e) => {
						metrics::counter!("roomcast_server_invalid_frames_total").increment(1);
						state
							.hub
							.send_to(conn_id, ServerEvent::Error { message: e.to_string() })
							.await;
						continue;
					}
				};

				metrics::counter!("roomcast_server_actions_total").increment(1);
				if let Err(e) = dispatch(&state, &mut conn, action).await {
					metrics::counter!("roomcast_server_action_errors_total").increment(1);
					state.hub.send_to(conn_id, error_event(conn_id, e)).await;
				}
			}
			Message::Binary(_) => {
				state
					.hub
					.send_to(
						conn_id,
						ServerEvent::Error {
							message: "binary frames are not supported".to_string(),
						},
					)
					.await;
			}
			Message::Ping(_) | Message::Pong(_) => {}
			Message::Close(_) => break,
		}
	}

	// Teardown: registry subscriptions drop before the fabric releases the
	// group memberships, so no dispatch can target this connection once
	// teardown has begun.
	{
		let mut subs = state.subs.write().await;
		subs.remove_conn(conn_id);
	}
	state.hub.remove_conn(conn_id).await;

	let _ = writer.await;
	info!(conn_id, "connection closed");
}

async fn dispatch(state: &AppState, conn: &mut ConnContext, action: ClientAction) -> Result<(), ActionError> {
	match action {
		ClientAction::Create {
			request_id,
			name,
			is_private,
			is_group,
		} => handle_create(state, conn, request_id, name, is_private, is_group).await,
		ClientAction::JoinRoom { request_id, pk } => handle_join_room(state, conn, request_id, pk).await,
		ClientAction::LeaveRoom { pk, request_id } => handle_leave_room(state, conn, pk, request_id).await,
		ClientAction::CreateMessage { pk, message } => handle_create_message(state, conn, pk, &message).await,
		ClientAction::ChatMessage { message } => {
			let room = conn.path_room.ok_or_else(|| {
				ActionError::Invalid("no room bound to this connection; use create_message with a pk".to_string())
			})?;
			handle_create_message(state, conn, room, &message).await
		}
		ClientAction::GetMessages { pk } => handle_get_messages(state, conn, pk).await,
	}
}

async fn handle_create(
	state: &AppState,
	conn: &mut ConnContext,
	request_id: String,
	name: Option<String>,
	is_private: bool,
	is_group: bool,
) -> Result<(), ActionError> {
	if conn.phase == Phase::Joined {
		return Err(ActionError::Invalid(
			"create is only valid before joining a room".to_string(),
		));
	}

	let user = require_user(conn)?;
	let room = state
		.store
		.create_room(name.as_deref(), is_private, is_group, user.id)
		.await?;

	// The creator joins the new room under the same correlation id.
	{
		let mut subs = state.subs.write().await;
		subs.subscribe(conn.conn_id, &request_id, Group::room(room.id));
	}
	state.hub.join(Group::room(room.id), conn.conn_id).await;
	conn.phase = Phase::Joined;

	let view = RoomView::new(&room, &user, std::slice::from_ref(&user), Vec::new());
	state
		.hub
		.send_to(
			conn.conn_id,
			ServerEvent::Notification {
				request_id: Some(request_id),
				body: NotificationBody::RoomCreated { room: view },
			},
		)
		.await;

	Ok(())
}

async fn handle_join_room(state: &AppState, conn: &mut ConnContext, request_id: String, pk: RoomId) -> Result<(), ActionError> {
	let user = require_user(conn)?;

	let room = state.store.get_room(pk).await?;
	if !access::can_join(&conn.identity, &room) {
		metrics::counter!("roomcast_server_unauthorized_actions_total").increment(1);
		return Err(ActionError::Invalid(format!("not authorized to join room {pk}")));
	}

	state.store.add_member(pk, user.id).await?;

	{
		let mut subs = state.subs.write().await;
		subs.subscribe(conn.conn_id, &request_id, Group::room(pk));
	}
	state.hub.join(Group::room(pk), conn.conn_id).await;
	conn.phase = Phase::Joined;

	Ok(())
}

async fn handle_leave_room(
	state: &AppState,
	conn: &mut ConnContext,
	pk: RoomId,
	request_id: Option<String>,
) -> Result<(), ActionError> {
	let user = require_user(conn)?;
	let group = Group::room(pk);

	match request_id {
		// Revoke exactly one subscription pair; the room membership and any
		// other correlation ids stay.
		Some(id) => {
			let remaining = {
				let mut subs = state.subs.write().await;
				subs.unsubscribe(conn.conn_id, &id, &group);
				subs.ids_for(&group, conn.conn_id).len()
			};

			if remaining == 0 && conn.path_room != Some(pk) {
				state.hub.leave(&group, conn.conn_id).await;
			}
		}
		// Full leave: drop every subscription, the broadcast group, and the
		// durable membership.
		None => {
			{
				let mut subs = state.subs.write().await;
				subs.unsubscribe_group(conn.conn_id, &group);
			}
			state.hub.leave(&group, conn.conn_id).await;
			state.store.remove_member(pk, user.id).await?;
		}
	}

	Ok(())
}

async fn handle_create_message(state: &AppState, conn: &ConnContext, pk: RoomId, message: &str) -> Result<(), ActionError> {
	let user = require_user(conn)?;

	// Local reject before touching storage.
	if message.trim().is_empty() {
		return Err(ActionError::Invalid("message text must not be empty".to_string()));
	}

	let room = state.store.get_room(pk).await?;
	if !access::can_send(&conn.identity, &room) {
		metrics::counter!("roomcast_server_unauthorized_actions_total").increment(1);
		return Err(ActionError::Invalid(format!("not authorized to send to room {pk}")));
	}

	// The gateway re-checks membership authoritatively; a rejection here
	// persists nothing and broadcasts nothing.
	state.store.create_message(pk, user.id, message).await?;

	Ok(())
}

async fn handle_get_messages(state: &AppState, conn: &ConnContext, pk: Option<RoomId>) -> Result<(), ActionError> {
	let room_id = pk
		.or(conn.path_room)
		.ok_or_else(|| ActionError::Invalid("no room bound to this connection; pass pk".to_string()))?;

	let room = state.store.get_room(room_id).await?;
	if !access::can_access(&conn.identity, &room) {
		metrics::counter!("roomcast_server_unauthorized_actions_total").increment(1);
		return Err(ActionError::Invalid(format!("not authorized to read room {room_id}")));
	}

	send_history(state, conn.conn_id, room_id).await?;
	Ok(())
}

/// History replay, sent only to the requesting connection.
async fn send_history(state: &AppState, conn_id: u64, room: RoomId) -> Result<(), StoreError> {
	let messages = state.store.list_messages(room).await?;
	let messages = messages.iter().map(MessageView::from).collect();

	state
		.hub
		.send_to(conn_id, ServerEvent::MessageHistory { messages })
		.await;

	Ok(())
}

fn require_user(conn: &ConnContext) -> Result<UserProfile, ActionError> {
	conn.identity
		.user()
		.cloned()
		.ok_or_else(|| ActionError::Invalid("not authenticated".to_string()))
}

/// Map an action failure to a recoverable `error` envelope. Storage-layer
/// faults are logged server-side and surfaced without internals.
fn error_event(conn_id: u64, err: ActionError) -> ServerEvent {
	let message = match &err {
		ActionError::Store(StoreError::Database(e)) => {
			error!(conn_id, error = %e, "storage error while handling action");
			"storage temporarily unavailable".to_string()
		}
		other => other.to_string(),
	};

	ServerEvent::Error { message }
}
