#![forbid(unsafe_code)]

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::Json;
use roomcast_domain::{Identity, Room, RoomId, UserId, UserProfile};
use roomcast_protocol::{MessageView, RoomView, UserView};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::server::store::{Store, StoreError};
use crate::server::{AppState, access, auth};

/// The request-response boundary: registration, token issue, room CRUD,
/// membership management, and history/send over plain HTTP. These handlers
/// are the sole writers of user records and go through the same gateway as
/// the live protocol, so both surfaces observe one consistent store.
pub fn router() -> Router<AppState> {
	Router::new()
		.route("/register", post(register))
		.route("/token", post(token))
		.route("/users", get(user_list))
		.route("/rooms", get(room_list).post(create_room))
		.route("/rooms/{pk}/members", patch(add_members))
		.route("/rooms/{pk}/messages", get(room_messages).post(send_message))
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
	#[error("authentication required")]
	Unauthorized,

	#[error("{0}")]
	Forbidden(String),

	#[error("{0}")]
	Validation(String),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("password hashing failed")]
	Bcrypt(#[from] bcrypt::BcryptError),
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let (status, message) = match &self {
			ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
			ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
			ApiError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
			ApiError::Store(StoreError::RoomNotFound) | ApiError::Store(StoreError::UserNotFound) => {
				(StatusCode::NOT_FOUND, self.to_string())
			}
			ApiError::Store(StoreError::Database(e)) => {
				error!(error = %e, "storage error while handling request");
				(StatusCode::INTERNAL_SERVER_ERROR, "storage temporarily unavailable".to_string())
			}
			ApiError::Store(_) => (StatusCode::BAD_REQUEST, self.to_string()),
			ApiError::Bcrypt(e) => {
				error!(error = %e, "bcrypt failure");
				(StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
			}
		};

		(status, Json(json!({ "status": "error", "message": message }))).into_response()
	}
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
	headers
		.get(header::AUTHORIZATION)?
		.to_str()
		.ok()?
		.strip_prefix("Bearer ")
		.map(str::trim)
		.map(str::to_string)
}

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<UserProfile, ApiError> {
	let token = bearer_token(headers);
	let identity = auth::resolve_identity(
		&state.store,
		token.as_deref(),
		state.settings.auth_hmac_secret.expose(),
	)
	.await;

	identity.user().cloned().ok_or(ApiError::Unauthorized)
}

/// Assemble the full serialized room, relations included.
pub(crate) async fn build_room_view(store: &Store, room: &Room) -> Result<RoomView, StoreError> {
	let creator = store.get_user(room.creator).await?;
	let users = store.room_member_profiles(room.id).await?;
	let messages = store.list_messages(room.id).await?.iter().map(MessageView::from).collect();

	Ok(RoomView::new(room, &creator, &users, messages))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
	email: String,
	username: String,
	password: String,
}

async fn register(State(state): State<AppState>, Json(req): Json<RegisterRequest>) -> Result<Response, ApiError> {
	let email = req.email.trim();
	let username = req.username.trim();

	if email.is_empty() || !email.contains('@') {
		return Err(ApiError::Validation("a valid email address is required".to_string()));
	}
	if username.is_empty() {
		return Err(ApiError::Validation("username must not be empty".to_string()));
	}
	if req.password.is_empty() {
		return Err(ApiError::Validation("password must not be empty".to_string()));
	}

	let password_hash = bcrypt::hash(&req.password, bcrypt::DEFAULT_COST)?;
	let user = state.store.create_user(email, username, &password_hash).await?;

	metrics::counter!("roomcast_server_users_registered_total").increment(1);

	Ok((
		StatusCode::CREATED,
		Json(json!({
			"status": "success",
			"message": "User created successfully",
			"user": UserView::from(&user),
		})),
	)
		.into_response())
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
	email: String,
	password: String,
}

async fn token(State(state): State<AppState>, Json(req): Json<TokenRequest>) -> Result<Response, ApiError> {
	let (user, password_hash) = match state.store.user_by_email(req.email.trim()).await {
		Ok(found) => found,
		Err(StoreError::UserNotFound) => return Err(ApiError::Unauthorized),
		Err(e) => return Err(e.into()),
	};

	if !bcrypt::verify(&req.password, &password_hash)? {
		return Err(ApiError::Unauthorized);
	}

	let token = auth::issue_token(
		user.id,
		state.settings.auth_hmac_secret.expose(),
		state.settings.token_ttl,
	);

	Ok(Json(json!({
		"status": "success",
		"token": token,
		"user": UserView::from(&user),
	}))
	.into_response())
}

async fn user_list(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
	require_user(&state, &headers).await?;

	let users = state.store.list_users().await?;
	let users = users.iter().map(UserView::from).collect::<Vec<_>>();

	Ok(Json(json!({ "status": "success", "users": users })).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
	#[serde(default)]
	name: Option<String>,
	#[serde(default)]
	is_private: bool,
	#[serde(default)]
	is_group: bool,
}

async fn create_room(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<CreateRoomRequest>,
) -> Result<Response, ApiError> {
	let user = require_user(&state, &headers).await?;

	let room = state
		.store
		.create_room(req.name.as_deref(), req.is_private, req.is_group, user.id)
		.await?;
	let view = build_room_view(&state.store, &room).await?;

	Ok((
		StatusCode::CREATED,
		Json(json!({
			"status": "success",
			"message": "Room created",
			"room": view,
		})),
	)
		.into_response())
}

async fn room_list(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
	let user = require_user(&state, &headers).await?;

	let rooms = state.store.rooms_created_by(user.id).await?;
	let mut views = Vec::with_capacity(rooms.len());
	for room in &rooms {
		views.push(build_room_view(&state.store, room).await?);
	}

	Ok(Json(json!({ "status": "success", "rooms": views })).into_response())
}

#[derive(Debug, Deserialize)]
struct AddUsersRequest {
	user_ids: Vec<i64>,
}

async fn add_members(
	State(state): State<AppState>,
	Path(pk): Path<i64>,
	headers: HeaderMap,
	Json(req): Json<AddUsersRequest>,
) -> Result<Response, ApiError> {
	let user = require_user(&state, &headers).await?;
	let room = state.store.get_room(RoomId::new(pk)).await?;

	if room.creator != user.id {
		return Err(ApiError::Forbidden("only the creator can add new users".to_string()));
	}
	if req.user_ids.is_empty() {
		return Err(ApiError::Validation("user_ids must not be empty".to_string()));
	}

	// Validate every id before mutating anything.
	let ids = req.user_ids.iter().map(|id| UserId::new(*id)).collect::<Vec<_>>();
	let missing = state.store.missing_users(&ids).await?;
	if !missing.is_empty() {
		let missing = missing.iter().map(|id| id.as_i64().to_string()).collect::<Vec<_>>();
		return Err(ApiError::Validation(format!(
			"user(s) with id(s) {} do not exist",
			missing.join(", ")
		)));
	}

	let mut added = Vec::new();
	for id in ids {
		if state.store.add_member(room.id, id).await? {
			added.push(state.store.get_user(id).await?.username);
		}
	}

	Ok(Json(json!({
		"status": "success",
		"message": format!("Added users {} to the room", added.join(", ")),
	}))
	.into_response())
}

async fn room_messages(State(state): State<AppState>, Path(pk): Path<i64>, headers: HeaderMap) -> Result<Response, ApiError> {
	let user = require_user(&state, &headers).await?;
	let room = state.store.get_room(RoomId::new(pk)).await?;

	if !access::can_access(&Identity::User(user), &room) {
		return Err(ApiError::Forbidden("not a member of this room".to_string()));
	}

	let messages = state.store.list_messages(room.id).await?;
	let messages = messages.iter().map(MessageView::from).collect::<Vec<_>>();

	Ok(Json(json!({ "status": "success", "messages": messages })).into_response())
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
	message: String,
}

async fn send_message(
	State(state): State<AppState>,
	Path(pk): Path<i64>,
	headers: HeaderMap,
	Json(req): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
	let user = require_user(&state, &headers).await?;
	let room = state.store.get_room(RoomId::new(pk)).await?;

	if !access::can_send(&Identity::User(user.clone()), &room) {
		return Err(ApiError::Forbidden("not a member of this room".to_string()));
	}

	// Same gateway primitive as the live protocol, so the change event
	// reaches ws subscribers exactly as an in-session send would.
	let message = state.store.create_message(room.id, user.id, &req.message).await?;

	Ok((
		StatusCode::CREATED,
		Json(json!({
			"status": "success",
			"message": MessageView::from(&message),
		})),
	)
		.into_response())
}
