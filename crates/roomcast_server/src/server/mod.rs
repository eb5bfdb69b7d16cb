#![forbid(unsafe_code)]

pub mod access;
pub mod api;
pub mod auth;
pub mod connection;
pub mod health;
pub mod room_hub;
pub mod router;
pub mod state;
pub mod store;


#[cfg(test)]
mod router_tests;



use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::server::connection::ConnectionSettings;
use crate::server::health::HealthState;
use crate::server::room_hub::RoomHub;
use crate::server::state::SubscriptionState;
use crate::server::store::Store;

/// Shared handles threaded through every handler.
#[derive(Clone)]
pub struct AppState {
	pub store: Store,
	pub hub: RoomHub,
	pub subs: Arc<RwLock<SubscriptionState>>,
	pub health: HealthState,
	pub settings: ConnectionSettings,
}

/// Assemble the full HTTP/WebSocket router.
pub fn build_router(state: AppState) -> Router {
	Router::new()
		.route("/healthz", get(health::healthz))
		.route("/readyz", get(health::readyz))
		.route("/ws/chat/{room_id}", get(connection::chat_ws))
		.route("/ws/notifications", get(connection::notifications_ws))
		.nest("/api", api::router())
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.with_state(state)
}
