#![forbid(unsafe_code)]

use std::sync::Arc;

use roomcast_domain::{ChangeEvent, Group};
use roomcast_protocol::{MessageView, NotificationBody, ServerEvent, UserView};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::server::room_hub::RoomHub;
use crate::server::state::SubscriptionState;
use crate::server::store::Store;

/// Settings for the change router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
	pub debug_log_events: bool,

	pub log_upstream_lag: bool,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			debug_log_events: false,
			log_upstream_lag: true,
		}
	}
}

/// The dispatch half of the subscription registry.
///
/// Consumes the gateway's change-event broadcast and fans each change out
/// through the fabric: the entity view is built once per change, then every
/// member connection of each affected group receives one frame per
/// registered correlation id, or a single untagged frame if it joined the
/// group without registering any. Subscribers appearing after a dispatch
/// began do not see that change.
pub struct ChangeRouter {
	cfg: RouterConfig,
	hub: RoomHub,
	subs: Arc<RwLock<SubscriptionState>>,
	changes: broadcast::Receiver<ChangeEvent>,
}

impl ChangeRouter {
	pub fn new(
		changes: broadcast::Receiver<ChangeEvent>,
		hub: RoomHub,
		subs: Arc<RwLock<SubscriptionState>>,
		cfg: RouterConfig,
	) -> Self {
		Self {
			cfg,
			hub,
			subs,
			changes,
		}
	}

	/// Run the routing loop until the upstream broadcast is closed.
	pub async fn run(mut self) {
		info!("change router started");

		loop {
			let event = match self.changes.recv().await {
				Ok(ev) => ev,
				Err(broadcast::error::RecvError::Lagged(n)) => {
					if self.cfg.log_upstream_lag {
						warn!(
							lagged = n,
							"change router lagged on upstream broadcast; some change events were dropped before routing"
						);
					}
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => {
					info!("change router exiting (upstream change broadcast closed)");
					break;
				}
			};

			self.dispatch(event).await;
		}
	}

	/// Fan one change event out to every interested subscriber.
	pub(crate) async fn dispatch(&self, event: ChangeEvent) {
		let groups = event.affected_groups();

		let dispatched = match &event {
			ChangeEvent::MessageCreated(message) => {
				// Serialized once per change, not once per subscriber.
				let view = MessageView::from(message);

				let mut dispatched = 0usize;
				for group in &groups {
					dispatched += self
						.fan_out(group, |request_id| ServerEvent::ChatMessage {
							request_id,
							message: view.clone(),
						})
						.await;
				}
				dispatched
			}
			ChangeEvent::MemberAdded { room, user } => {
				let body = NotificationBody::MemberAdded {
					pk: *room,
					user: UserView::from(user),
				};
				self.fan_out_notification(&groups, body).await
			}
			ChangeEvent::MemberRemoved { room, user } => {
				let body = NotificationBody::MemberRemoved {
					pk: *room,
					user: UserView::from(user),
				};
				self.fan_out_notification(&groups, body).await
			}
		};

		metrics::counter!("roomcast_server_notifications_dispatched_total").increment(dispatched as u64);

		if self.cfg.debug_log_events {
			debug!(groups = groups.len(), dispatched, "routed change event");
		}
	}

	async fn fan_out_notification(&self, groups: &[Group], body: NotificationBody) -> usize {
		let mut dispatched = 0usize;
		for group in groups {
			dispatched += self
				.fan_out(group, |request_id| ServerEvent::Notification {
					request_id,
					body: body.clone(),
				})
				.await;
		}
		dispatched
	}

	/// Deliver to every member of `group`: one frame per correlation id the
	/// connection registered, or one untagged frame if it registered none.
	/// A failed delivery to one connection never aborts the rest.
	async fn fan_out<F>(&self, group: &Group, make: F) -> usize
	where
		F: Fn(Option<String>) -> ServerEvent,
	{
		let members = self.hub.members(group).await;
		if members.is_empty() {
			return 0;
		}

		let ids_by_conn = {
			let subs = self.subs.read().await;
			members
				.into_iter()
				.map(|conn_id| (conn_id, subs.ids_for(group, conn_id)))
				.collect::<Vec<_>>()
		};

		let mut dispatched = 0usize;
		for (conn_id, ids) in ids_by_conn {
			if ids.is_empty() {
				if self.hub.send_to(conn_id, make(None)).await {
					dispatched += 1;
				}
				continue;
			}

			for request_id in ids {
				if self.hub.send_to(conn_id, make(Some(request_id))).await {
					dispatched += 1;
				}
			}
		}

		dispatched
	}
}

/// Spawn a background task routing the store's change events into the hub.
pub fn spawn_change_router(store: &Store, hub: RoomHub, subs: Arc<RwLock<SubscriptionState>>, cfg: RouterConfig) {
	let router = ChangeRouter::new(store.subscribe_changes(), hub, subs, cfg);

	tokio::spawn(async move {
		router.run().await;
	});
}
