#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use roomcast_domain::Group;
use roomcast_protocol::ServerEvent;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Process-wide broadcast fabric.
///
/// Maps each connection to its bounded outbound queue and each group to the
/// set of currently-joined connections. All mutation goes through one lock,
/// so a `send` observes the membership snapshot at call time and frames
/// pushed for one group keep the sender's call order per connection.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued outbound frames per connection.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a connection and hand back its outbound frame stream.
	pub async fn register_conn(&self, conn_id: u64) -> mpsc::Receiver<ServerEvent> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		inner.conns.insert(conn_id, tx);

		if self.cfg.debug_logs {
			debug!(conn_id, conns = inner.conns.len(), "room hub: connection registered");
		}

		rx
	}

	/// Drop a connection and all of its group memberships.
	pub async fn remove_conn(&self, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		inner.conns.remove(&conn_id);
		inner.groups.retain(|_, members| {
			members.remove(&conn_id);
			!members.is_empty()
		});

		if self.cfg.debug_logs {
			debug!(conn_id, conns = inner.conns.len(), "room hub: connection removed");
		}
	}

	/// Join a connection to a group. Joining twice is a no-op.
	pub async fn join(&self, group: Group, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		if !inner.conns.contains_key(&conn_id) {
			return;
		}

		let members = inner.groups.entry(group).or_default();
		members.insert(conn_id);

		if self.cfg.debug_logs {
			debug!(conn_id, group = %group, members = members.len(), "room hub: joined group");
		}
	}

	/// Remove a connection from a group. No-op if it never joined.
	pub async fn leave(&self, group: &Group, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		if let Some(members) = inner.groups.get_mut(group) {
			members.remove(&conn_id);
			if members.is_empty() {
				inner.groups.remove(group);
			}
		}
	}

	/// Deliver a frame to every connection joined to `group` at call time.
	///
	/// Returns the number of deliveries. Full or closed subscriber queues
	/// are dropped sends, never errors.
	pub async fn send(&self, group: &Group, event: ServerEvent) -> usize {
		let mut inner = self.inner.lock().await;
		let Some(members) = inner.groups.get(group) else {
			return 0;
		};

		let members = members.iter().copied().collect::<Vec<_>>();
		let mut delivered = 0usize;
		for conn_id in members {
			if inner.push_frame(conn_id, event.clone(), self.cfg.debug_logs) {
				delivered += 1;
			}
		}

		inner.prune_closed();
		delivered
	}

	/// Deliver a frame to one connection. Returns false on a dropped send.
	pub async fn send_to(&self, conn_id: u64, event: ServerEvent) -> bool {
		let mut inner = self.inner.lock().await;
		let sent = inner.push_frame(conn_id, event, self.cfg.debug_logs);
		if !sent {
			inner.prune_closed();
		}
		sent
	}

	/// Snapshot of the connections currently joined to `group`.
	pub async fn members(&self, group: &Group) -> Vec<u64> {
		let inner = self.inner.lock().await;
		inner
			.groups
			.get(group)
			.map(|members| members.iter().copied().collect())
			.unwrap_or_default()
	}

	/// Snapshot of member counts per group.
	pub async fn group_sizes(&self) -> HashMap<Group, usize> {
		let inner = self.inner.lock().await;
		inner.groups.iter().map(|(g, members)| (*g, members.len())).collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	conns: HashMap<u64, mpsc::Sender<ServerEvent>>,
	groups: HashMap<Group, HashSet<u64>>,
}

impl Inner {
	/// Push one frame into a connection's queue; counts drops.
	fn push_frame(&self, conn_id: u64, event: ServerEvent, debug_logs: bool) -> bool {
		let Some(tx) = self.conns.get(&conn_id) else {
			metrics::counter!("roomcast_server_dropped_sends_total").increment(1);
			return false;
		};

		match tx.try_send(event) {
			Ok(()) => {
				metrics::counter!("roomcast_server_frames_enqueued_total").increment(1);
				true
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("roomcast_server_dropped_sends_total").increment(1);
				if debug_logs {
					debug!(conn_id, "room hub: dropped frame, subscriber queue full");
				}
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				metrics::counter!("roomcast_server_dropped_sends_total").increment(1);
				if debug_logs {
					debug!(conn_id, "room hub: dropped frame, connection closed");
				}
				false
			}
		}
	}

	/// Sweep connections whose receivers are gone.
	fn prune_closed(&mut self) {
		let closed = self
			.conns
			.iter()
			.filter(|(_, tx)| tx.is_closed())
			.map(|(id, _)| *id)
			.collect::<Vec<_>>();

		for conn_id in closed {
			self.conns.remove(&conn_id);
			self.groups.retain(|_, members| {
				members.remove(&conn_id);
				!members.is_empty()
			});
		}
	}
}
