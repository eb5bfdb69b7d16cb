#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use roomcast_domain::Group;

/// Correlation-scoped subscription bookkeeping.
///
/// Tracks, per group, which correlation ids each connection registered, plus
/// a per-connection index so teardown can drop every pair in one call.
/// The dispatch half lives in [`crate::server::router`].
#[derive(Debug, Default)]
pub struct SubscriptionState {
	ids_by_group: HashMap<Group, BTreeMap<u64, BTreeSet<String>>>,

	groups_by_conn: HashMap<u64, HashSet<Group>>,
}

impl SubscriptionState {
	/// Register a `(correlation id, group)` pair for a connection.
	///
	/// Idempotent: re-registering an existing pair changes nothing and
	/// returns false.
	pub fn subscribe(&mut self, conn_id: u64, request_id: &str, group: Group) -> bool {
		let inserted = self
			.ids_by_group
			.entry(group)
			.or_default()
			.entry(conn_id)
			.or_default()
			.insert(request_id.to_string());

		if inserted {
			self.groups_by_conn.entry(conn_id).or_default().insert(group);
		}

		inserted
	}

	/// Remove exactly one `(correlation id, group)` pair. No-op if absent.
	pub fn unsubscribe(&mut self, conn_id: u64, request_id: &str, group: &Group) -> bool {
		let Some(by_conn) = self.ids_by_group.get_mut(group) else {
			return false;
		};
		let Some(ids) = by_conn.get_mut(&conn_id) else {
			return false;
		};

		let removed = ids.remove(request_id);
		if ids.is_empty() {
			by_conn.remove(&conn_id);
			self.forget_group_for_conn(conn_id, group);
		}
		if self
			.ids_by_group
			.get(group)
			.is_some_and(|by_conn| by_conn.is_empty())
		{
			self.ids_by_group.remove(group);
		}

		removed
	}

	/// Remove every correlation id a connection holds for one group.
	/// Returns the number of pairs removed.
	pub fn unsubscribe_group(&mut self, conn_id: u64, group: &Group) -> usize {
		let Some(by_conn) = self.ids_by_group.get_mut(group) else {
			return 0;
		};

		let removed = by_conn.remove(&conn_id).map(|ids| ids.len()).unwrap_or(0);
		if by_conn.is_empty() {
			self.ids_by_group.remove(group);
		}
		if removed > 0 {
			self.forget_group_for_conn(conn_id, group);
		}

		removed
	}

	/// Drop every subscription a connection holds. Returns the groups it
	/// was subscribed to.
	pub fn remove_conn(&mut self, conn_id: u64) -> Vec<Group> {
		let Some(groups) = self.groups_by_conn.remove(&conn_id) else {
			return Vec::new();
		};

		let mut removed = Vec::with_capacity(groups.len());
		for group in groups {
			if let Some(by_conn) = self.ids_by_group.get_mut(&group) {
				by_conn.remove(&conn_id);
				if by_conn.is_empty() {
					self.ids_by_group.remove(&group);
				}
			}
			removed.push(group);
		}

		removed
	}

	/// Correlation ids one connection registered for a group, in stable
	/// order.
	pub fn ids_for(&self, group: &Group, conn_id: u64) -> Vec<String> {
		self.ids_by_group
			.get(group)
			.and_then(|by_conn| by_conn.get(&conn_id))
			.map(|ids| ids.iter().cloned().collect())
			.unwrap_or_default()
	}

	/// Groups a connection currently holds subscriptions for.
	pub fn groups_for_conn(&self, conn_id: u64) -> HashSet<Group> {
		self.groups_by_conn.get(&conn_id).cloned().unwrap_or_default()
	}

	/// Snapshot of `(group -> subscription pair count)`.
	pub fn subscription_counts(&self) -> HashMap<Group, usize> {
		self.ids_by_group
			.iter()
			.map(|(group, by_conn)| (*group, by_conn.values().map(BTreeSet::len).sum()))
			.collect()
	}

	fn forget_group_for_conn(&mut self, conn_id: u64, group: &Group) {
		if let Some(groups) = self.groups_by_conn.get_mut(&conn_id) {
			groups.remove(group);
			if groups.is_empty() {
				self.groups_by_conn.remove(&conn_id);
			}
		}
	}
}
