#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{Presence, UserId};
use parley_store::Storage;
use tracing::warn;

use crate::server::bus::Bus;
use crate::server::registry::ConnectionRegistry;

/// Decides, per recipient, between a local send, a bus publish, and an
/// offline store. Best-effort: no return value, no retries; a collaborator
/// failure at one tier is logged and falls through to the next.
pub struct DeliveryEngine {
	registry: Arc<ConnectionRegistry>,
	store: Arc<dyn Storage>,
	bus: Arc<dyn Bus>,
}

impl DeliveryEngine {
	pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn Storage>, bus: Arc<dyn Bus>) -> Self {
		Self { registry, store, bus }
	}

	/// Deliver a serialized payload to one recipient. First match wins:
	/// local connection, then bus relay to the instance holding the
	/// recipient, then offline store.
	pub async fn deliver(&self, to: UserId, payload: &str) {
		if let Some(handle) = self.registry.get(to) {
			metrics::counter!("parley_server_delivery_local_total").increment(1);
			handle.send(payload);
			return;
		}

		self.relay_or_store(to, payload).await;
	}

	/// Tiers 2 and 3: the recipient holds no connection here. The presence
	/// read is a snapshot; the race against a concurrent logout resolves to
	/// a publish nobody consumes or a duplicate offline store, both of which
	/// are cleaned up at the recipient's next login.
	async fn relay_or_store(&self, to: UserId, payload: &str) {
		match self.store.find_user(to).await {
			Ok(Some(user)) if user.state == Presence::Online => {
				metrics::counter!("parley_server_delivery_bus_total").increment(1);
				self.bus.publish(to, payload).await;
				return;
			}
			Ok(_) => {}
			Err(e) => {
				warn!(user = %to, error = %e, "presence lookup failed, storing message offline");
			}
		}

		metrics::counter!("parley_server_delivery_offline_total").increment(1);
		if let Err(e) = self.store.append_offline(to, payload).await {
			warn!(user = %to, error = %e, "offline store failed, message lost");
		}
	}

	/// Bus-inbound bridge path: a payload published on this user's channel
	/// arrived here. Either the user is held locally and gets the payload
	/// directly, or it goes to the offline store — never both. No presence
	/// re-check: the publish already established no other mechanism
	/// delivered it.
	pub async fn deliver_local_or_store(&self, to: UserId, payload: &str) {
		if let Some(handle) = self.registry.get(to) {
			metrics::counter!("parley_server_delivery_local_total").increment(1);
			handle.send(payload);
			return;
		}

		metrics::counter!("parley_server_delivery_offline_total").increment(1);
		if let Err(e) = self.store.append_offline(to, payload).await {
			warn!(user = %to, error = %e, "offline store failed, message lost");
		}
	}

	/// Deliver to every member independently. Local handles are copied out
	/// of the registry in one lock acquisition and the lock is released
	/// before any send; absent members each get the relay-or-store decision.
	pub async fn fanout(&self, members: &[UserId], payload: &str) {
		let (local, absent) = self.registry.snapshot_members(members);

		for handle in local {
			metrics::counter!("parley_server_delivery_local_total").increment(1);
			handle.send(payload);
		}

		for member in absent {
			self.relay_or_store(member, payload).await;
		}
	}
}
