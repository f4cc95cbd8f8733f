#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{GroupRole, Presence, UserId};
use parley_protocol::{
	AddFriendRequest, AddGroupRequest, CreateGroupRequest, ERRNO_DUPLICATE_LOGIN, ERRNO_REJECTED, FriendInfo,
	GroupChatRequest, GroupInfo, LoginAck, LoginRequest, LogoutRequest, OneChatRequest, RegisterAck, RegisterRequest,
};
use parley_store::{Storage, StoreError};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::bus::{Bus, BusMessage};
use crate::server::delivery::DeliveryEngine;
use crate::server::registry::{ConnectionHandle, ConnectionRegistry};
use crate::server::router::Router;

/// The business core: session/presence state machine, chat operations, and
/// the bus-inbound bridge. One explicitly constructed instance is shared by
/// every connection task and the bridge task.
pub struct ChatService {
	registry: Arc<ConnectionRegistry>,
	store: Arc<dyn Storage>,
	bus: Arc<dyn Bus>,
	delivery: DeliveryEngine,
	router: Router,
}

impl ChatService {
	pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn Storage>, bus: Arc<dyn Bus>) -> Self {
		let delivery = DeliveryEngine::new(Arc::clone(&registry), Arc::clone(&store), Arc::clone(&bus));
		Self {
			registry,
			store,
			bus,
			delivery,
			router: Router::new(),
		}
	}

	pub fn registry(&self) -> &ConnectionRegistry {
		&self.registry
	}

	/// Route one inbound message to its handler.
	pub async fn dispatch(&self, conn: &ConnectionHandle, msgid: i64, msg: Value, received_ms: i64) {
		self.router.dispatch(self, conn, msgid, msg, received_ms).await;
	}

	/// Repair presence state left behind by a crash: with no registry yet,
	/// every persisted `online` row is stale.
	pub async fn reset_on_startup(&self) {
		match self.store.reset_all_online_to_offline().await {
			Ok(repaired) => {
				if repaired > 0 {
					info!(repaired, "reset stale online users to offline");
				}
			}
			Err(e) => warn!(error = %e, "startup presence reset failed"),
		}
	}

	pub(crate) async fn login(&self, conn: &ConnectionHandle, msg: Value, _received_ms: i64) {
		let req = match LoginRequest::deserialize(&msg) {
			Ok(req) => req,
			Err(e) => {
				warn!(conn_id = conn.conn_id(), error = %e, "malformed LOGIN payload, ignoring");
				return;
			}
		};

		let user = match self.store.find_user(req.id).await {
			Ok(user) => user,
			Err(e) => {
				warn!(user = %req.id, error = %e, "user lookup failed, abandoning login");
				return;
			}
		};

		let Some(user) = user else {
			send_json(conn, &LoginAck::failure(ERRNO_REJECTED, "invalid id or password"));
			return;
		};
		if user.password != req.password {
			send_json(conn, &LoginAck::failure(ERRNO_REJECTED, "invalid id or password"));
			return;
		}

		if user.state == Presence::Online {
			send_json(
				conn,
				&LoginAck::failure(ERRNO_DUPLICATE_LOGIN, "this account is already logged in"),
			);
			return;
		}

		if let Some(displaced) = self.registry.insert(user.id, conn.clone()) {
			warn!(user = %user.id, conn_id = displaced.conn_id(), "displaced stale registry entry on login");
		}
		self.bus.subscribe(user.id).await;
		if let Err(e) = self.store.update_user_state(user.id, Presence::Online).await {
			warn!(user = %user.id, error = %e, "failed to persist online state");
		}

		let offlinemsg = match self.store.drain_offline(user.id).await {
			Ok(messages) => messages,
			Err(e) => {
				warn!(user = %user.id, error = %e, "failed to drain offline messages");
				Vec::new()
			}
		};
		let friends = match self.store.friends_of(user.id).await {
			Ok(friends) => friends.iter().map(FriendInfo::from).collect(),
			Err(e) => {
				warn!(user = %user.id, error = %e, "failed to load friend list");
				Vec::new()
			}
		};
		let groups = match self.store.groups_of(user.id).await {
			Ok(groups) => groups.iter().map(GroupInfo::from).collect(),
			Err(e) => {
				warn!(user = %user.id, error = %e, "failed to load group memberships");
				Vec::new()
			}
		};

		info!(user = %user.id, conn_id = conn.conn_id(), "user logged in");
		send_json(conn, &LoginAck::success(user.id, user.name, offlinemsg, friends, groups));
	}

	/// Voluntary logout. No reply is defined; the client disconnects next.
	pub(crate) async fn logout(&self, conn: &ConnectionHandle, msg: Value, _received_ms: i64) {
		let req = match LogoutRequest::deserialize(&msg) {
			Ok(req) => req,
			Err(e) => {
				warn!(conn_id = conn.conn_id(), error = %e, "malformed LOGOUT payload, ignoring");
				return;
			}
		};

		self.registry.remove(req.id);
		self.bus.unsubscribe(req.id).await;
		if let Err(e) = self.store.update_user_state(req.id, Presence::Offline).await {
			warn!(user = %req.id, error = %e, "failed to persist offline state");
		}
		info!(user = %req.id, conn_id = conn.conn_id(), "user logged out");
	}

	/// Abnormal close. Finding no registry entry is normal (the connection
	/// never logged in, or logout already ran).
	pub async fn client_close(&self, conn: &ConnectionHandle) {
		let Some(user) = self.registry.remove_by_conn(conn.conn_id()) else {
			debug!(conn_id = conn.conn_id(), "closed connection had no logged-in user");
			return;
		};

		self.bus.unsubscribe(user).await;
		if let Err(e) = self.store.update_user_state(user, Presence::Offline).await {
			warn!(user = %user, error = %e, "failed to persist offline state");
		}
		info!(user = %user, conn_id = conn.conn_id(), "user disconnected");
	}

	pub(crate) async fn register(&self, conn: &ConnectionHandle, msg: Value, _received_ms: i64) {
		let req = match RegisterRequest::deserialize(&msg) {
			Ok(req) => req,
			Err(e) => {
				warn!(conn_id = conn.conn_id(), error = %e, "malformed REGISTER payload, ignoring");
				return;
			}
		};

		match self.store.insert_user(&req.name, &req.password).await {
			Ok(id) => {
				info!(user = %id, name = %req.name, "registered new user");
				send_json(conn, &RegisterAck::success(id));
			}
			Err(StoreError::NameTaken(name)) => {
				debug!(name = %name, "registration rejected, name taken");
				send_json(conn, &RegisterAck::failure("name already taken"));
			}
			Err(e) => {
				warn!(name = %req.name, error = %e, "registration failed");
				send_json(conn, &RegisterAck::failure("registration failed"));
			}
		}
	}

	/// One-to-one chat: a single-recipient fanout. The inbound payload is
	/// relayed verbatim so the recipient sees exactly what the sender wrote.
	pub(crate) async fn one_chat(&self, conn: &ConnectionHandle, msg: Value, _received_ms: i64) {
		let req = match OneChatRequest::deserialize(&msg) {
			Ok(req) => req,
			Err(e) => {
				warn!(conn_id = conn.conn_id(), error = %e, "malformed ONE_CHAT payload, ignoring");
				return;
			}
		};

		let payload = msg.to_string();
		self.delivery.deliver(req.toid, &payload).await;
	}

	pub(crate) async fn group_chat(&self, conn: &ConnectionHandle, msg: Value, _received_ms: i64) {
		let req = match GroupChatRequest::deserialize(&msg) {
			Ok(req) => req,
			Err(e) => {
				warn!(conn_id = conn.conn_id(), error = %e, "malformed GROUP_CHAT payload, ignoring");
				return;
			}
		};

		let members = match self.store.group_member_ids(req.groupid, req.id).await {
			Ok(members) => members,
			Err(e) => {
				warn!(group = %req.groupid, error = %e, "group member lookup failed, dropping message");
				return;
			}
		};

		let payload = msg.to_string();
		self.delivery.fanout(&members, &payload).await;
	}

	pub(crate) async fn add_friend(&self, conn: &ConnectionHandle, msg: Value, _received_ms: i64) {
		let req = match AddFriendRequest::deserialize(&msg) {
			Ok(req) => req,
			Err(e) => {
				warn!(conn_id = conn.conn_id(), error = %e, "malformed ADD_FRIEND payload, ignoring");
				return;
			}
		};

		if let Err(e) = self.store.insert_friend(req.id, req.friendid).await {
			warn!(user = %req.id, friend = %req.friendid, error = %e, "failed to record friend relation");
		}
	}

	pub(crate) async fn create_group(&self, conn: &ConnectionHandle, msg: Value, _received_ms: i64) {
		let req = match CreateGroupRequest::deserialize(&msg) {
			Ok(req) => req,
			Err(e) => {
				warn!(conn_id = conn.conn_id(), error = %e, "malformed CREATE_GROUP payload, ignoring");
				return;
			}
		};

		match self.store.create_group(&req.groupname, &req.groupdesc).await {
			Ok(group) => {
				info!(group = %group, name = %req.groupname, "created group");
				if let Err(e) = self.store.join_group(req.id, group, GroupRole::Creator).await {
					warn!(user = %req.id, group = %group, error = %e, "failed to record group creator");
				}
			}
			Err(e) => {
				warn!(name = %req.groupname, error = %e, "failed to create group");
			}
		}
	}

	pub(crate) async fn add_group(&self, conn: &ConnectionHandle, msg: Value, _received_ms: i64) {
		let req = match AddGroupRequest::deserialize(&msg) {
			Ok(req) => req,
			Err(e) => {
				warn!(conn_id = conn.conn_id(), error = %e, "malformed ADD_GROUP payload, ignoring");
				return;
			}
		};

		if let Err(e) = self.store.join_group(req.id, req.groupid, GroupRole::Normal).await {
			warn!(user = %req.id, group = %req.groupid, error = %e, "failed to join group");
		}
	}

	/// Bus-inbound bridge: a remote instance published on this channel.
	/// Must complete in bounded time (registry lookup plus one send or one
	/// offline append) so the bridge task keeps draining the listener queue.
	pub async fn handle_bus_message(&self, channel: UserId, payload: &str) {
		self.delivery.deliver_local_or_store(channel, payload).await;
	}
}

/// Serialize and queue an outbound message; serialization failures are
/// logged, sends stay non-blocking.
pub(crate) fn send_json<T: serde::Serialize>(conn: &ConnectionHandle, msg: &T) {
	match serde_json::to_string(msg) {
		Ok(payload) => {
			conn.send(&payload);
		}
		Err(e) => warn!(conn_id = conn.conn_id(), error = %e, "failed to serialize outbound message"),
	}
}

/// Spawn the long-lived task that feeds bus pushes into the bridge path.
pub fn spawn_bus_bridge(service: Arc<ChatService>, mut rx: mpsc::Receiver<BusMessage>) {
	tokio::spawn(async move {
		while let Some(msg) = rx.recv().await {
			service.handle_bus_message(msg.channel, &msg.payload).await;
		}
		info!("bus bridge exited (listener queue closed)");
	});
}
