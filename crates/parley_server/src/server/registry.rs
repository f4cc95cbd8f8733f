#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use parley_domain::UserId;
use tokio::sync::mpsc;
use tracing::warn;

/// Non-owning reference to a live connection's outbound queue.
///
/// Sends never block: frames go through `try_send` into the bounded queue
/// drained by the connection's writer task, so a handle may be used while
/// the registry lock is held without stalling other registry users. A full
/// queue drops the frame (delivery is best-effort).
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	conn_id: u64,
	outbound: mpsc::Sender<String>,
}

impl ConnectionHandle {
	pub fn new(conn_id: u64, outbound: mpsc::Sender<String>) -> Self {
		Self { conn_id, outbound }
	}

	pub fn conn_id(&self) -> u64 {
		self.conn_id
	}

	/// Queue a serialized message for this connection. Returns `false` when
	/// the frame was dropped (queue full) or the connection is gone.
	pub fn send(&self, payload: &str) -> bool {
		match self.outbound.try_send(payload.to_string()) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("parley_server_outbound_dropped_total").increment(1);
				warn!(conn_id = self.conn_id, "outbound queue full, dropping frame");
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}
}

impl PartialEq for ConnectionHandle {
	fn eq(&self, other: &Self) -> bool {
		self.conn_id == other.conn_id
	}
}

impl Eq for ConnectionHandle {}

/// Process-local map of online users to their connections.
///
/// One mutex guards all reads and writes. Every method acquires and releases
/// the lock internally; the guard never crosses an `.await` point and never
/// covers blocking I/O. Invariant: at most one entry per user id, present iff
/// that user is logged in on this process.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
	inner: Mutex<HashMap<UserId, ConnectionHandle>>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<UserId, ConnectionHandle>> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Record a login. Returns the displaced handle if the user already had
	/// an entry (should not happen; the login handler rejects duplicates
	/// before inserting).
	pub fn insert(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
		self.lock().insert(user, handle)
	}

	/// Remove a user's entry, if any.
	pub fn remove(&self, user: UserId) -> Option<ConnectionHandle> {
		self.lock().remove(&user)
	}

	/// Clone the handle for a user, releasing the lock before the caller
	/// touches the connection.
	pub fn get(&self, user: UserId) -> Option<ConnectionHandle> {
		self.lock().get(&user).cloned()
	}

	pub fn contains(&self, user: UserId) -> bool {
		self.lock().contains_key(&user)
	}

	/// Reverse lookup for the abnormal-close path: find and remove the entry
	/// holding the given connection, returning whose it was.
	pub fn remove_by_conn(&self, conn_id: u64) -> Option<UserId> {
		let mut map = self.lock();
		let user = map.iter().find(|(_, h)| h.conn_id() == conn_id).map(|(id, _)| *id)?;
		map.remove(&user);
		Some(user)
	}

	/// Split a member list into locally-connected handles and absent ids in
	/// a single lock acquisition, so a group fanout does not pay one
	/// lock/unlock cycle per member. Sends against the returned handles
	/// happen after the lock is released.
	pub fn snapshot_members(&self, members: &[UserId]) -> (Vec<ConnectionHandle>, Vec<UserId>) {
		let map = self.lock();
		let mut local = Vec::new();
		let mut absent = Vec::new();

		for member in members {
			match map.get(member) {
				Some(handle) => local.push(handle.clone()),
				None => absent.push(*member),
			}
		}

		(local, absent)
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}
}
