#![forbid(unsafe_code)]

//! Persistence collaborator boundary for the chat server.
//!
//! The business core consumes the [`Storage`] trait; [`MySqlStore`] is the
//! production backend and [`MemoryStore`] is an in-process stand-in for
//! development and tests.

mod memory;
mod mysql;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;

use async_trait::async_trait;
use parley_domain::{Group, GroupId, GroupRole, Presence, User, UserId, UserSummary};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration error: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),

	#[error("user name already taken: {0}")]
	NameTaken(String),

	#[error("group name already taken: {0}")]
	GroupNameTaken(String),
}

/// Storage operations consumed by the business core.
///
/// Every operation must be safe to call concurrently from multiple
/// connection workers; implementations pool or acquire connections per call.
#[async_trait]
pub trait Storage: Send + Sync {
	/// Look up a user by id, including credential and persisted presence.
	async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

	/// Insert a new user and return the assigned identifier.
	async fn insert_user(&self, name: &str, password: &str) -> Result<UserId, StoreError>;

	/// Persist a user's presence state.
	async fn update_user_state(&self, id: UserId, state: Presence) -> Result<(), StoreError>;

	/// Force every persisted `online` user to `offline`; returns the number
	/// of rows repaired. Run once at process start.
	async fn reset_all_online_to_offline(&self) -> Result<u64, StoreError>;

	/// Record a friend relation.
	async fn insert_friend(&self, user: UserId, friend: UserId) -> Result<(), StoreError>;

	/// Friend list for a user, with current persisted presence.
	async fn friends_of(&self, user: UserId) -> Result<Vec<UserSummary>, StoreError>;

	/// Create a group and return its assigned identifier.
	async fn create_group(&self, name: &str, desc: &str) -> Result<GroupId, StoreError>;

	/// Add a user to a group with the given role.
	async fn join_group(&self, user: UserId, group: GroupId, role: GroupRole) -> Result<(), StoreError>;

	/// Groups the user belongs to, each with its full member roster.
	async fn groups_of(&self, user: UserId) -> Result<Vec<Group>, StoreError>;

	/// Member ids of a group, excluding `except` (the sender in a fanout).
	async fn group_member_ids(&self, group: GroupId, except: UserId) -> Result<Vec<UserId>, StoreError>;

	/// Append a serialized payload to a user's offline queue.
	async fn append_offline(&self, user: UserId, payload: &str) -> Result<(), StoreError>;

	/// Read and delete all offline messages for a user as one logical step.
	async fn drain_offline(&self, user: UserId) -> Result<Vec<String>, StoreError>;
}
