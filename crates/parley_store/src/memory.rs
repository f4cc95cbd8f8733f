#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use parley_domain::{Group, GroupId, GroupMember, GroupRole, Presence, User, UserId, UserSummary};

use crate::{Storage, StoreError};

/// In-process storage stand-in with the same semantics as the SQL backend.
///
/// State is lost on restart; intended for development and tests only.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	users: HashMap<UserId, User>,
	next_user_id: i64,
	friends: HashMap<UserId, Vec<UserId>>,
	groups: HashMap<GroupId, GroupRecord>,
	next_group_id: i64,
	members: HashMap<GroupId, Vec<(UserId, GroupRole)>>,
	offline: HashMap<UserId, Vec<String>>,
}

struct GroupRecord {
	name: String,
	desc: String,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}
}

#[async_trait]
impl Storage for MemoryStore {
	async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
		Ok(self.lock().users.get(&id).cloned())
	}

	async fn insert_user(&self, name: &str, password: &str) -> Result<UserId, StoreError> {
		let mut inner = self.lock();
		if inner.users.values().any(|u| u.name == name) {
			return Err(StoreError::NameTaken(name.to_string()));
		}

		inner.next_user_id += 1;
		let id = UserId(inner.next_user_id);
		inner.users.insert(
			id,
			User {
				id,
				name: name.to_string(),
				password: password.to_string(),
				state: Presence::Offline,
			},
		);
		Ok(id)
	}

	async fn update_user_state(&self, id: UserId, state: Presence) -> Result<(), StoreError> {
		if let Some(user) = self.lock().users.get_mut(&id) {
			user.state = state;
		}
		Ok(())
	}

	async fn reset_all_online_to_offline(&self) -> Result<u64, StoreError> {
		let mut repaired = 0;
		for user in self.lock().users.values_mut() {
			if user.state == Presence::Online {
				user.state = Presence::Offline;
				repaired += 1;
			}
		}
		Ok(repaired)
	}

	async fn insert_friend(&self, user: UserId, friend: UserId) -> Result<(), StoreError> {
		let mut inner = self.lock();
		let list = inner.friends.entry(user).or_default();
		if !list.contains(&friend) {
			list.push(friend);
		}
		Ok(())
	}

	async fn friends_of(&self, user: UserId) -> Result<Vec<UserSummary>, StoreError> {
		let inner = self.lock();
		let Some(friend_ids) = inner.friends.get(&user) else {
			return Ok(Vec::new());
		};

		Ok(friend_ids
			.iter()
			.filter_map(|id| inner.users.get(id))
			.map(|u| UserSummary {
				id: u.id,
				name: u.name.clone(),
				state: u.state,
			})
			.collect())
	}

	async fn create_group(&self, name: &str, desc: &str) -> Result<GroupId, StoreError> {
		let mut inner = self.lock();
		if inner.groups.values().any(|g| g.name == name) {
			return Err(StoreError::GroupNameTaken(name.to_string()));
		}

		inner.next_group_id += 1;
		let id = GroupId(inner.next_group_id);
		inner.groups.insert(
			id,
			GroupRecord {
				name: name.to_string(),
				desc: desc.to_string(),
			},
		);
		Ok(id)
	}

	async fn join_group(&self, user: UserId, group: GroupId, role: GroupRole) -> Result<(), StoreError> {
		let mut inner = self.lock();
		let roster = inner.members.entry(group).or_default();
		if !roster.iter().any(|(id, _)| *id == user) {
			roster.push((user, role));
		}
		Ok(())
	}

	async fn groups_of(&self, user: UserId) -> Result<Vec<Group>, StoreError> {
		let inner = self.lock();
		let mut groups = Vec::new();

		for (group_id, record) in &inner.groups {
			let Some(roster) = inner.members.get(group_id) else {
				continue;
			};
			if !roster.iter().any(|(id, _)| *id == user) {
				continue;
			}

			let members = roster
				.iter()
				.filter_map(|(id, role)| {
					inner.users.get(id).map(|u| GroupMember {
						id: u.id,
						name: u.name.clone(),
						state: u.state,
						role: *role,
					})
				})
				.collect();

			groups.push(Group {
				id: *group_id,
				name: record.name.clone(),
				desc: record.desc.clone(),
				members,
			});
		}

		groups.sort_by_key(|g| g.id);
		Ok(groups)
	}

	async fn group_member_ids(&self, group: GroupId, except: UserId) -> Result<Vec<UserId>, StoreError> {
		let inner = self.lock();
		Ok(inner
			.members
			.get(&group)
			.map(|roster| {
				roster
					.iter()
					.map(|(id, _)| *id)
					.filter(|id| *id != except)
					.collect()
			})
			.unwrap_or_default())
	}

	async fn append_offline(&self, user: UserId, payload: &str) -> Result<(), StoreError> {
		self.lock().offline.entry(user).or_default().push(payload.to_string());
		Ok(())
	}

	async fn drain_offline(&self, user: UserId) -> Result<Vec<String>, StoreError> {
		Ok(self.lock().offline.remove(&user).unwrap_or_default())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn insert_user_assigns_sequential_ids_and_rejects_duplicates() {
		let store = MemoryStore::new();

		let a = store.insert_user("zhang san", "123456").await.unwrap();
		let b = store.insert_user("li si", "666666").await.unwrap();
		assert_ne!(a, b);

		let err = store.insert_user("zhang san", "other").await.unwrap_err();
		assert!(matches!(err, StoreError::NameTaken(_)));

		let user = store.find_user(a).await.unwrap().expect("user exists");
		assert_eq!(user.name, "zhang san");
		assert_eq!(user.state, Presence::Offline);
	}

	#[tokio::test]
	async fn state_updates_and_startup_reset() {
		let store = MemoryStore::new();
		let a = store.insert_user("a", "pw").await.unwrap();
		let b = store.insert_user("b", "pw").await.unwrap();

		store.update_user_state(a, Presence::Online).await.unwrap();
		store.update_user_state(b, Presence::Online).await.unwrap();
		assert_eq!(store.reset_all_online_to_offline().await.unwrap(), 2);

		for id in [a, b] {
			let user = store.find_user(id).await.unwrap().expect("user exists");
			assert_eq!(user.state, Presence::Offline);
		}
	}

	#[tokio::test]
	async fn offline_messages_drain_once() {
		let store = MemoryStore::new();
		let user = store.insert_user("a", "pw").await.unwrap();

		store.append_offline(user, r#"{"msgid":5,"msg":"hi"}"#).await.unwrap();
		store.append_offline(user, r#"{"msgid":5,"msg":"again"}"#).await.unwrap();

		let drained = store.drain_offline(user).await.unwrap();
		assert_eq!(drained.len(), 2);
		assert_eq!(drained[0], r#"{"msgid":5,"msg":"hi"}"#);

		assert!(store.drain_offline(user).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn group_membership_and_fanout_query() {
		let store = MemoryStore::new();
		let a = store.insert_user("a", "pw").await.unwrap();
		let b = store.insert_user("b", "pw").await.unwrap();
		let c = store.insert_user("c", "pw").await.unwrap();

		let group = store.create_group("dev", "dev chat").await.unwrap();
		store.join_group(a, group, GroupRole::Creator).await.unwrap();
		store.join_group(b, group, GroupRole::Normal).await.unwrap();
		store.join_group(c, group, GroupRole::Normal).await.unwrap();

		let mut others = store.group_member_ids(group, a).await.unwrap();
		others.sort();
		assert_eq!(others, vec![b, c]);

		let groups = store.groups_of(b).await.unwrap();
		assert_eq!(groups.len(), 1);
		assert_eq!(groups[0].name, "dev");
		assert_eq!(groups[0].members.len(), 3);
		let creator = groups[0].members.iter().find(|m| m.id == a).expect("creator in roster");
		assert_eq!(creator.role, GroupRole::Creator);
	}

	#[tokio::test]
	async fn friends_report_current_presence() {
		let store = MemoryStore::new();
		let a = store.insert_user("a", "pw").await.unwrap();
		let b = store.insert_user("b", "pw").await.unwrap();

		store.insert_friend(a, b).await.unwrap();
		store.update_user_state(b, Presence::Online).await.unwrap();

		let friends = store.friends_of(a).await.unwrap();
		assert_eq!(friends.len(), 1);
		assert_eq!(friends[0].id, b);
		assert_eq!(friends[0].state, Presence::Online);

		assert!(store.friends_of(b).await.unwrap().is_empty());
	}
}
