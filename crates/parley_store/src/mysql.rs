#![forbid(unsafe_code)]

use async_trait::async_trait;
use parley_domain::{Group, GroupId, GroupMember, GroupRole, Presence, User, UserId, UserSummary};
use sqlx::MySqlPool;
use tracing::warn;

use crate::{Storage, StoreError};

/// MySQL-backed storage. All statements are parameterized; values never get
/// spliced into SQL text.
#[derive(Clone)]
pub struct MySqlStore {
	pool: MySqlPool,
}

impl MySqlStore {
	/// Connect to the database and apply pending migrations.
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		let pool = MySqlPool::connect(database_url).await?;
		sqlx::migrate!("./migrations").run(&pool).await?;
		Ok(Self { pool })
	}

	/// Wrap an already-connected pool (no migrations run).
	pub fn from_pool(pool: MySqlPool) -> Self {
		Self { pool }
	}
}

fn parse_presence(user_id: i64, raw: &str) -> Presence {
	raw.parse().unwrap_or_else(|_| {
		warn!(user_id, state = raw, "unrecognized persisted presence state, treating as offline");
		Presence::Offline
	})
}

fn parse_role(user_id: i64, raw: &str) -> GroupRole {
	raw.parse().unwrap_or_else(|_| {
		warn!(user_id, role = raw, "unrecognized persisted group role, treating as normal");
		GroupRole::Normal
	})
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
	match err {
		sqlx::Error::Database(db) => matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation),
		_ => false,
	}
}

#[async_trait]
impl Storage for MySqlStore {
	async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
		let row = sqlx::query_as::<_, (i64, String, String, String)>(
			"SELECT id, name, password, state FROM user WHERE id = ?",
		)
		.bind(id.0)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row.map(|(id, name, password, state)| User {
			id: UserId(id),
			name,
			password,
			state: parse_presence(id, &state),
		}))
	}

	async fn insert_user(&self, name: &str, password: &str) -> Result<UserId, StoreError> {
		let result = sqlx::query("INSERT INTO user (name, password, state) VALUES (?, ?, 'offline')")
			.bind(name)
			.bind(password)
			.execute(&self.pool)
			.await;

		match result {
			Ok(done) => Ok(UserId(done.last_insert_id() as i64)),
			Err(e) if is_unique_violation(&e) => Err(StoreError::NameTaken(name.to_string())),
			Err(e) => Err(e.into()),
		}
	}

	async fn update_user_state(&self, id: UserId, state: Presence) -> Result<(), StoreError> {
		sqlx::query("UPDATE user SET state = ? WHERE id = ?")
			.bind(state.as_str())
			.bind(id.0)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn reset_all_online_to_offline(&self) -> Result<u64, StoreError> {
		let done = sqlx::query("UPDATE user SET state = 'offline' WHERE state = 'online'")
			.execute(&self.pool)
			.await?;
		Ok(done.rows_affected())
	}

	async fn insert_friend(&self, user: UserId, friend: UserId) -> Result<(), StoreError> {
		sqlx::query("INSERT INTO friend (userid, friendid) VALUES (?, ?)")
			.bind(user.0)
			.bind(friend.0)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn friends_of(&self, user: UserId) -> Result<Vec<UserSummary>, StoreError> {
		let rows = sqlx::query_as::<_, (i64, String, String)>(
			"SELECT a.id, a.name, a.state FROM user a \
			INNER JOIN friend b ON b.friendid = a.id WHERE b.userid = ?",
		)
		.bind(user.0)
		.fetch_all(&self.pool)
		.await?;

		Ok(rows
			.into_iter()
			.map(|(id, name, state)| UserSummary {
				id: UserId(id),
				name,
				state: parse_presence(id, &state),
			})
			.collect())
	}

	async fn create_group(&self, name: &str, desc: &str) -> Result<GroupId, StoreError> {
		let result = sqlx::query("INSERT INTO allgroup (groupname, groupdesc) VALUES (?, ?)")
			.bind(name)
			.bind(desc)
			.execute(&self.pool)
			.await;

		match result {
			Ok(done) => Ok(GroupId(done.last_insert_id() as i64)),
			Err(e) if is_unique_violation(&e) => Err(StoreError::GroupNameTaken(name.to_string())),
			Err(e) => Err(e.into()),
		}
	}

	async fn join_group(&self, user: UserId, group: GroupId, role: GroupRole) -> Result<(), StoreError> {
		sqlx::query("INSERT INTO groupuser (groupid, userid, grouprole) VALUES (?, ?, ?)")
			.bind(group.0)
			.bind(user.0)
			.bind(role.as_str())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn groups_of(&self, user: UserId) -> Result<Vec<Group>, StoreError> {
		let group_rows = sqlx::query_as::<_, (i64, String, String)>(
			"SELECT a.id, a.groupname, a.groupdesc FROM allgroup a \
			INNER JOIN groupuser b ON a.id = b.groupid WHERE b.userid = ?",
		)
		.bind(user.0)
		.fetch_all(&self.pool)
		.await?;

		let mut groups = Vec::with_capacity(group_rows.len());
		for (id, name, desc) in group_rows {
			let member_rows = sqlx::query_as::<_, (i64, String, String, String)>(
				"SELECT a.id, a.name, a.state, b.grouprole FROM user a \
				INNER JOIN groupuser b ON b.userid = a.id WHERE b.groupid = ?",
			)
			.bind(id)
			.fetch_all(&self.pool)
			.await?;

			let members = member_rows
				.into_iter()
				.map(|(mid, mname, mstate, mrole)| GroupMember {
					id: UserId(mid),
					name: mname,
					state: parse_presence(mid, &mstate),
					role: parse_role(mid, &mrole),
				})
				.collect();

			groups.push(Group {
				id: GroupId(id),
				name,
				desc,
				members,
			});
		}

		Ok(groups)
	}

	async fn group_member_ids(&self, group: GroupId, except: UserId) -> Result<Vec<UserId>, StoreError> {
		let rows = sqlx::query_scalar::<_, i64>("SELECT userid FROM groupuser WHERE groupid = ? AND userid != ?")
			.bind(group.0)
			.bind(except.0)
			.fetch_all(&self.pool)
			.await?;

		Ok(rows.into_iter().map(UserId).collect())
	}

	async fn append_offline(&self, user: UserId, payload: &str) -> Result<(), StoreError> {
		sqlx::query("INSERT INTO offlinemessage (userid, message) VALUES (?, ?)")
			.bind(user.0)
			.bind(payload)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn drain_offline(&self, user: UserId) -> Result<Vec<String>, StoreError> {
		let mut tx = self.pool.begin().await?;

		let messages = sqlx::query_scalar::<_, String>("SELECT message FROM offlinemessage WHERE userid = ?")
			.bind(user.0)
			.fetch_all(&mut *tx)
			.await?;

		sqlx::query("DELETE FROM offlinemessage WHERE userid = ?")
			.bind(user.0)
			.execute(&mut *tx)
			.await?;

		tx.commit().await?;
		Ok(messages)
	}
}
