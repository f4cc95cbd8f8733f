#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persistent user identifier, assigned by the storage layer on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Persistent group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Errors for parsing domain enums from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("empty value")]
	Empty,
	#[error("unknown presence state: {0}")]
	UnknownPresence(String),
	#[error("unknown group role: {0}")]
	UnknownRole(String),
}

/// Persisted presence state of a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
	Online,
	#[default]
	Offline,
}

impl Presence {
	/// Stable string identifier, as stored in the `user.state` column.
	pub const fn as_str(self) -> &'static str {
		match self {
			Presence::Online => "online",
			Presence::Offline => "offline",
		}
	}
}

impl fmt::Display for Presence {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Presence {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"online" => Ok(Presence::Online),
			"offline" => Ok(Presence::Offline),
			other => Err(ParseError::UnknownPresence(other.to_string())),
		}
	}
}

/// Role of a member inside a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
	Creator,
	#[default]
	Normal,
}

impl GroupRole {
	/// Stable string identifier, as stored in the `groupuser.grouprole` column.
	pub const fn as_str(self) -> &'static str {
		match self {
			GroupRole::Creator => "creator",
			GroupRole::Normal => "normal",
		}
	}
}

impl fmt::Display for GroupRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for GroupRole {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"creator" => Ok(GroupRole::Creator),
			"normal" => Ok(GroupRole::Normal),
			other => Err(ParseError::UnknownRole(other.to_string())),
		}
	}
}

/// A registered user, as stored by the persistence collaborator.
///
/// The password is an opaque credential compared verbatim; it never leaves
/// the storage boundary and is redacted from debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct User {
	pub id: UserId,
	pub name: String,
	pub password: String,
	pub state: Presence,
}

impl fmt::Debug for User {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("User")
			.field("id", &self.id)
			.field("name", &self.name)
			.field("password", &"<redacted>")
			.field("state", &self.state)
			.finish()
	}
}

/// Credential-free view of a user, e.g. an entry in a friend list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
	pub id: UserId,
	pub name: String,
	pub state: Presence,
}

/// A member of a group, with their role in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
	pub id: UserId,
	pub name: String,
	pub state: Presence,
	pub role: GroupRole,
}

/// A chat group with its member roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
	pub id: GroupId,
	pub name: String,
	pub desc: String,
	pub members: Vec<GroupMember>,
}
