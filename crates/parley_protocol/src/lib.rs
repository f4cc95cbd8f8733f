#![forbid(unsafe_code)]

//! Wire protocol for the chat server: JSON messages discriminated by an
//! integer `msgid`, carried in length-prefixed frames over a persistent
//! byte stream.

pub mod framing;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	try_decode_frame_from_buffer,
};

use parley_domain::{Group, GroupId, GroupMember, GroupRole, Presence, UserId, UserSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Success code for every ACK.
pub const ERRNO_OK: i64 = 0;
/// Invalid credentials, or a rejected registration.
pub const ERRNO_REJECTED: i64 = 1;
/// The account is already logged in somewhere.
pub const ERRNO_DUPLICATE_LOGIN: i64 = 2;

/// Message-type discriminator carried in the `msgid` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgId {
	Login,
	LoginAck,
	Register,
	RegisterAck,
	OneChat,
	AddFriend,
	CreateGroup,
	AddGroup,
	GroupChat,
	Logout,
}

impl MsgId {
	/// Numeric wire code.
	pub const fn code(self) -> i64 {
		match self {
			MsgId::Login => 1,
			MsgId::LoginAck => 2,
			MsgId::Register => 3,
			MsgId::RegisterAck => 4,
			MsgId::OneChat => 5,
			MsgId::AddFriend => 6,
			MsgId::CreateGroup => 7,
			MsgId::AddGroup => 8,
			MsgId::GroupChat => 9,
			MsgId::Logout => 10,
		}
	}

	/// Resolve a wire code; unknown codes stay unknown for forward compatibility.
	pub const fn from_code(code: i64) -> Option<Self> {
		match code {
			1 => Some(MsgId::Login),
			2 => Some(MsgId::LoginAck),
			3 => Some(MsgId::Register),
			4 => Some(MsgId::RegisterAck),
			5 => Some(MsgId::OneChat),
			6 => Some(MsgId::AddFriend),
			7 => Some(MsgId::CreateGroup),
			8 => Some(MsgId::AddGroup),
			9 => Some(MsgId::GroupChat),
			10 => Some(MsgId::Logout),
			_ => None,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			MsgId::Login => "LOGIN",
			MsgId::LoginAck => "LOGIN_ACK",
			MsgId::Register => "REGISTER",
			MsgId::RegisterAck => "REGISTER_ACK",
			MsgId::OneChat => "ONE_CHAT",
			MsgId::AddFriend => "ADD_FRIEND",
			MsgId::CreateGroup => "CREATE_GROUP",
			MsgId::AddGroup => "ADD_GROUP",
			MsgId::GroupChat => "GROUP_CHAT",
			MsgId::Logout => "LOGOUT",
		}
	}
}

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("message has no integer msgid field")]
	MissingMsgId,
}

/// Decode one inbound frame payload into its msgid and raw JSON value.
///
/// Handlers receive the `Value` as-is; payload fields beyond the ones a
/// handler consumes are preserved for verbatim relaying.
pub fn decode_message(bytes: &[u8]) -> Result<(i64, Value), ProtocolError> {
	let value: Value = serde_json::from_slice(bytes)?;
	let msgid = value.get("msgid").and_then(Value::as_i64).ok_or(ProtocolError::MissingMsgId)?;
	Ok((msgid, value))
}

/// LOGIN request fields consumed by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
	pub id: UserId,
	pub password: String,
}

/// Friend-list entry in a LOGIN_ACK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendInfo {
	pub id: UserId,
	pub name: String,
	pub state: Presence,
}

impl From<&UserSummary> for FriendInfo {
	fn from(user: &UserSummary) -> Self {
		Self {
			id: user.id,
			name: user.name.clone(),
			state: user.state,
		}
	}
}

/// Group roster entry in a LOGIN_ACK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMemberInfo {
	pub id: UserId,
	pub name: String,
	pub state: Presence,
	pub role: GroupRole,
}

impl From<&GroupMember> for GroupMemberInfo {
	fn from(member: &GroupMember) -> Self {
		Self {
			id: member.id,
			name: member.name.clone(),
			state: member.state,
			role: member.role,
		}
	}
}

/// Group-membership entry in a LOGIN_ACK, with its nested roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
	pub id: GroupId,
	pub groupname: String,
	pub groupdesc: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub users: Vec<GroupMemberInfo>,
}

impl From<&Group> for GroupInfo {
	fn from(group: &Group) -> Self {
		Self {
			id: group.id,
			groupname: group.name.clone(),
			groupdesc: group.desc.clone(),
			users: group.members.iter().map(GroupMemberInfo::from).collect(),
		}
	}
}

/// LOGIN_ACK response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginAck {
	pub msgid: i64,
	pub errno: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub errmsg: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<UserId>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub offlinemsg: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub friends: Vec<FriendInfo>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub groups: Vec<GroupInfo>,
}

impl LoginAck {
	pub fn success(
		id: UserId,
		name: String,
		offlinemsg: Vec<String>,
		friends: Vec<FriendInfo>,
		groups: Vec<GroupInfo>,
	) -> Self {
		Self {
			msgid: MsgId::LoginAck.code(),
			errno: ERRNO_OK,
			errmsg: None,
			id: Some(id),
			name: Some(name),
			offlinemsg,
			friends,
			groups,
		}
	}

	pub fn failure(errno: i64, errmsg: impl Into<String>) -> Self {
		Self {
			msgid: MsgId::LoginAck.code(),
			errno,
			errmsg: Some(errmsg.into()),
			id: None,
			name: None,
			offlinemsg: Vec::new(),
			friends: Vec::new(),
			groups: Vec::new(),
		}
	}
}

/// REGISTER request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
	pub name: String,
	pub password: String,
}

/// REGISTER_ACK response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
	pub msgid: i64,
	pub errno: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub errmsg: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<UserId>,
}

impl RegisterAck {
	pub fn success(id: UserId) -> Self {
		Self {
			msgid: MsgId::RegisterAck.code(),
			errno: ERRNO_OK,
			errmsg: None,
			id: Some(id),
		}
	}

	pub fn failure(errmsg: impl Into<String>) -> Self {
		Self {
			msgid: MsgId::RegisterAck.code(),
			errno: ERRNO_REJECTED,
			errmsg: Some(errmsg.into()),
			id: None,
		}
	}
}

/// LOGOUT request. No reply is defined; the client disconnects voluntarily.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutRequest {
	pub id: UserId,
}

/// ONE_CHAT fields consumed by the server; the rest of the payload is
/// relayed to the recipient verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct OneChatRequest {
	pub toid: UserId,
}

/// Full ONE_CHAT message as composed by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneChat {
	pub msgid: i64,
	pub id: UserId,
	pub from: String,
	pub toid: UserId,
	pub msg: String,
}

impl OneChat {
	pub fn new(id: UserId, from: impl Into<String>, toid: UserId, msg: impl Into<String>) -> Self {
		Self {
			msgid: MsgId::OneChat.code(),
			id,
			from: from.into(),
			toid,
			msg: msg.into(),
		}
	}
}

/// ADD_FRIEND request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddFriendRequest {
	pub id: UserId,
	pub friendid: UserId,
}

/// CREATE_GROUP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
	pub id: UserId,
	pub groupname: String,
	pub groupdesc: String,
}

/// ADD_GROUP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddGroupRequest {
	pub id: UserId,
	pub groupid: GroupId,
}

/// GROUP_CHAT fields consumed by the server; the payload is relayed to the
/// other members verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupChatRequest {
	pub id: UserId,
	pub groupid: GroupId,
}

/// Full GROUP_CHAT message as composed by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupChat {
	pub msgid: i64,
	pub id: UserId,
	pub groupid: GroupId,
	pub msg: String,
}

impl GroupChat {
	pub fn new(id: UserId, groupid: GroupId, msg: impl Into<String>) -> Self {
		Self {
			msgid: MsgId::GroupChat.code(),
			id,
			groupid,
			msg: msg.into(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn msgid_codes_roundtrip() {
		for id in [
			MsgId::Login,
			MsgId::LoginAck,
			MsgId::Register,
			MsgId::RegisterAck,
			MsgId::OneChat,
			MsgId::AddFriend,
			MsgId::CreateGroup,
			MsgId::AddGroup,
			MsgId::GroupChat,
			MsgId::Logout,
		] {
			assert_eq!(MsgId::from_code(id.code()), Some(id));
		}
		assert_eq!(MsgId::from_code(0), None);
		assert_eq!(MsgId::from_code(99), None);
	}

	#[test]
	fn decode_message_extracts_msgid() {
		let (msgid, value) = decode_message(br#"{"msgid":1,"id":2,"password":"123456"}"#).unwrap();
		assert_eq!(msgid, MsgId::Login.code());
		assert_eq!(value["id"], 2);
	}

	#[test]
	fn decode_message_rejects_missing_msgid() {
		assert!(matches!(
			decode_message(br#"{"id":2}"#),
			Err(ProtocolError::MissingMsgId)
		));
		assert!(matches!(
			decode_message(br#"{"msgid":"LOGIN"}"#),
			Err(ProtocolError::MissingMsgId)
		));
		assert!(matches!(decode_message(b"not json"), Err(ProtocolError::Json(_))));
	}

	#[test]
	fn failure_acks_skip_success_fields() {
		let ack = LoginAck::failure(ERRNO_REJECTED, "invalid id or password");
		let json = serde_json::to_value(&ack).unwrap();
		assert_eq!(json["msgid"], MsgId::LoginAck.code());
		assert_eq!(json["errno"], ERRNO_REJECTED);
		assert!(json.get("id").is_none());
		assert!(json.get("offlinemsg").is_none());
	}

	#[test]
	fn success_ack_carries_profile_and_lists() {
		let friends = vec![FriendInfo {
			id: UserId(2),
			name: "li si".to_string(),
			state: Presence::Online,
		}];
		let ack = LoginAck::success(UserId(1), "zhang san".to_string(), vec!["m1".to_string()], friends, Vec::new());
		let json = serde_json::to_value(&ack).unwrap();
		assert_eq!(json["errno"], ERRNO_OK);
		assert_eq!(json["id"], 1);
		assert_eq!(json["name"], "zhang san");
		assert_eq!(json["offlinemsg"][0], "m1");
		assert_eq!(json["friends"][0]["state"], "online");
		assert!(json.get("groups").is_none());
	}

	#[test]
	fn one_chat_request_ignores_relay_fields() {
		let chat = OneChat::new(UserId(1), "zhang san", UserId(2), "hello");
		let value = serde_json::to_value(&chat).unwrap();
		let req: OneChatRequest = serde_json::from_value(value).unwrap();
		assert_eq!(req.toid, UserId(2));
	}
}
