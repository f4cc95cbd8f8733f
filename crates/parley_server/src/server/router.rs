#![forbid(unsafe_code)]

use std::collections::HashMap;

use futures::future::BoxFuture;
use parley_protocol::MsgId;
use serde_json::Value;
use tracing::warn;

use crate::server::registry::ConnectionHandle;
use crate::server::service::ChatService;

/// A message handler: the decoded payload, the originating connection, and
/// the receipt timestamp in unix milliseconds.
pub type HandlerFn =
	for<'a> fn(&'a ChatService, &'a ConnectionHandle, Value, i64) -> BoxFuture<'a, ()>;

/// Maps inbound message-type codes to handlers.
///
/// Unknown codes — newer or older clients than this server — resolve to a
/// log-only no-op; the connection stays open.
pub struct Router {
	handlers: HashMap<MsgId, HandlerFn>,
}

impl Default for Router {
	fn default() -> Self {
		Self::new()
	}
}

impl Router {
	pub fn new() -> Self {
		let mut handlers: HashMap<MsgId, HandlerFn> = HashMap::new();
		handlers.insert(MsgId::Login, login);
		handlers.insert(MsgId::Logout, logout);
		handlers.insert(MsgId::Register, register);
		handlers.insert(MsgId::OneChat, one_chat);
		handlers.insert(MsgId::AddFriend, add_friend);
		handlers.insert(MsgId::CreateGroup, create_group);
		handlers.insert(MsgId::AddGroup, add_group);
		handlers.insert(MsgId::GroupChat, group_chat);
		Self { handlers }
	}

	pub async fn dispatch(
		&self,
		service: &ChatService,
		conn: &ConnectionHandle,
		msgid: i64,
		msg: Value,
		received_ms: i64,
	) {
		let handler = MsgId::from_code(msgid).and_then(|id| self.handlers.get(&id));
		match handler {
			Some(handler) => {
				metrics::counter!("parley_server_dispatch_total").increment(1);
				handler(service, conn, msg, received_ms).await;
			}
			None => {
				warn!(msgid, conn_id = conn.conn_id(), "no handler for message type, ignoring");
			}
		}
	}
}

fn login<'a>(svc: &'a ChatService, conn: &'a ConnectionHandle, msg: Value, received_ms: i64) -> BoxFuture<'a, ()> {
	Box::pin(svc.login(conn, msg, received_ms))
}

fn logout<'a>(svc: &'a ChatService, conn: &'a ConnectionHandle, msg: Value, received_ms: i64) -> BoxFuture<'a, ()> {
	Box::pin(svc.logout(conn, msg, received_ms))
}

fn register<'a>(svc: &'a ChatService, conn: &'a ConnectionHandle, msg: Value, received_ms: i64) -> BoxFuture<'a, ()> {
	Box::pin(svc.register(conn, msg, received_ms))
}

fn one_chat<'a>(svc: &'a ChatService, conn: &'a ConnectionHandle, msg: Value, received_ms: i64) -> BoxFuture<'a, ()> {
	Box::pin(svc.one_chat(conn, msg, received_ms))
}

fn add_friend<'a>(svc: &'a ChatService, conn: &'a ConnectionHandle, msg: Value, received_ms: i64) -> BoxFuture<'a, ()> {
	Box::pin(svc.add_friend(conn, msg, received_ms))
}

fn create_group<'a>(svc: &'a ChatService, conn: &'a ConnectionHandle, msg: Value, received_ms: i64) -> BoxFuture<'a, ()> {
	Box::pin(svc.create_group(conn, msg, received_ms))
}

fn add_group<'a>(svc: &'a ChatService, conn: &'a ConnectionHandle, msg: Value, received_ms: i64) -> BoxFuture<'a, ()> {
	Box::pin(svc.add_group(conn, msg, received_ms))
}

fn group_chat<'a>(svc: &'a ChatService, conn: &'a ConnectionHandle, msg: Value, received_ms: i64) -> BoxFuture<'a, ()> {
	Box::pin(svc.group_chat(conn, msg, received_ms))
}
