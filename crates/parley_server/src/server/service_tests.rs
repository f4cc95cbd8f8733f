#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{Presence, UserId};
use parley_protocol::{ERRNO_DUPLICATE_LOGIN, ERRNO_OK, ERRNO_REJECTED, LoginAck, MsgId, RegisterAck};
use parley_store::{MemoryStore, Storage};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::bus::memory::MemoryBusHub;
use crate::server::registry::{ConnectionHandle, ConnectionRegistry};
use crate::server::service::{ChatService, spawn_bus_bridge};

fn connection(conn_id: u64) -> (ConnectionHandle, mpsc::Receiver<String>) {
	let (tx, rx) = mpsc::channel(32);
	(ConnectionHandle::new(conn_id, tx), rx)
}

fn build_service(hub: &MemoryBusHub, store: Arc<MemoryStore>) -> Arc<ChatService> {
	let (bus, _bus_rx) = hub.attach();
	Arc::new(ChatService::new(
		Arc::new(ConnectionRegistry::new()),
		store,
		bus,
	))
}

/// Attach with a live bridge so publishes on the hub reach this instance.
fn bridged_service(hub: &MemoryBusHub, store: Arc<MemoryStore>) -> Arc<ChatService> {
	let (bus, bus_rx) = hub.attach();
	let service = Arc::new(ChatService::new(
		Arc::new(ConnectionRegistry::new()),
		store,
		bus,
	));
	spawn_bus_bridge(Arc::clone(&service), bus_rx);
	service
}

async fn recv_frame(rx: &mut mpsc::Receiver<String>) -> String {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected a frame within timeout")
		.expect("channel open")
}

async fn login(service: &ChatService, conn: &ConnectionHandle, rx: &mut mpsc::Receiver<String>, id: UserId) -> LoginAck {
	service
		.dispatch(
			conn,
			MsgId::Login.code(),
			json!({"msgid": MsgId::Login.code(), "id": id.0, "password": "123456"}),
			0,
		)
		.await;
	serde_json::from_str(&recv_frame(rx).await).expect("LOGIN_ACK json")
}

#[tokio::test]
async fn login_success_registers_subscribes_and_acks() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let user = store.insert_user("zhang san", "123456").await.unwrap();
	let service = build_service(&hub, Arc::clone(&store));

	let (conn, mut rx) = connection(1);
	let ack = login(&service, &conn, &mut rx, user).await;

	assert_eq!(ack.errno, ERRNO_OK);
	assert_eq!(ack.id, Some(user));
	assert_eq!(ack.name.as_deref(), Some("zhang san"));

	assert!(service.registry().contains(user));
	assert!(hub.is_subscribed(user));
	let persisted = store.find_user(user).await.unwrap().expect("user exists");
	assert_eq!(persisted.state, Presence::Online);
}

#[tokio::test]
async fn login_with_wrong_password_mutates_nothing() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let user = store.insert_user("zhang san", "123456").await.unwrap();
	let service = build_service(&hub, Arc::clone(&store));

	let (conn, mut rx) = connection(1);
	service
		.dispatch(
			&conn,
			MsgId::Login.code(),
			json!({"msgid": MsgId::Login.code(), "id": user.0, "password": "wrong"}),
			0,
		)
		.await;

	let ack: LoginAck = serde_json::from_str(&recv_frame(&mut rx).await).unwrap();
	assert_eq!(ack.errno, ERRNO_REJECTED);

	assert!(service.registry().is_empty());
	assert!(!hub.is_subscribed(user));
	let persisted = store.find_user(user).await.unwrap().expect("user exists");
	assert_eq!(persisted.state, Presence::Offline);
}

#[tokio::test]
async fn login_of_unknown_user_is_rejected() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let service = build_service(&hub, Arc::clone(&store));

	let (conn, mut rx) = connection(1);
	let ack = login(&service, &conn, &mut rx, UserId(99)).await;
	assert_eq!(ack.errno, ERRNO_REJECTED);
	assert!(service.registry().is_empty());
}

#[tokio::test]
async fn duplicate_login_is_rejected_without_a_second_entry() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let user = store.insert_user("zhang san", "123456").await.unwrap();
	let service = build_service(&hub, Arc::clone(&store));

	let (first, mut first_rx) = connection(1);
	let ack = login(&service, &first, &mut first_rx, user).await;
	assert_eq!(ack.errno, ERRNO_OK);

	let (second, mut second_rx) = connection(2);
	let ack = login(&service, &second, &mut second_rx, user).await;
	assert_eq!(ack.errno, ERRNO_DUPLICATE_LOGIN);

	// The original connection keeps the single registry entry.
	assert_eq!(service.registry().len(), 1);
	assert_eq!(service.registry().get(user).expect("entry").conn_id(), 1);
}

#[tokio::test]
async fn login_returns_and_purges_offline_messages_byte_identical() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let user = store.insert_user("zhang san", "123456").await.unwrap();

	let original = r#"{"from":"li si","msg":"hello é","msgid":5,"toid":1}"#;
	store.append_offline(user, original).await.unwrap();

	let service = build_service(&hub, Arc::clone(&store));
	let (conn, mut rx) = connection(1);
	let ack = login(&service, &conn, &mut rx, user).await;

	assert_eq!(ack.errno, ERRNO_OK);
	assert_eq!(ack.offlinemsg, vec![original.to_string()]);
	assert!(store.drain_offline(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn login_ack_carries_friends_and_groups_with_rosters() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let a = store.insert_user("zhang san", "123456").await.unwrap();
	let b = store.insert_user("li si", "666666").await.unwrap();
	store.insert_friend(a, b).await.unwrap();
	store.update_user_state(b, Presence::Online).await.unwrap();

	let group = store.create_group("dev", "dev chat").await.unwrap();
	store.join_group(a, group, parley_domain::GroupRole::Creator).await.unwrap();
	store.join_group(b, group, parley_domain::GroupRole::Normal).await.unwrap();

	let service = build_service(&hub, Arc::clone(&store));
	let (conn, mut rx) = connection(1);
	let ack = login(&service, &conn, &mut rx, a).await;

	assert_eq!(ack.friends.len(), 1);
	assert_eq!(ack.friends[0].id, b);
	assert_eq!(ack.friends[0].state, Presence::Online);

	assert_eq!(ack.groups.len(), 1);
	assert_eq!(ack.groups[0].groupname, "dev");
	assert_eq!(ack.groups[0].users.len(), 2);
}

#[tokio::test]
async fn logout_clears_entry_and_unsubscribes() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let user = store.insert_user("zhang san", "123456").await.unwrap();
	let service = build_service(&hub, Arc::clone(&store));

	let (conn, mut rx) = connection(1);
	login(&service, &conn, &mut rx, user).await;

	service
		.dispatch(&conn, MsgId::Logout.code(), json!({"msgid": MsgId::Logout.code(), "id": user.0}), 0)
		.await;

	assert!(service.registry().is_empty());
	assert!(!hub.is_subscribed(user));
	let persisted = store.find_user(user).await.unwrap().expect("user exists");
	assert_eq!(persisted.state, Presence::Offline);
}

#[tokio::test]
async fn disconnect_cleans_up_logged_in_user() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let user = store.insert_user("zhang san", "123456").await.unwrap();
	let service = build_service(&hub, Arc::clone(&store));

	let (conn, mut rx) = connection(1);
	login(&service, &conn, &mut rx, user).await;

	service.client_close(&conn).await;

	assert!(service.registry().is_empty());
	assert!(!hub.is_subscribed(user));
	let persisted = store.find_user(user).await.unwrap().expect("user exists");
	assert_eq!(persisted.state, Presence::Offline);
}

#[tokio::test]
async fn disconnect_of_never_logged_in_connection_is_a_silent_noop() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let user = store.insert_user("zhang san", "123456").await.unwrap();
	let service = build_service(&hub, Arc::clone(&store));

	let (logged_in, mut rx) = connection(1);
	login(&service, &logged_in, &mut rx, user).await;

	let (stranger, _stranger_rx) = connection(2);
	service.client_close(&stranger).await;

	assert_eq!(service.registry().len(), 1);
	let persisted = store.find_user(user).await.unwrap().expect("user exists");
	assert_eq!(persisted.state, Presence::Online);
}

#[tokio::test]
async fn register_returns_assigned_id_and_rejects_conflicts() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let service = build_service(&hub, Arc::clone(&store));

	let (conn, mut rx) = connection(1);
	service
		.dispatch(
			&conn,
			MsgId::Register.code(),
			json!({"msgid": MsgId::Register.code(), "name": "li si", "password": "666666"}),
			0,
		)
		.await;

	let ack: RegisterAck = serde_json::from_str(&recv_frame(&mut rx).await).unwrap();
	assert_eq!(ack.errno, ERRNO_OK);
	let id = ack.id.expect("assigned id");
	assert!(store.find_user(id).await.unwrap().is_some());

	service
		.dispatch(
			&conn,
			MsgId::Register.code(),
			json!({"msgid": MsgId::Register.code(), "name": "li si", "password": "other"}),
			0,
		)
		.await;
	let ack: RegisterAck = serde_json::from_str(&recv_frame(&mut rx).await).unwrap();
	assert_eq!(ack.errno, ERRNO_REJECTED);
	assert!(ack.id.is_none());

	// Registration has no presence side effects.
	assert!(service.registry().is_empty());
}

#[tokio::test]
async fn one_chat_between_two_local_users_stays_off_the_bus() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let a = store.insert_user("zhang san", "123456").await.unwrap();
	let b = store.insert_user("li si", "123456").await.unwrap();
	let service = build_service(&hub, Arc::clone(&store));

	let (conn_a, mut rx_a) = connection(1);
	login(&service, &conn_a, &mut rx_a, a).await;
	let (conn_b, mut rx_b) = connection(2);
	login(&service, &conn_b, &mut rx_b, b).await;

	let chat = json!({"msgid": MsgId::OneChat.code(), "id": a.0, "from": "zhang san", "toid": b.0, "msg": "hello"});
	let expected = chat.to_string();
	service.dispatch(&conn_a, MsgId::OneChat.code(), chat, 0).await;

	assert_eq!(recv_frame(&mut rx_b).await, expected);
	assert_eq!(hub.publish_count(), 0);
	assert!(store.drain_offline(b).await.unwrap().is_empty());
}

#[tokio::test]
async fn one_chat_to_offline_user_is_stored() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let a = store.insert_user("zhang san", "123456").await.unwrap();
	let b = store.insert_user("li si", "123456").await.unwrap();
	let service = build_service(&hub, Arc::clone(&store));

	let (conn_a, mut rx_a) = connection(1);
	login(&service, &conn_a, &mut rx_a, a).await;

	let chat = json!({"msgid": MsgId::OneChat.code(), "id": a.0, "toid": b.0, "msg": "see you"});
	let expected = chat.to_string();
	service.dispatch(&conn_a, MsgId::OneChat.code(), chat, 0).await;

	assert_eq!(hub.publish_count(), 0);
	assert_eq!(store.drain_offline(b).await.unwrap(), vec![expected]);
}

#[tokio::test]
async fn group_chat_mixed_members_scenario() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let sender = store.insert_user("u1", "123456").await.unwrap();
	let local = store.insert_user("u2", "123456").await.unwrap();
	let away = store.insert_user("u3", "123456").await.unwrap();

	let group = store.create_group("trio", "three of us").await.unwrap();
	for (user, role) in [
		(sender, parley_domain::GroupRole::Creator),
		(local, parley_domain::GroupRole::Normal),
		(away, parley_domain::GroupRole::Normal),
	] {
		store.join_group(user, group, role).await.unwrap();
	}

	let service = build_service(&hub, Arc::clone(&store));
	let (conn_sender, mut rx_sender) = connection(1);
	login(&service, &conn_sender, &mut rx_sender, sender).await;
	let (conn_local, mut rx_local) = connection(2);
	login(&service, &conn_local, &mut rx_local, local).await;

	let chat = json!({"msgid": MsgId::GroupChat.code(), "id": sender.0, "groupid": group.0, "msg": "standup?"});
	let expected = chat.to_string();
	service.dispatch(&conn_sender, MsgId::GroupChat.code(), chat, 0).await;

	assert_eq!(recv_frame(&mut rx_local).await, expected);
	assert_eq!(store.drain_offline(away).await.unwrap(), vec![expected]);
	assert!(rx_sender.try_recv().is_err());
	assert_eq!(hub.publish_count(), 0);
}

#[tokio::test]
async fn one_chat_to_user_on_another_instance_relays_over_the_bus() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let a = store.insert_user("zhang san", "123456").await.unwrap();
	let b = store.insert_user("li si", "123456").await.unwrap();

	// Two engine instances sharing one persistence layer and one bus.
	let instance_a = build_service(&hub, Arc::clone(&store));
	let instance_b = bridged_service(&hub, Arc::clone(&store));

	let (conn_b, mut rx_b) = connection(20);
	login(&instance_b, &conn_b, &mut rx_b, b).await;
	let (conn_a, mut rx_a) = connection(10);
	login(&instance_a, &conn_a, &mut rx_a, a).await;

	let chat = json!({"msgid": MsgId::OneChat.code(), "id": a.0, "from": "zhang san", "toid": b.0, "msg": "ping"});
	let expected = chat.to_string();
	instance_a.dispatch(&conn_a, MsgId::OneChat.code(), chat, 0).await;

	assert_eq!(recv_frame(&mut rx_b).await, expected);
	assert_eq!(hub.publishes_to(b), 1);
	assert!(store.drain_offline(b).await.unwrap().is_empty());
}

#[tokio::test]
async fn startup_reset_repairs_stale_presence() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let a = store.insert_user("a", "pw").await.unwrap();
	let b = store.insert_user("b", "pw").await.unwrap();
	store.update_user_state(a, Presence::Online).await.unwrap();
	store.update_user_state(b, Presence::Online).await.unwrap();

	let service = build_service(&hub, Arc::clone(&store));
	service.reset_on_startup().await;

	for user in [a, b] {
		let persisted = store.find_user(user).await.unwrap().expect("user exists");
		assert_eq!(persisted.state, Presence::Offline);
	}
	assert!(service.registry().is_empty());
}

#[tokio::test]
async fn malformed_payloads_are_ignored_without_reply() {
	let hub = MemoryBusHub::new();
	let store = Arc::new(MemoryStore::new());
	let service = build_service(&hub, Arc::clone(&store));

	let (conn, mut rx) = connection(1);
	let malformed: Value = json!({"msgid": MsgId::Login.code(), "id": "not a number"});
	service.dispatch(&conn, MsgId::Login.code(), malformed, 0).await;

	assert!(rx.try_recv().is_err());
	assert!(service.registry().is_empty());
}
