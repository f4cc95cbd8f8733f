#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::StreamExt;
use parley_domain::UserId;
use redis::aio::{MultiplexedConnection, PubSubSink};
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

/// Queue depth between the bus listener and the bridge task.
const BUS_INBOUND_QUEUE: usize = 1024;

/// A payload pushed on a user's channel by another instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
	pub channel: UserId,
	pub payload: String,
}

/// Cross-process publish/subscribe bus, one channel per user id.
///
/// All operations are best-effort: failures are logged and reported as
/// `false`, never raised to the client.
#[async_trait]
pub trait Bus: Send + Sync {
	async fn publish(&self, channel: UserId, payload: &str) -> bool;

	async fn subscribe(&self, channel: UserId) -> bool;

	async fn unsubscribe(&self, channel: UserId) -> bool;
}

/// Redis-backed bus. One multiplexed connection carries PUBLISH commands;
/// a second, dedicated pub/sub connection is split into a sink (subscribe /
/// unsubscribe) and a stream drained by a listener task that forwards pushes
/// into the returned queue. The listener performs no application logic, so
/// it can never be blocked by a slow handler.
pub struct RedisBus {
	publish_conn: MultiplexedConnection,
	sink: Mutex<PubSubSink>,
}

impl RedisBus {
	/// Connect both bus connections and spawn the listener task.
	///
	/// The receiver carries every push for channels this instance is
	/// subscribed to; the caller wires it to the bridge task.
	pub async fn connect(url: &str) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<BusMessage>)> {
		let client = redis::Client::open(url).context("open redis client")?;

		let publish_conn = client
			.get_multiplexed_tokio_connection()
			.await
			.context("connect redis (publish)")?;

		let pubsub = client.get_async_pubsub().await.context("connect redis (subscribe)")?;
		let (sink, mut stream) = pubsub.split();

		let (tx, rx) = mpsc::channel(BUS_INBOUND_QUEUE);
		tokio::spawn(async move {
			while let Some(msg) = stream.next().await {
				let channel = msg.get_channel_name().to_string();
				let Ok(id) = channel.parse::<i64>() else {
					warn!(channel = %channel, "ignoring bus push on non-numeric channel");
					continue;
				};

				let payload = match msg.get_payload::<String>() {
					Ok(payload) => payload,
					Err(e) => {
						warn!(channel = %channel, error = %e, "undecodable bus payload");
						continue;
					}
				};

				metrics::counter!("parley_server_bus_received_total").increment(1);
				if tx
					.send(BusMessage {
						channel: UserId(id),
						payload,
					})
					.await
					.is_err()
				{
					break;
				}
			}

			info!("bus listener exited (subscribe stream closed)");
		});

		Ok((
			Arc::new(Self {
				publish_conn,
				sink: Mutex::new(sink),
			}),
			rx,
		))
	}
}

#[async_trait]
impl Bus for RedisBus {
	async fn publish(&self, channel: UserId, payload: &str) -> bool {
		let mut conn = self.publish_conn.clone();
		match redis::cmd("PUBLISH")
			.arg(channel.0)
			.arg(payload)
			.query_async::<i64>(&mut conn)
			.await
		{
			Ok(_) => {
				metrics::counter!("parley_server_bus_published_total").increment(1);
				true
			}
			Err(e) => {
				warn!(channel = %channel, error = %e, "bus publish failed, message may be lost");
				false
			}
		}
	}

	async fn subscribe(&self, channel: UserId) -> bool {
		// The sink mutex keeps subscribe/unsubscribe for a user strictly
		// ordered and never overlapping in flight.
		let mut sink = self.sink.lock().await;
		match sink.subscribe(channel.0).await {
			Ok(()) => true,
			Err(e) => {
				warn!(channel = %channel, error = %e, "bus subscribe failed");
				false
			}
		}
	}

	async fn unsubscribe(&self, channel: UserId) -> bool {
		let mut sink = self.sink.lock().await;
		match sink.unsubscribe(channel.0).await {
			Ok(()) => true,
			Err(e) => {
				warn!(channel = %channel, error = %e, "bus unsubscribe failed");
				false
			}
		}
	}
}

/// Bus stand-in for running without Redis: cross-process delivery is
/// disabled but purely-local chat keeps working.
pub struct NullBus;

#[async_trait]
impl Bus for NullBus {
	async fn publish(&self, channel: UserId, _payload: &str) -> bool {
		warn!(channel = %channel, "bus disabled, dropping cross-instance message");
		false
	}

	async fn subscribe(&self, _channel: UserId) -> bool {
		true
	}

	async fn unsubscribe(&self, _channel: UserId) -> bool {
		true
	}
}
