#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::BytesMut;
use parley_protocol::framing;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::registry::ConnectionHandle;
use crate::server::service::ChatService;
use crate::util::time::unix_ms_now;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Maximum frame payload size, inbound and outbound.
	pub max_frame_size: usize,

	/// Outbound queue depth; senders never block, overflow drops frames.
	pub outbound_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_size: framing::DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
		}
	}
}

/// Drive one client connection: a writer task drains the outbound queue
/// while this task decodes inbound frames and dispatches them in order.
/// Exactly one dispatch runs at a time per connection, preserving
/// per-connection message order. Reader exit — clean or not — runs the
/// disconnect path.
pub async fn handle_connection(
	conn_id: u64,
	stream: TcpStream,
	service: Arc<ChatService>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	let (mut read_half, mut write_half) = stream.into_split();

	let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(settings.outbound_queue_capacity);
	let handle = ConnectionHandle::new(conn_id, outbound_tx);

	let max_frame_size = settings.max_frame_size;
	let writer = tokio::spawn(async move {
		while let Some(payload) = outbound_rx.recv().await {
			let frame = match framing::encode_frame(payload.as_bytes(), max_frame_size) {
				Ok(frame) => frame,
				Err(e) => {
					warn!(conn_id, error = %e, "dropping oversized outbound message");
					continue;
				}
			};

			if let Err(e) = write_half.write_all(&frame).await {
				debug!(conn_id, error = %e, "outbound write failed, stopping writer");
				break;
			}
		}
	});

	let mut buf = BytesMut::with_capacity(4096);
	loop {
		match framing::try_decode_frame_from_buffer(&mut buf, settings.max_frame_size) {
			Ok(Some(payload)) => {
				let received_ms = unix_ms_now();
				match parley_protocol::decode_message(&payload) {
					Ok((msgid, msg)) => {
						service.dispatch(&handle, msgid, msg, received_ms).await;
					}
					Err(e) => {
						warn!(conn_id, error = %e, "ignoring undecodable frame");
					}
				}
				continue;
			}
			Ok(None) => {}
			Err(e) => {
				warn!(conn_id, error = %e, "framing violation, closing connection");
				break;
			}
		}

		match read_half.read_buf(&mut buf).await {
			Ok(0) => {
				debug!(conn_id, "connection closed by peer");
				break;
			}
			Ok(_) => {}
			Err(e) => {
				debug!(conn_id, error = %e, "read failed, closing connection");
				break;
			}
		}
	}

	service.client_close(&handle).await;

	// The registry entry is gone; dropping our handle closes the queue and
	// lets the writer drain whatever is already buffered.
	drop(handle);
	let _ = writer.await;

	Ok(())
}
