#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},
}

/// Encode a serialized message into a length-prefixed frame.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(4 + payload.len());
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(payload);
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
	encode_frame(payload, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into(buf: &mut BytesMut, payload: &[u8], max_frame_size: usize) -> Result<(), FramingError> {
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	buf.reserve(4 + payload.len());
	buf.put_u32(payload.len() as u32);
	buf.extend_from_slice(payload);
	Ok(())
}

/// Decode a single frame from the start of `src`, returning the payload and bytes consumed.
pub fn decode_frame(src: &[u8], max_frame_size: usize) -> Result<(&[u8], usize), FramingError> {
	if src.len() < 4 {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = 4 + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	Ok((&src[4..need], need))
}

/// Try to decode a single frame payload from a growable buffer.
pub fn try_decode_frame_from_buffer(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>, FramingError> {
	if buf.len() < 4 {
		return Ok(None);
	}

	let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = 4 + len;
	if buf.len() < need {
		return Ok(None);
	}

	let mut frame = buf.split_to(need);
	let _ = frame.split_to(4);
	Ok(Some(frame.freeze()))
}
