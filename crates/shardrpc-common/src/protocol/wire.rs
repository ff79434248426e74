//! Binary envelope codec and length-prefixed framing.
//!
//! # Envelope Layout
//!
//! An encoded envelope is a sequence of tagged fields. Each field starts
//! with a one-byte tag; fixed fields are followed by their big-endian
//! value, variable fields by a u32 big-endian byte length and the bytes.
//!
//! | Tag | Field           | Encoding                  |
//! |-----|-----------------|---------------------------|
//! | 1   | request_id_high | fixed u64                 |
//! | 2   | request_id_low  | fixed u64                 |
//! | 3   | message_name    | length-prefixed UTF-8     |
//! | 4   | status          | u8                        |
//! | 5   | payload         | length-prefixed bytes     |
//! | 6   | error_message   | length-prefixed UTF-8     |
//!
//! Tag 6 is written only for `Status::Error` envelopes. Unknown tags are a
//! decode error. Decoding is zero-copy: `payload` is a slice of the frame
//! buffer.
//!
//! # Framing
//!
//! Each envelope travels as `[u32 big-endian length N] + [N bytes]`. The
//! maximum frame size is `i32::MAX`; larger length prefixes poison the
//! connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::protocol::envelope::{RequestEnvelope, Status};
use crate::protocol::error::{Result, ShardRpcError};

/// Maximum frame size accepted on the wire.
pub const MAX_FRAME_SIZE: usize = i32::MAX as usize;

const TAG_REQUEST_ID_HIGH: u8 = 1;
const TAG_REQUEST_ID_LOW: u8 = 2;
const TAG_MESSAGE_NAME: u8 = 3;
const TAG_STATUS: u8 = 4;
const TAG_PAYLOAD: u8 = 5;
const TAG_ERROR_MESSAGE: u8 = 6;

/// Encodes an envelope to its tagged binary form, without the frame header.
pub fn encode_envelope(envelope: &RequestEnvelope) -> Bytes {
    let error_len = envelope.error_message.as_ref().map_or(0, |m| m.len() + 5);
    let mut buf = BytesMut::with_capacity(
        34 + envelope.message_name.len() + envelope.payload.len() + error_len,
    );

    buf.put_u8(TAG_REQUEST_ID_HIGH);
    buf.put_u64(envelope.request_id_high);
    buf.put_u8(TAG_REQUEST_ID_LOW);
    buf.put_u64(envelope.request_id_low);
    buf.put_u8(TAG_MESSAGE_NAME);
    put_len_prefixed(&mut buf, envelope.message_name.as_bytes());
    buf.put_u8(TAG_STATUS);
    buf.put_u8(envelope.status as u8);
    buf.put_u8(TAG_PAYLOAD);
    put_len_prefixed(&mut buf, &envelope.payload);
    if let Some(message) = &envelope.error_message {
        buf.put_u8(TAG_ERROR_MESSAGE);
        put_len_prefixed(&mut buf, message.as_bytes());
    }

    buf.freeze()
}

/// Decodes an envelope from a frame body.
///
/// The payload of the returned envelope is a zero-copy slice of `frame`;
/// callers that outlive the frame take a defensive copy themselves.
pub fn decode_envelope(mut frame: Bytes) -> Result<RequestEnvelope> {
    let mut envelope = RequestEnvelope {
        request_id_high: 0,
        request_id_low: 0,
        message_name: String::new(),
        status: Status::Ok,
        payload: Bytes::new(),
        error_message: None,
    };

    while frame.has_remaining() {
        let tag = frame.get_u8();
        match tag {
            TAG_REQUEST_ID_HIGH => envelope.request_id_high = take_u64(&mut frame)?,
            TAG_REQUEST_ID_LOW => envelope.request_id_low = take_u64(&mut frame)?,
            TAG_MESSAGE_NAME => {
                envelope.message_name = take_string(&mut frame, "message name")?;
            }
            TAG_STATUS => {
                if !frame.has_remaining() {
                    return Err(truncated("status"));
                }
                let raw = frame.get_u8();
                envelope.status = Status::from_u8(raw)
                    .ok_or_else(|| ShardRpcError::Decode(format!("unknown status {raw}")))?;
            }
            TAG_PAYLOAD => envelope.payload = take_len_prefixed(&mut frame, "payload")?,
            TAG_ERROR_MESSAGE => {
                envelope.error_message = Some(take_string(&mut frame, "error message")?);
            }
            other => {
                return Err(ShardRpcError::Decode(format!("unknown field tag {other}")));
            }
        }
    }

    Ok(envelope)
}

/// Reads one length-prefixed frame from the stream.
///
/// Returns `Ok(None)` when the peer closed the connection at a frame
/// boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(ShardRpcError::Connection(format!(
                "failed to read frame length: {e}"
            )));
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        warn!(frame_len = len, "oversized frame length prefix, poisoning connection");
        return Err(ShardRpcError::Decode(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| ShardRpcError::Connection(format!("failed to read frame body: {e}")))?;

    Ok(Some(Bytes::from(buf)))
}

/// Writes one length-prefixed frame to the stream.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ShardRpcError::Decode(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte limit",
            frame.len()
        )));
    }

    writer
        .write_all(&(frame.len() as u32).to_be_bytes())
        .await
        .map_err(|e| ShardRpcError::Connection(format!("failed to write frame length: {e}")))?;
    writer
        .write_all(frame)
        .await
        .map_err(|e| ShardRpcError::Connection(format!("failed to write frame body: {e}")))?;
    Ok(())
}

/// Reads and decodes one envelope; `None` on clean connection close.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<RequestEnvelope>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(frame) => Ok(Some(decode_envelope(frame)?)),
        None => Ok(None),
    }
}

/// Encodes and writes one envelope as a single frame.
pub async fn write_envelope<W>(writer: &mut W, envelope: &RequestEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &encode_envelope(envelope)).await
}

fn put_len_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn take_u64(frame: &mut Bytes) -> Result<u64> {
    if frame.remaining() < 8 {
        return Err(truncated("u64 field"));
    }
    Ok(frame.get_u64())
}

fn take_len_prefixed(frame: &mut Bytes, field: &str) -> Result<Bytes> {
    if frame.remaining() < 4 {
        return Err(truncated(field));
    }
    let len = frame.get_u32() as usize;
    if frame.remaining() < len {
        return Err(truncated(field));
    }
    Ok(frame.split_to(len))
}

fn take_string(frame: &mut Bytes, field: &str) -> Result<String> {
    let bytes = take_len_prefixed(frame, field)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ShardRpcError::Decode(format!("{field} is not valid UTF-8")))
}

fn truncated(field: &str) -> ShardRpcError {
    ShardRpcError::Decode(format!("envelope truncated in {field}"))
}
