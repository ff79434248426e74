use bytes::Bytes;

/// Delivery status carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Normal request or successful response
    Ok = 0,
    /// Failed response; `error_message` carries the cause
    Error = 1,
    /// Liveness probe, answered by the connection pipeline without dispatch
    Heartbeat = 2,
}

impl Status {
    /// Decodes a status byte from the wire.
    pub fn from_u8(raw: u8) -> Option<Status> {
        match raw {
            0 => Some(Status::Ok),
            1 => Some(Status::Error),
            2 => Some(Status::Heartbeat),
            _ => None,
        }
    }
}

/// The message exchanged between ShardRPC peers, in both directions.
///
/// A request carries the handler routing key in `message_name` and an opaque
/// payload; the matching response echoes the 128-bit request identifier
/// unchanged so the client can correlate replies that arrive out of order.
///
/// # Request Flow
///
/// 1. Client builds an envelope with [`RequestEnvelope::request`]
/// 2. The envelope is encoded and sent as one length-prefixed frame
/// 3. The server dispatches it to the handler registered under
///    `message_name` and answers with [`RequestEnvelope::reply`] or
///    [`RequestEnvelope::error_reply`]
///
/// # Example
///
/// ```
/// use shardrpc_common::protocol::{RequestEnvelope, Status};
/// use bytes::Bytes;
///
/// let request = RequestEnvelope::request(42, "echo", Bytes::from_static(b"hi"));
/// assert_eq!(request.status, Status::Ok);
///
/// let reply = request.error_reply("no such handler");
/// assert_eq!(reply.request_id(), 42);
/// assert_eq!(reply.status, Status::Error);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Upper half of the 128-bit request identifier
    pub request_id_high: u64,
    /// Lower half of the 128-bit request identifier
    pub request_id_low: u64,
    /// Handler routing key
    pub message_name: String,
    /// Delivery status
    pub status: Status,
    /// Handler-opaque payload bytes
    pub payload: Bytes,
    /// Human-readable cause, present when `status` is [`Status::Error`]
    pub error_message: Option<String>,
}

impl RequestEnvelope {
    /// Creates a request envelope from a combined 128-bit identifier.
    pub fn request(request_id: u128, message_name: impl Into<String>, payload: Bytes) -> Self {
        RequestEnvelope {
            request_id_high: (request_id >> 64) as u64,
            request_id_low: request_id as u64,
            message_name: message_name.into(),
            status: Status::Ok,
            payload,
            error_message: None,
        }
    }

    /// Creates a heartbeat probe with the given identifier.
    pub fn heartbeat(request_id: u128) -> Self {
        RequestEnvelope {
            request_id_high: (request_id >> 64) as u64,
            request_id_low: request_id as u64,
            message_name: String::new(),
            status: Status::Heartbeat,
            payload: Bytes::new(),
            error_message: None,
        }
    }

    /// The combined 128-bit request identifier.
    pub fn request_id(&self) -> u128 {
        ((self.request_id_high as u128) << 64) | self.request_id_low as u128
    }

    /// Builds the successful response to this request.
    ///
    /// The request identifier and message name are echoed unchanged.
    pub fn reply(&self, payload: Bytes) -> Self {
        RequestEnvelope {
            request_id_high: self.request_id_high,
            request_id_low: self.request_id_low,
            message_name: self.message_name.clone(),
            status: Status::Ok,
            payload,
            error_message: None,
        }
    }

    /// Builds the failed response to this request.
    pub fn error_reply(&self, error: impl Into<String>) -> Self {
        RequestEnvelope {
            request_id_high: self.request_id_high,
            request_id_low: self.request_id_low,
            message_name: self.message_name.clone(),
            status: Status::Error,
            payload: Bytes::new(),
            error_message: Some(error.into()),
        }
    }

    /// Builds the heartbeat echo for this probe.
    pub fn heartbeat_reply(&self) -> Self {
        RequestEnvelope {
            request_id_high: self.request_id_high,
            request_id_low: self.request_id_low,
            message_name: String::new(),
            status: Status::Heartbeat,
            payload: Bytes::new(),
            error_message: None,
        }
    }
}
