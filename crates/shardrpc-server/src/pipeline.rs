//! Per-connection inbound and outbound stages.
//!
//! Inbound: length-prefixed frame → envelope decode → [`RequestContext`] →
//! executor submission. Outbound is the mirror: executor result → response
//! envelope → frame write. The read loop never waits on handler work, and
//! responses are written as they complete, so a slow handler does not
//! queue later requests on the same connection behind it.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use shardrpc_common::protocol::{wire, RequestEnvelope, Result, ShardRpcError, Status};

use crate::context::RequestContext;
use crate::executor::{ExecutorResult, MessageExecutor};

/// Serves one accepted connection until the peer closes it or a protocol
/// error poisons it.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    executor: MessageExecutor,
    avoid_payload_copy: bool,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    // All responses funnel through one writer task; completion callbacks
    // run on request workers and must never touch the socket directly.
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<Bytes>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = response_rx.recv().await {
            if let Err(e) = wire::write_frame(&mut writer, &frame).await {
                debug!(error = %e, "response write failed, closing connection");
                break;
            }
        }
    });

    let result = read_loop(&mut reader, &response_tx, &executor, avoid_payload_copy).await;
    if let Err(e) = &result {
        warn!(%peer, error = %e, "connection poisoned");
    }

    drop(response_tx);
    let _ = writer_task.await;
    debug!(%peer, "connection closed");
    result
}

async fn read_loop(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    response_tx: &mpsc::UnboundedSender<Bytes>,
    executor: &MessageExecutor,
    avoid_payload_copy: bool,
) -> Result<()> {
    loop {
        let frame = match wire::read_frame(reader).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let mut envelope = wire::decode_envelope(frame)?;

        if envelope.status == Status::Heartbeat {
            let _ = response_tx.send(wire::encode_envelope(&envelope.heartbeat_reply()));
            continue;
        }

        if !avoid_payload_copy {
            envelope.payload = Bytes::from(envelope.payload.to_vec());
        }

        let request = ResponseTemplate::of(&envelope);
        let response_tx = response_tx.clone();
        executor.submit(
            RequestContext::new(envelope),
            Box::new(move |result| {
                let _ = response_tx.send(wire::encode_envelope(&request.render(result)));
            }),
        );
    }
}

/// The fields a response must echo, captured before the envelope is handed
/// to the executor.
struct ResponseTemplate {
    request_id_high: u64,
    request_id_low: u64,
    message_name: String,
}

impl ResponseTemplate {
    fn of(envelope: &RequestEnvelope) -> Self {
        ResponseTemplate {
            request_id_high: envelope.request_id_high,
            request_id_low: envelope.request_id_low,
            message_name: envelope.message_name.clone(),
        }
    }

    fn render(self, result: ExecutorResult) -> RequestEnvelope {
        let (status, payload, error_message) = match result {
            ExecutorResult::Response(payload) => (Status::Ok, payload, None),
            ExecutorResult::Timeout => {
                (Status::Error, Bytes::new(), Some(ShardRpcError::Timeout.to_string()))
            }
            ExecutorResult::HandlerError(message) => (
                Status::Error,
                Bytes::new(),
                Some(ShardRpcError::HandlerError(message).to_string()),
            ),
            ExecutorResult::Rejected => {
                (Status::Error, Bytes::new(), Some(ShardRpcError::Rejected.to_string()))
            }
            ExecutorResult::NoHandler(name) => (
                Status::Error,
                Bytes::new(),
                Some(ShardRpcError::NoHandler(name).to_string()),
            ),
        };

        RequestEnvelope {
            request_id_high: self.request_id_high,
            request_id_low: self.request_id_low,
            message_name: self.message_name,
            status,
            payload,
            error_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_echoes_identifier() {
        let request = RequestEnvelope::request(0x0123_4567_89AB_CDEF, "echo", Bytes::new());
        let template = ResponseTemplate::of(&request);
        let reply = template.render(ExecutorResult::Response(Bytes::from_static(b"hi")));

        assert_eq!(reply.request_id(), 0x0123_4567_89AB_CDEF);
        assert_eq!(reply.message_name, "echo");
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(&reply.payload[..], b"hi");
    }

    #[test]
    fn test_render_timeout_is_error_status() {
        let request = RequestEnvelope::request(5, "m", Bytes::new());
        let reply = ResponseTemplate::of(&request).render(ExecutorResult::Timeout);

        assert_eq!(reply.status, Status::Error);
        assert!(reply.error_message.unwrap().contains("timed out"));
    }

    #[test]
    fn test_render_no_handler_names_the_message() {
        let request = RequestEnvelope::request(5, "missing", Bytes::new());
        let reply =
            ResponseTemplate::of(&request).render(ExecutorResult::NoHandler("missing".into()));

        assert_eq!(reply.status, Status::Error);
        assert!(reply.error_message.unwrap().contains("missing"));
    }
}
