use std::any::Any;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use shardrpc_common::protocol::RequestEnvelope;

/// Per-request server-side record.
///
/// Created by the connection pipeline when an envelope is decoded, armed
/// with deadlines by the executor at submission, threaded through the
/// filter chain (which may attach attributes), and dropped after the
/// response is handed to the completion callback.
pub struct RequestContext {
    pub envelope: RequestEnvelope,
    /// When the envelope was decoded
    pub received_at: Instant,
    /// Instant after which a queued request is shed rather than executed
    pub queue_deadline: Instant,
    /// Instant after which an executing handler's result is abandoned
    pub service_deadline: Option<Instant>,
    attributes: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub fn new(envelope: RequestEnvelope) -> Self {
        let received_at = Instant::now();
        RequestContext {
            envelope,
            received_at,
            queue_deadline: received_at,
            service_deadline: None,
            attributes: HashMap::new(),
        }
    }

    /// Stamps both deadlines relative to `received_at`.
    ///
    /// Called once by the executor with the timeouts in force at
    /// submission time.
    pub(crate) fn arm_deadlines(
        &mut self,
        request_timeout: Duration,
        response_generation_timeout: Option<Duration>,
    ) {
        self.queue_deadline = self.received_at + request_timeout;
        self.service_deadline = response_generation_timeout.map(|t| self.received_at + t);
    }

    pub fn message_name(&self) -> &str {
        &self.envelope.message_name
    }

    /// Attaches an attribute for downstream filters or the handler side of
    /// the chain.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Any + Send + Sync) {
        self.attributes.insert(key.into(), Box::new(value));
    }

    /// Reads an attribute previously attached under `key`.
    pub fn attribute<T: Any>(&self, key: &str) -> Option<&T> {
        self.attributes.get(key).and_then(|v| v.downcast_ref())
    }
}
