use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use shardrpc_common::protocol::{Result, ShardRpcError};

/// Boxed error a handler may raise; converted to an `Error`-status
/// response by the dispatcher.
pub type HandlerFailure = Box<dyn std::error::Error + Send + Sync>;

type RawHandlerFn = dyn Fn(&[u8]) -> std::result::Result<Bytes, HandlerFailure> + Send + Sync;

/// Encodes and decodes a handler's typed messages to and from payload
/// bytes.
pub trait MessageCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// The stock codec: serde_json.
///
/// # Example
///
/// ```
/// use shardrpc_server::{JsonCodec, MessageCodec};
///
/// let codec = JsonCodec::<Vec<u32>>::new();
/// let encoded = codec.encode(&vec![1, 2, 3]).unwrap();
/// assert_eq!(codec.decode(&encoded).unwrap(), vec![1, 2, 3]);
/// ```
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageCodec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Bytes> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| ShardRpcError::Decode(format!("failed to encode message: {e}")))?;
        Ok(Bytes::from(encoded))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| ShardRpcError::Decode(format!("failed to decode message: {e}")))
    }
}

/// A registered handler, ready to invoke on raw payload bytes.
#[derive(Clone)]
pub struct HandlerEntry {
    message_name: String,
    handler: Arc<RawHandlerFn>,
}

impl HandlerEntry {
    pub fn message_name(&self) -> &str {
        &self.message_name
    }

    pub fn invoke(&self, payload: &[u8]) -> std::result::Result<Bytes, HandlerFailure> {
        (self.handler)(payload)
    }
}

/// Message name to handler mapping.
///
/// Read-mostly: lookups clone an `Arc` of the whole map, registration
/// replaces the map whole. Re-registering a name replaces the entry
/// without error, which allows hot reconfiguration.
pub struct HandlerRegistry {
    entries: RwLock<Arc<HashMap<String, HandlerEntry>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            entries: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Registers a typed handler with explicit payload codecs.
    ///
    /// The handler runs on a request worker thread; it may block.
    ///
    /// # Arguments
    /// * `message_name` - the routing key; re-registration replaces
    /// * `handler` - the request function
    /// * `input_codec` / `output_codec` - payload codecs for the request
    ///   and response messages
    pub fn register<Req, Res, F>(
        &self,
        message_name: impl Into<String>,
        handler: F,
        input_codec: impl MessageCodec<Req> + 'static,
        output_codec: impl MessageCodec<Res> + 'static,
    ) where
        Req: 'static,
        Res: 'static,
        F: Fn(Req) -> std::result::Result<Res, HandlerFailure> + Send + Sync + 'static,
    {
        self.register_raw(message_name, move |payload| {
            let request = input_codec.decode(payload)?;
            let response = handler(request)?;
            Ok(output_codec.encode(&response)?)
        });
    }

    /// Registers a handler working directly on payload bytes.
    pub fn register_raw<F>(&self, message_name: impl Into<String>, handler: F)
    where
        F: Fn(&[u8]) -> std::result::Result<Bytes, HandlerFailure> + Send + Sync + 'static,
    {
        let message_name = message_name.into();
        let entry = HandlerEntry {
            message_name: message_name.clone(),
            handler: Arc::new(handler),
        };

        let mut entries = self.entries.write().unwrap();
        let mut replacement = HashMap::clone(&entries);
        replacement.insert(message_name, entry);
        *entries = Arc::new(replacement);
    }

    /// Looks up the handler for a message name.
    pub fn lookup(&self, message_name: &str) -> Option<HandlerEntry> {
        self.entries.read().unwrap().get(message_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
