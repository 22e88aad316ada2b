//! The message type carried between broker, sidecar, and function.

use std::collections::HashMap;

/// An opaque payload plus string headers.
///
/// Headers travel with the message through the dispatcher: the HTTP adapter
/// maps them onto HTTP headers, the gRPC adapter onto the request's header
/// map, and broker transports onto their native header support.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    payload: Vec<u8>,
    headers: HashMap<String, String>,
}

impl Message {
    /// Create a message with the given payload and no headers.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    /// Create a message from payload and headers.
    pub fn from_parts(payload: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self { payload, headers }
    }

    /// Builder-style header attachment.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Deconstruct into payload and headers.
    pub fn into_parts(self) -> (Vec<u8>, HashMap<String, String>) {
        (self.payload, self.headers)
    }
}
