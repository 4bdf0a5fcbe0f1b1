//! Application message representation

use bytes::Bytes;

/// A framed WebSocket message.
///
/// Only `Text` and `Binary` messages are surfaced to the user; `Control`
/// carries ping/pong/close payloads that the framing layer has already
/// acted on and exists so queue accounting can describe them uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Control(Bytes),
}

impl Message {
    /// Payload length in bytes, as counted by the receive queue.
    pub fn size(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
            Message::Control(data) => data.len(),
        }
    }

    /// Whether this is an application message (text or binary).
    pub fn is_application(&self) -> bool {
        !matches!(self, Message::Control(_))
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(data))
    }
}
