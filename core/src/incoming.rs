//! Incoming Messages
//!
//! Typed representation of inbound frames and the deserializer that
//! produces them from raw socket frames.

use crate::transport::RawFrame;
use crate::wire::{self, JsonObject};

/// Inbound frame discriminator, the first pipe-delimited token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Reply to a request.
    Response,
    /// Unsolicited server-push frame.
    Event,
    /// Error reply to a request.
    ResponseError,
}

impl MessageType {
    /// Map a frame's first token to a message type, if recognized.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "Response" => Some(Self::Response),
            "Event" => Some(Self::Event),
            "ResponseError" => Some(Self::ResponseError),
            _ => None,
        }
    }
}

/// A decoded inbound message.
///
/// Every field except `full_message` is optional: decoding is tolerant
/// and a frame that matches no known shape still produces a message
/// suitable for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct IncomingMessage {
    /// Frame type, `None` for unrecognized frames.
    pub message_type: Option<MessageType>,
    /// Correlation id for `Response`/`ResponseError` frames.
    pub request_id: Option<i64>,
    /// Raw body text past the header tokens.
    pub body_string: Option<String>,
    /// Body parsed as a JSON object, when it is one.
    pub body: Option<JsonObject>,
    /// For `ResponseError` frames, the body retained as an error string.
    pub debug_error: Option<String>,
    /// The complete raw frame as received.
    pub full_message: String,
}

/// Result of interpreting a response body as an event list.
#[derive(Debug, Default)]
pub struct ParsedEvents {
    /// Well-formed event objects, when the body carried an `EventList`.
    pub events: Option<Vec<JsonObject>>,
    /// Error description when the list could not be produced.
    pub error_message: Option<String>,
}

impl IncomingMessage {
    /// Interpret this message's body as `{"EventList": [...]}`.
    ///
    /// Used by transcript fetches. `ResponseError` frames yield their
    /// error string; a body without a well-formed list yields a
    /// "no results" error. Entries that are not JSON objects are
    /// skipped.
    #[must_use]
    pub fn parse_events(&self) -> ParsedEvents {
        if self.message_type == Some(MessageType::ResponseError) {
            return ParsedEvents {
                events: None,
                error_message: Some(
                    self.debug_error
                        .clone()
                        .unwrap_or_else(|| "request failed".to_string()),
                ),
            };
        }

        let list = self
            .body
            .as_ref()
            .and_then(|body| body.get("EventList"))
            .and_then(serde_json::Value::as_array);
        let Some(list) = list else {
            return ParsedEvents {
                events: None,
                error_message: Some("No results returned from server".to_string()),
            };
        };

        let events: Vec<JsonObject> = list
            .iter()
            .filter_map(|entry| entry.as_object().cloned())
            .collect();
        if events.len() < list.len() {
            tracing::warn!(
                skipped = list.len() - events.len(),
                "skipped malformed entries in event list"
            );
        }
        ParsedEvents {
            events: Some(events),
            error_message: None,
        }
    }
}

/// Deserializer for raw socket frames.
///
/// Binary frames are decoded as UTF-8 text when possible; undecodable
/// binary produces a typeless diagnostic message.
#[derive(Clone, Copy, Debug, Default)]
pub struct IncomingMessageDeserializer;

impl IncomingMessageDeserializer {
    /// Decode a raw frame into an [`IncomingMessage`].
    #[must_use]
    pub fn deserialize(&self, frame: &RawFrame) -> IncomingMessage {
        match frame {
            RawFrame::Text(text) => wire::decode_frame(text),
            RawFrame::Binary(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => wire::decode_frame(text),
                Err(e) => {
                    tracing::warn!(error = %e, len = bytes.len(), "undecodable binary frame");
                    IncomingMessage {
                        full_message: format!("<binary frame, {} bytes>", bytes.len()),
                        ..IncomingMessage::default()
                    }
                }
            },
        }
    }
}
