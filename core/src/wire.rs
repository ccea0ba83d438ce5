//! Wire Codec
//!
//! Pipe-delimited text framing shared by the serializer and the
//! deserializer.
//!
//! # Frame Formats
//!
//! Outgoing request:
//! ```text
//! {path}|{request_id}|{context_json}|{params_json}
//! ```
//!
//! Incoming frames:
//! ```text
//! Response|{request_id}|{body}
//! ResponseError|{request_id}|{body}
//! Event|{body}
//! ```
//!
//! The body of a frame may itself contain `|`, so decoding rejoins every
//! token past the fixed header positions.

use serde_json::Value;

use crate::incoming::{IncomingMessage, MessageType};

/// Dynamic JSON mapping used for params, context, and message bodies.
pub type JsonObject = serde_json::Map<String, Value>;

/// Serialize a mapping for the wire.
///
/// An absent or empty mapping renders as the empty string, not `"{}"`.
/// The server distinguishes the two; this is a compatibility constant.
#[must_use]
pub fn stringify(mapping: Option<&JsonObject>) -> String {
    match mapping {
        Some(map) if !map.is_empty() => {
            serde_json::to_string(&Value::Object(map.clone())).unwrap_or_default()
        }
        _ => String::new(),
    }
}

/// Encode an outgoing request frame.
#[must_use]
pub fn encode_request(
    path: &str,
    request_id: i64,
    context: Option<&JsonObject>,
    params: Option<&JsonObject>,
) -> String {
    format!(
        "{}|{}|{}|{}",
        path,
        request_id,
        stringify(context),
        stringify(params)
    )
}

/// Decode an inbound text frame into an [`IncomingMessage`].
///
/// Decoding never fails: an unrecognized first token yields a typeless
/// message carrying only the raw frame, so a malformed peer frame is
/// loggable without tearing the connection down.
#[must_use]
pub fn decode_frame(raw: &str) -> IncomingMessage {
    let mut message = IncomingMessage {
        full_message: raw.to_string(),
        ..IncomingMessage::default()
    };

    let tokens: Vec<&str> = raw.split('|').collect();
    let Some(message_type) = MessageType::from_token(tokens[0]) else {
        return message;
    };
    message.message_type = Some(message_type);

    match message_type {
        MessageType::Event => {
            if tokens.len() > 1 {
                message.body_string = Some(tokens[1..].join("|"));
            }
        }
        MessageType::Response | MessageType::ResponseError => {
            if tokens.len() > 1 {
                message.request_id = tokens[1].trim().parse::<i64>().ok();
            }
            if tokens.len() > 2 {
                message.body_string = Some(tokens[2..].join("|"));
            }
        }
    }

    if let Some(body_string) = &message.body_string {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body_string) {
            message.body = Some(map);
        }
    }

    if message_type == MessageType::ResponseError {
        message.debug_error = message.body_string.clone();
    }

    message
}
