use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const DEFAULT_ACTIVITY_TIMEOUT_SECS: u64 = 120;
pub const MAX_CHANNEL_NAME_BYTES: usize = 164;

pub const PING_FRAME: &str = r#"{"event":"pusher:ping","data":{}}"#;
pub const PONG_FRAME: &str = r#"{"event":"pusher:pong"}"#;

pub const EVENT_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const EVENT_SUBSCRIBE: &str = "pusher:subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const EVENT_PING: &str = "pusher:ping";
pub const EVENT_PONG: &str = "pusher:pong";
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const CLIENT_EVENT_PREFIX: &str = "client-";

const PRIVATE_PREFIX: &str = "private-";
const PRESENCE_PREFIX: &str = "presence-";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame missing field: {0}")]
    MissingField(&'static str),
}

/// Envelope as sent by clients. Only `event` is mandatory on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// `None` only when the field is absent; an explicit `null` is kept.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Envelope as sent by the hub. Field order on the wire is event, channel, data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    pub activity_timeout: u64,
}

impl OutboundEvent {
    /// `data` is a JSON string holding the socket id and activity timeout,
    /// which is how pusher clients expect it.
    pub fn connection_established(
        socket_id: &str,
        activity_timeout: u64,
    ) -> Result<Self, FrameError> {
        let payload = ConnectionEstablished {
            socket_id: socket_id.to_string(),
            activity_timeout,
        };
        let data =
            serde_json::to_string(&payload).map_err(|err| FrameError::Encode(err.to_string()))?;
        Ok(Self {
            event: EVENT_CONNECTION_ESTABLISHED.to_string(),
            channel: None,
            data: Some(Value::String(data)),
        })
    }

    pub fn subscription_succeeded(channel: &str) -> Self {
        Self {
            event: EVENT_SUBSCRIPTION_SUCCEEDED.to_string(),
            channel: Some(channel.to_string()),
            data: None,
        }
    }

    /// `data` is relayed as received, including its absence.
    pub fn client_event(event: &str, channel: &str, data: Option<Value>) -> Self {
        Self {
            event: event.to_string(),
            channel: Some(channel.to_string()),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe {
        channel: String,
        auth: Option<String>,
    },
    Unsubscribe {
        channel: String,
    },
    ClientEvent {
        event: String,
        channel: String,
        data: Option<Value>,
    },
    Ping,
    Pong,
    Unknown {
        event: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct ChannelPayload {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    auth: Option<String>,
}

impl ClientMessage {
    pub fn classify(frame: InboundFrame) -> Result<Self, FrameError> {
        match frame.event.as_str() {
            EVENT_SUBSCRIBE => {
                let payload = channel_payload(frame.data.unwrap_or_default())?;
                Ok(ClientMessage::Subscribe {
                    channel: payload.channel,
                    auth: payload.auth,
                })
            }
            EVENT_UNSUBSCRIBE => {
                let payload = channel_payload(frame.data.unwrap_or_default())?;
                Ok(ClientMessage::Unsubscribe {
                    channel: payload.channel,
                })
            }
            EVENT_PING => Ok(ClientMessage::Ping),
            EVENT_PONG => Ok(ClientMessage::Pong),
            event if event.starts_with(CLIENT_EVENT_PREFIX) => {
                let channel = frame
                    .channel
                    .filter(|value| !value.is_empty())
                    .ok_or(FrameError::MissingField("channel"))?;
                Ok(ClientMessage::ClientEvent {
                    event: frame.event,
                    channel,
                    data: frame.data,
                })
            }
            _ => Ok(ClientMessage::Unknown { event: frame.event }),
        }
    }

    pub fn event_name(&self) -> &str {
        match self {
            ClientMessage::Subscribe { .. } => EVENT_SUBSCRIBE,
            ClientMessage::Unsubscribe { .. } => EVENT_UNSUBSCRIBE,
            ClientMessage::ClientEvent { event, .. } => event,
            ClientMessage::Ping => EVENT_PING,
            ClientMessage::Pong => EVENT_PONG,
            ClientMessage::Unknown { event } => event,
        }
    }
}

// Some clients send `data` as a JSON-encoded string instead of an object.
fn channel_payload(data: Value) -> Result<ChannelPayload, FrameError> {
    match data {
        Value::Null => Ok(ChannelPayload::default()),
        Value::String(raw) => {
            serde_json::from_str(&raw).map_err(|err| FrameError::Decode(err.to_string()))
        }
        other => serde_json::from_value(other).map_err(|err| FrameError::Decode(err.to_string())),
    }
}

pub fn decode_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<InboundFrame, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn parse_client_message(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<ClientMessage, FrameError> {
    ClientMessage::classify(decode_frame(bytes, max_frame_bytes)?)
}

pub fn encode_event(event: &OutboundEvent) -> Result<String, FrameError> {
    serde_json::to_string(event).map_err(|err| FrameError::Encode(err.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    pub fn of(channel: &str) -> Self {
        if channel.starts_with(PRIVATE_PREFIX) {
            ChannelKind::Private
        } else if channel.starts_with(PRESENCE_PREFIX) {
            ChannelKind::Presence
        } else {
            ChannelKind::Public
        }
    }

    pub fn requires_auth(self) -> bool {
        !matches!(self, ChannelKind::Public)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Public => "public",
            ChannelKind::Private => "private",
            ChannelKind::Presence => "presence",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelNameError {
    #[error("channel name is empty")]
    Empty,
    #[error("channel name too long: {len} bytes")]
    TooLong { len: usize },
    #[error("channel name contains invalid character {0:?}")]
    InvalidCharacter(char),
}

pub fn validate_channel_name(channel: &str) -> Result<(), ChannelNameError> {
    if channel.is_empty() {
        return Err(ChannelNameError::Empty);
    }
    if channel.len() > MAX_CHANNEL_NAME_BYTES {
        return Err(ChannelNameError::TooLong { len: channel.len() });
    }
    if let Some(bad) = channel.chars().find(|ch| !is_channel_char(*ch)) {
        return Err(ChannelNameError::InvalidCharacter(bad));
    }
    Ok(())
}

fn is_channel_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '=' | '@' | ',' | '.' | ';')
}

/// A fixed request/response pair answered by the transport itself, without
/// waking the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoResponse {
    request: String,
    response: String,
}

impl AutoResponse {
    pub fn new(request: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            response: response.into(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(PING_FRAME, PONG_FRAME)
    }

    /// Exact text match only.
    pub fn respond(&self, frame: &str) -> Option<&str> {
        (frame == self.request).then_some(self.response.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_established_double_encodes_data() {
        let event = OutboundEvent::connection_established("abc--1.1", 120).expect("build");
        let encoded = encode_event(&event).expect("encode");
        assert_eq!(
            encoded,
            r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"abc--1.1\",\"activity_timeout\":120}"}"#
        );
    }

    #[test]
    fn subscription_succeeded_has_no_data_field() {
        let encoded =
            encode_event(&OutboundEvent::subscription_succeeded("room1")).expect("encode");
        assert_eq!(
            encoded,
            r#"{"event":"pusher_internal:subscription_succeeded","channel":"room1"}"#
        );
    }

    #[test]
    fn client_event_relays_verbatim_envelope() {
        let raw = br#"{"event":"client-foo","channel":"room1","data":{"x":1}}"#;
        let message = parse_client_message(raw, DEFAULT_MAX_FRAME_BYTES).expect("parse");
        let ClientMessage::ClientEvent {
            event,
            channel,
            data,
        } = message
        else {
            panic!("expected client event");
        };
        let relayed = encode_event(&OutboundEvent::client_event(&event, &channel, data))
            .expect("encode");
        assert_eq!(
            relayed,
            r#"{"event":"client-foo","channel":"room1","data":{"x":1}}"#
        );
    }

    #[test]
    fn client_event_keeps_absent_and_null_data_apart() {
        for (raw, expected) in [
            (
                r#"{"event":"client-foo","channel":"room1"}"#,
                r#"{"event":"client-foo","channel":"room1"}"#,
            ),
            (
                r#"{"event":"client-foo","channel":"room1","data":null}"#,
                r#"{"event":"client-foo","channel":"room1","data":null}"#,
            ),
        ] {
            let message =
                parse_client_message(raw.as_bytes(), DEFAULT_MAX_FRAME_BYTES).expect("parse");
            let ClientMessage::ClientEvent {
                event,
                channel,
                data,
            } = message
            else {
                panic!("expected client event");
            };
            let relayed = encode_event(&OutboundEvent::client_event(&event, &channel, data))
                .expect("encode");
            assert_eq!(relayed, expected);
        }
    }

    #[test]
    fn subscribe_accepts_object_and_string_data() {
        let object = parse_client_message(
            br#"{"event":"pusher:subscribe","data":{"channel":"room1","auth":"k:sig"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("object form");
        assert_eq!(
            object,
            ClientMessage::Subscribe {
                channel: "room1".to_string(),
                auth: Some("k:sig".to_string()),
            }
        );

        let string = parse_client_message(
            br#"{"event":"pusher:subscribe","data":"{\"channel\":\"room1\"}"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("string form");
        assert_eq!(
            string,
            ClientMessage::Subscribe {
                channel: "room1".to_string(),
                auth: None,
            }
        );
    }

    #[test]
    fn subscribe_without_channel_yields_empty_name() {
        let message = parse_client_message(
            br#"{"event":"pusher:subscribe","data":{}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("parse");
        assert_eq!(
            message,
            ClientMessage::Subscribe {
                channel: String::new(),
                auth: None,
            }
        );
    }

    #[test]
    fn client_event_requires_channel() {
        let result = parse_client_message(
            br#"{"event":"client-foo","data":{}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        );
        assert_eq!(result, Err(FrameError::MissingField("channel")));
    }

    #[test]
    fn reserved_and_unknown_events_are_classified() {
        let unknown = parse_client_message(
            br#"{"event":"pusher:signin","data":{}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("parse");
        assert_eq!(
            unknown,
            ClientMessage::Unknown {
                event: "pusher:signin".to_string()
            }
        );
        let ping = parse_client_message(PING_FRAME.as_bytes(), DEFAULT_MAX_FRAME_BYTES)
            .expect("parse ping");
        assert_eq!(ping, ClientMessage::Ping);
    }

    #[test]
    fn malformed_and_oversized_frames_are_rejected() {
        assert!(matches!(
            parse_client_message(b"{not json", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
        assert!(matches!(
            parse_client_message(br#"{"channel":"room1"}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
        let big = format!(r#"{{"event":"client-x","channel":"a","data":"{}"}}"#, "x".repeat(64));
        assert!(matches!(
            parse_client_message(big.as_bytes(), 32),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn channel_kinds_follow_prefix() {
        assert_eq!(ChannelKind::of("room1"), ChannelKind::Public);
        assert_eq!(ChannelKind::of("private-room"), ChannelKind::Private);
        assert_eq!(ChannelKind::of("presence-room"), ChannelKind::Presence);
        assert!(!ChannelKind::Public.requires_auth());
        assert!(ChannelKind::Presence.requires_auth());
    }

    #[test]
    fn channel_name_validation() {
        assert!(validate_channel_name("my-channel_1=@,.;").is_ok());
        assert_eq!(validate_channel_name(""), Err(ChannelNameError::Empty));
        assert_eq!(
            validate_channel_name("room one"),
            Err(ChannelNameError::InvalidCharacter(' '))
        );
        let long = "a".repeat(MAX_CHANNEL_NAME_BYTES + 1);
        assert!(matches!(
            validate_channel_name(&long),
            Err(ChannelNameError::TooLong { .. })
        ));
    }

    #[test]
    fn heartbeat_auto_response_matches_exact_text_only() {
        let auto = AutoResponse::heartbeat();
        assert_eq!(auto.respond(PING_FRAME), Some(PONG_FRAME));
        assert_eq!(auto.respond(r#"{"event": "pusher:ping", "data": {}}"#), None);
        assert_eq!(auto.respond(&json!({"event": "pusher:pong"}).to_string()), None);
    }
}
