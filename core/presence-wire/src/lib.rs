//! Wire protocol for the Discord IPC socket.
//!
//! Shared by the session core and the diagnostics CLI so the two can never
//! drift on framing or payload shape. A frame is an 8-byte little-endian
//! header (opcode `u32`, body length `u32`) followed by a UTF-8 JSON body.
//! We only ever send `Handshake` and `Frame`; `Close` is what the remote
//! uses to refuse a handshake or tear a session down.
//!
//! The decoder is deliberately forgiving about bodies: a frame whose body
//! is missing, oversized, or unparseable still yields its opcode so callers
//! can keep the stream alive. Only a vanished peer or an opcode we have no
//! name for is an error.

use std::io::{self, Read};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// IPC protocol version sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the opcode + body-length header that precedes every body.
pub const FRAME_HEADER_BYTES: usize = 8;

/// Declared body lengths must be non-zero and strictly below this for the
/// body to be read at all. Real payloads are a few hundred bytes.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Frame kinds used by the IPC protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// First frame on a fresh connection, carries [`HandshakeRequest`].
    Handshake,
    /// Everything after the handshake: commands out, events in.
    Frame,
    /// Sent by the remote to end the session.
    Close,
}

impl Opcode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Opcode::Handshake),
            1 => Some(Opcode::Frame),
            2 => Some(Opcode::Close),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Opcode::Handshake => 0,
            Opcode::Frame => 1,
            Opcode::Close => 2,
        }
    }
}

/// Failures while building an outbound frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("payload is not serializable: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("payload body is {0} bytes, over the frame limit")]
    BodyTooLarge(usize),
}

/// Failures while reading an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("socket read failed: {0}")]
    Io(#[from] io::Error),
}

/// Serializes `body` and wraps it in a frame header.
pub fn encode_frame<T: Serialize>(opcode: Opcode, body: &T) -> Result<Vec<u8>, EncodeError> {
    let body = serde_json::to_vec(body)?;
    if body.len() >= MAX_BODY_BYTES {
        return Err(EncodeError::BodyTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + body.len());
    frame.extend_from_slice(&opcode.as_u32().to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads one frame off `reader`.
///
/// Returns the opcode together with the parsed body, or `None` in place of
/// a body that was absent, implausibly sized, or not valid JSON. A declared
/// length of zero or `>= MAX_BODY_BYTES` is treated as a framing glitch:
/// nothing is allocated and no body bytes are consumed. An unrecognized
/// opcode consumes its body (when the length is plausible) so the stream
/// stays in sync, then reports [`ProtocolError::UnknownOpcode`].
pub fn decode_frame<R: Read>(reader: &mut R) -> Result<(Opcode, Option<Value>), ProtocolError> {
    let mut header = [0u8; FRAME_HEADER_BYTES];
    read_exact_or_closed(reader, &mut header)?;
    let raw_opcode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let body_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let opcode = Opcode::from_u32(raw_opcode);
    if body_len == 0 || body_len >= MAX_BODY_BYTES {
        return match opcode {
            Some(opcode) => Ok((opcode, None)),
            None => Err(ProtocolError::UnknownOpcode(raw_opcode)),
        };
    }

    let mut body = vec![0u8; body_len];
    read_exact_or_closed(reader, &mut body)?;

    match opcode {
        Some(opcode) => Ok((opcode, serde_json::from_slice(&body).ok())),
        None => Err(ProtocolError::UnknownOpcode(raw_opcode)),
    }
}

fn read_exact_or_closed<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
        _ => ProtocolError::Io(err),
    })
}

/// Body of the first frame sent on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub v: u32,
    pub client_id: String,
}

impl HandshakeRequest {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            client_id: client_id.into(),
        }
    }
}

/// Command name for publishing or clearing an activity.
pub const SET_ACTIVITY_COMMAND: &str = "SET_ACTIVITY";

/// Discord's numeric activity type for "Listening to ...".
pub const ACTIVITY_TYPE_LISTENING: u8 = 2;

/// `SET_ACTIVITY` command envelope. The nonce correlates a command with
/// the remote's (ignored) response and must be unique per send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetActivity {
    pub cmd: String,
    pub args: ActivityArgs,
    pub nonce: String,
}

/// `args` of a `SET_ACTIVITY` command. A missing `activity` clears the
/// published presence instead of setting one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityArgs {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,
}

/// One published activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: u8,
    pub details: String,
    pub state: String,
    pub assets: ActivityAssets,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<ActivityTimestamps>,
}

/// Artwork slots of an activity. Image values are either HTTPS URLs or
/// keys of assets uploaded to the Discord application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityAssets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_text: Option<String>,
}

/// Unix-epoch millisecond bounds that drive the remote's progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityTimestamps {
    pub start: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn frame_round_trips() {
        let frame = encode_frame(Opcode::Handshake, &HandshakeRequest::new("123")).unwrap();
        let mut cursor = Cursor::new(frame);
        let (opcode, body) = decode_frame(&mut cursor).unwrap();
        assert_eq!(opcode, Opcode::Handshake);
        assert_eq!(body, Some(json!({"v": 1, "client_id": "123"})));
    }

    #[test]
    fn header_is_little_endian() {
        let frame = encode_frame(Opcode::Frame, &json!({"a": 1})).unwrap();
        assert_eq!(&frame[0..4], &[1, 0, 0, 0]);
        let body_len = (frame.len() - FRAME_HEADER_BYTES) as u32;
        assert_eq!(&frame[4..8], &body_len.to_le_bytes());
    }

    #[test]
    fn truncated_header_reports_closed() {
        let mut cursor = Cursor::new(vec![0u8; 5]);
        let err = decode_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[test]
    fn truncated_body_reports_closed() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&100u32.to_le_bytes());
        data.extend_from_slice(b"short");
        let mut cursor = Cursor::new(data);
        let err = decode_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[test]
    fn zero_length_body_yields_no_body() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        let mut cursor = Cursor::new(data);
        let (opcode, body) = decode_frame(&mut cursor).unwrap();
        assert_eq!(opcode, Opcode::Close);
        assert_eq!(body, None);
    }

    #[test]
    fn oversized_length_is_dropped_without_reading() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&(1024u32 * 1024).to_le_bytes());
        let mut cursor = Cursor::new(data);
        let (opcode, body) = decode_frame(&mut cursor).unwrap();
        assert_eq!(opcode, Opcode::Frame);
        assert_eq!(body, None);
        // Nothing past the header may have been consumed.
        assert_eq!(cursor.position(), FRAME_HEADER_BYTES as u64);
    }

    #[test]
    fn malformed_json_body_yields_no_body() {
        let payload = b"not json at all";
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(payload);
        let mut cursor = Cursor::new(data);
        let (opcode, body) = decode_frame(&mut cursor).unwrap();
        assert_eq!(opcode, Opcode::Frame);
        assert_eq!(body, None);
    }

    #[test]
    fn unknown_opcode_consumes_body_and_leaves_stream_in_sync() {
        let mut data = encode_frame_raw(7, br#"{"weird": true}"#);
        data.extend_from_slice(&encode_frame(Opcode::Close, &json!({"code": 1000})).unwrap());
        let mut cursor = Cursor::new(data);

        let err = decode_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOpcode(7)));

        // The next frame decodes cleanly because the unknown body was consumed.
        let (opcode, body) = decode_frame(&mut cursor).unwrap();
        assert_eq!(opcode, Opcode::Close);
        assert_eq!(body, Some(json!({"code": 1000})));
    }

    #[test]
    fn encode_rejects_oversized_body() {
        let body = json!({"blob": "x".repeat(MAX_BODY_BYTES)});
        let err = encode_frame(Opcode::Frame, &body).unwrap_err();
        assert!(matches!(err, EncodeError::BodyTooLarge(_)));
    }

    #[test]
    fn handshake_request_wire_shape() {
        let value = serde_json::to_value(HandshakeRequest::new("867530900000000000")).unwrap();
        assert_eq!(value, json!({"v": 1, "client_id": "867530900000000000"}));
    }

    #[test]
    fn set_activity_wire_shape() {
        let command = SetActivity {
            cmd: SET_ACTIVITY_COMMAND.to_string(),
            args: ActivityArgs {
                pid: 4242,
                activity: Some(Activity {
                    activity_type: ACTIVITY_TYPE_LISTENING,
                    details: "Harvest Moon".to_string(),
                    state: "by Neil Young".to_string(),
                    assets: ActivityAssets {
                        large_image: Some("https://example.com/art.jpg".to_string()),
                        large_text: Some("Harvest Moon".to_string()),
                        small_image: Some("music".to_string()),
                        small_text: Some("Overtone".to_string()),
                    },
                    timestamps: Some(ActivityTimestamps {
                        start: 1_700_000_000_000,
                        end: Some(1_700_000_180_000),
                    }),
                }),
            },
            nonce: "nonce-1".to_string(),
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({
                "cmd": "SET_ACTIVITY",
                "args": {
                    "pid": 4242,
                    "activity": {
                        "type": 2,
                        "details": "Harvest Moon",
                        "state": "by Neil Young",
                        "assets": {
                            "large_image": "https://example.com/art.jpg",
                            "large_text": "Harvest Moon",
                            "small_image": "music",
                            "small_text": "Overtone"
                        },
                        "timestamps": {
                            "start": 1_700_000_000_000i64,
                            "end": 1_700_000_180_000i64
                        }
                    }
                },
                "nonce": "nonce-1"
            })
        );
    }

    #[test]
    fn clear_command_omits_activity_key() {
        let command = SetActivity {
            cmd: SET_ACTIVITY_COMMAND.to_string(),
            args: ActivityArgs {
                pid: 4242,
                activity: None,
            },
            nonce: "nonce-2".to_string(),
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({
                "cmd": "SET_ACTIVITY",
                "args": {"pid": 4242},
                "nonce": "nonce-2"
            })
        );
    }

    fn encode_frame_raw(opcode: u32, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&opcode.to_le_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);
        frame
    }
}
