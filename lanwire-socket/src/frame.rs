//! Frame messages exchanged between points and the switch.
//!
//! Every frame starts with a single type byte. `0x00` marks an Ethernet
//! payload, every other value is a control action followed by a JSON body.
//!
//! ```text
//! +------+------------------------------------------+
//! | type | payload                                  |
//! +------+------------------------------------------+
//!  0x00    dst mac (6) | src mac (6) | ethertype (2) | ...
//!  0x01    sign-request   {"address": .., "switch": ..}
//!  0x02    sign-response  {"username": .., "password": .., ...}
//!  0x03    ping-request   {"datetime": ..}
//!  0x04    ping-response  {"datetime": ..}
//!  0x05    leave-request  {"datetime": .., "uuid": .., ...}
//!  0x06    sign-result    {"status": .., "address": .., ...}
//! ```
//!
//! The codes are part of the wire format and must never be renumbered.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use thiserror::Error;

/// Maximum size of one frame on the wire, type byte included.
pub const MAX_FRAME: usize = 1600;

/// Destination MAC, source MAC and ethertype.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Type byte of an Ethernet data frame.
pub const TYPE_DATA: u8 = 0x00;

/// Frame decoding errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("frame of {0} bytes exceeds maximum of {MAX_FRAME}")]
    Oversize(usize),

    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),

    #[error("truncated ethernet frame: {0} bytes")]
    Truncated(usize),

    #[error("invalid control body: {0}")]
    Body(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Control action carried in the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    SignRequest = 0x01,
    SignResponse = 0x02,
    PingRequest = 0x03,
    PingResponse = 0x04,
    LeaveRequest = 0x05,
    SignResult = 0x06,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::SignRequest,
        Action::SignResponse,
        Action::PingRequest,
        Action::PingResponse,
        Action::LeaveRequest,
        Action::SignResult,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::SignRequest => "sign-request",
            Action::SignResponse => "sign-response",
            Action::PingRequest => "ping-request",
            Action::PingResponse => "ping-response",
            Action::LeaveRequest => "leave-request",
            Action::SignResult => "sign-result",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded frame.
///
/// The raw wire bytes are kept as-is so that forwarding a data frame never
/// copies or rewrites the Ethernet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    raw: Vec<u8>,
    action: Option<Action>,
}

impl Frame {
    /// Classify and validate raw wire bytes.
    pub fn decode(raw: Vec<u8>) -> Result<Self> {
        let Some(&kind) = raw.first() else {
            return Err(FrameError::Empty);
        };
        if raw.len() > MAX_FRAME {
            return Err(FrameError::Oversize(raw.len()));
        }

        if kind == TYPE_DATA {
            let len = raw.len() - 1;
            if len < ETHERNET_HEADER_LEN {
                return Err(FrameError::Truncated(len));
            }
            return Ok(Self { raw, action: None });
        }

        let action = Action::from_code(kind).ok_or(FrameError::UnknownType(kind))?;
        if raw.len() > 1 {
            serde_json::from_slice::<serde_json::Value>(&raw[1..])?;
        }
        Ok(Self {
            raw,
            action: Some(action),
        })
    }

    /// Build a control frame from an already encoded JSON body.
    pub fn encode_control(action: Action, body: &[u8]) -> Result<Self> {
        let len = body.len() + 1;
        if len > MAX_FRAME {
            return Err(FrameError::Oversize(len));
        }
        let mut raw = Vec::with_capacity(len);
        raw.push(action.code());
        raw.extend_from_slice(body);
        Ok(Self {
            raw,
            action: Some(action),
        })
    }

    /// Build a control frame, serializing `body` as JSON.
    pub fn control<T: Serialize>(action: Action, body: &T) -> Result<Self> {
        let body = serde_json::to_vec(body)?;
        Self::encode_control(action, &body)
    }

    /// Wrap a raw Ethernet frame.
    pub fn data(ethernet: &[u8]) -> Result<Self> {
        if ethernet.len() < ETHERNET_HEADER_LEN {
            return Err(FrameError::Truncated(ethernet.len()));
        }
        let len = ethernet.len() + 1;
        if len > MAX_FRAME {
            return Err(FrameError::Oversize(len));
        }
        let mut raw = Vec::with_capacity(len);
        raw.push(TYPE_DATA);
        raw.extend_from_slice(ethernet);
        Ok(Self { raw, action: None })
    }

    pub fn is_control(&self) -> bool {
        self.action.is_some()
    }

    pub fn action(&self) -> Option<Action> {
        self.action
    }

    /// Everything after the type byte.
    pub fn payload(&self) -> &[u8] {
        &self.raw[1..]
    }

    /// JSON body of a control frame, empty for data frames.
    pub fn body(&self) -> &[u8] {
        if self.is_control() { self.payload() } else { &[] }
    }

    /// Deserialize the JSON body of a control frame.
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(self.body())?)
    }

    /// The Ethernet frame of a data frame.
    pub fn ethernet(&self) -> Option<&[u8]> {
        if self.is_control() { None } else { Some(self.payload()) }
    }

    pub fn destination(&self) -> Option<[u8; 6]> {
        self.ethernet().map(|eth| mac_at(eth, 0))
    }

    pub fn source(&self) -> Option<[u8; 6]> {
        self.ethernet().map(|eth| mac_at(eth, 6))
    }

    pub fn ethertype(&self) -> Option<u16> {
        self.ethernet().map(|eth| u16::from_be_bytes([eth[12], eth[13]]))
    }

    /// Wire bytes, type byte included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }

    /// Logical size on the wire.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

fn mac_at(eth: &[u8], offset: usize) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&eth[offset..offset + 6]);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ethernet(len: usize) -> Vec<u8> {
        let mut eth = vec![0u8; len];
        eth[0..6].copy_from_slice(&[0xff; 6]);
        eth[6..12].copy_from_slice(&[0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        eth[12..14].copy_from_slice(&[0x08, 0x06]);
        eth
    }

    #[test]
    fn test_control_roundtrip_is_byte_identical() {
        let body = json!({"address": "10.1.1.2:40012", "switch": "10.1.1.1:10002"});
        for action in Action::ALL {
            let frame = Frame::control(action, &body).unwrap();
            let decoded = Frame::decode(frame.as_bytes().to_vec()).unwrap();
            assert_eq!(decoded.action(), Some(action));

            let again = Frame::encode_control(decoded.action().unwrap(), decoded.body()).unwrap();
            assert_eq!(again.as_bytes(), frame.as_bytes());
        }
    }

    #[test]
    fn test_control_without_body() {
        let frame = Frame::decode(vec![Action::PingRequest.code()]).unwrap();
        assert!(frame.is_control());
        assert!(frame.body().is_empty());
    }

    #[test]
    fn test_data_frame_accessors() {
        let frame = Frame::data(&ethernet(60)).unwrap();
        assert!(!frame.is_control());
        assert_eq!(frame.len(), 61);
        assert_eq!(frame.destination(), Some([0xff; 6]));
        assert_eq!(frame.source(), Some([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]));
        assert_eq!(frame.ethertype(), Some(0x0806));
        assert_eq!(frame.ethernet().unwrap(), ethernet(60).as_slice());
        assert!(frame.body().is_empty());
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(matches!(Frame::decode(vec![]), Err(FrameError::Empty)));
    }

    #[test]
    fn test_decode_rejects_oversize() {
        let mut raw = vec![TYPE_DATA];
        raw.extend(ethernet(MAX_FRAME));
        assert!(matches!(
            Frame::decode(raw),
            Err(FrameError::Oversize(n)) if n == MAX_FRAME + 1
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_ethernet() {
        let raw = vec![TYPE_DATA, 0xff, 0xff, 0xff];
        assert!(matches!(Frame::decode(raw), Err(FrameError::Truncated(3))));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(matches!(
            Frame::decode(vec![0x7f, b'{', b'}']),
            Err(FrameError::UnknownType(0x7f))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_body() {
        let raw = vec![Action::SignResponse.code(), b'{', b'"'];
        assert!(matches!(Frame::decode(raw), Err(FrameError::Body(_))));
    }

    #[test]
    fn test_failed_decode_leaves_previous_frame_intact() {
        let good = Frame::control(Action::PingRequest, &json!({"datetime": 1})).unwrap();
        let snapshot = good.clone();
        assert!(Frame::decode(vec![0x7f]).is_err());
        assert_eq!(good, snapshot);
        assert_eq!(good.action(), Some(Action::PingRequest));
    }

    #[test]
    fn test_parse_body() {
        #[derive(serde::Deserialize)]
        struct Ping {
            datetime: i64,
        }
        let frame = Frame::control(Action::PingResponse, &json!({"datetime": 42})).unwrap();
        let ping: Ping = frame.parse_body().unwrap();
        assert_eq!(ping.datetime, 42);
    }

    #[test]
    fn test_action_codes_are_stable() {
        assert_eq!(Action::SignRequest.code(), 0x01);
        assert_eq!(Action::LeaveRequest.code(), 0x05);
        assert_eq!(Action::from_code(0x06), Some(Action::SignResult));
        assert_eq!(Action::from_code(TYPE_DATA), None);
    }
}
