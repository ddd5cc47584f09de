//! Structured records carried inside FBSP/FBDP control messages.
//!
//! These are the protocol's own fixed records (greeting identities, agent
//! descriptors, interface specs, error descriptions, pipe open payloads) —
//! not the arbitrary application payloads a REQUEST/REPLY/DATA frame
//! carries, which stay opaque bytes per the "generated serialized-structure
//! bindings" Non-goal. Encoded with `postcard` via [`encode`]/[`decode`].

use serde::{Deserialize, Serialize};

use crate::error::InvalidMessage;

/// Opaque identifier used for agent/vendor/platform/peer UIDs.
///
/// The wire format assumes some externally-defined UID scheme (e.g. a
/// registry-assigned string or UUID); the core only needs to carry it
/// opaquely, so it is modelled as a newtype over `String`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(pub String);

impl Uid {
    pub fn new(s: impl Into<String>) -> Self {
        Uid(s.into())
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the peer process sending a HELLO/WELCOME greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub uid: Uid,
    pub pid: u32,
    pub host: String,
    pub supplement: Option<String>,
}

/// Describes the software agent behind a HELLO/WELCOME greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub uid: Uid,
    pub name: String,
    pub version: String,
    pub vendor_uid: Uid,
    pub classification: String,
    pub platform_uid: Uid,
    pub platform_version: String,
    pub supplement: Option<String>,
}

/// One interface a WELCOME greeting advertises: a session-local `number`
/// bound to a globally stable `uid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub uid: Uid,
    pub name: String,
    pub revision: u32,
    pub number: u8,
}

/// The `State` enum carried by an FBSP STATE message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Ready,
    Running,
    Waiting,
    Suspended,
    Finished,
    Aborted,
}

/// Payload of a STATE message: the state plus an optional free-form
/// supplement (e.g. progress percentage, a reason string).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub state: State,
    pub supplement: Option<String>,
}

/// One entry inside an ERROR message's payload frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescription {
    pub code: u16,
    pub description: String,
}

impl std::fmt::Display for ErrorDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.description)
    }
}

/// Payload of a CANCEL message: the set of tokens to cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPayload {
    pub tokens: Vec<[u8; 8]>,
}

/// Which direction along a data pipe a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipeStream {
    Input,
    Output,
    Monitor,
}

/// Payload of an FBDP OPEN message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPayload {
    pub data_pipe_id: Uid,
    pub pipe_stream: PipeStream,
    pub data_format: String,
}

/// Encode a structured record with the protocol's postcard codec.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    postcard::to_allocvec(value).expect("structured records are postcard-serializable")
}

/// Decode a structured record, wrapping postcard's error in the shared
/// [`InvalidMessage`] variant used throughout validation.
pub fn decode<T: for<'de> Deserialize<'de>>(buf: &[u8]) -> Result<T, InvalidMessage> {
    postcard::from_bytes(buf).map_err(|e| InvalidMessage::RecordDecode(e.to_string()))
}
