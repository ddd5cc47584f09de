//! FBSP message model: a tagged union of the ten message kinds, with
//! per-variant structural validation (flag permissions, type_data packing,
//! payload frame shape).

use bytes::Bytes;

use crate::control::{token_from_bytes, token_to_bytes, FbspFlags, FbspHeader};
use crate::descriptor::{
    self, AgentDescriptor, CancelPayload, ErrorDescription, InterfaceDescriptor, PeerDescriptor,
    State, StatePayload,
};
use crate::error::InvalidMessage;

/// The five-bit message type codes carried in the FBSP control frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello = 1,
    Welcome = 2,
    Noop = 3,
    Request = 4,
    Reply = 5,
    Data = 6,
    Cancel = 7,
    State = 8,
    Close = 9,
    Error = 31,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => MessageType::Hello,
            2 => MessageType::Welcome,
            3 => MessageType::Noop,
            4 => MessageType::Request,
            5 => MessageType::Reply,
            6 => MessageType::Data,
            7 => MessageType::Cancel,
            8 => MessageType::State,
            9 => MessageType::Close,
            31 => MessageType::Error,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Welcome => "WELCOME",
            MessageType::Noop => "NOOP",
            MessageType::Request => "REQUEST",
            MessageType::Reply => "REPLY",
            MessageType::Data => "DATA",
            MessageType::Cancel => "CANCEL",
            MessageType::State => "STATE",
            MessageType::Close => "CLOSE",
            MessageType::Error => "ERROR",
        }
    }

    /// Flags this message type is permitted to carry.
    fn allowed_flags(self) -> FbspFlags {
        match self {
            MessageType::Noop
            | MessageType::Request
            | MessageType::Reply
            | MessageType::State
            | MessageType::Cancel => FbspFlags::ACK_REQ | FbspFlags::ACK_REPLY,
            MessageType::Data => FbspFlags::ACK_REQ | FbspFlags::ACK_REPLY | FbspFlags::MORE,
            MessageType::Hello | MessageType::Welcome | MessageType::Close | MessageType::Error => {
                FbspFlags::empty()
            }
        }
    }
}

/// Zero handle value: "no handle bound to this DATA frame".
pub const NO_HANDLE: u16 = 0;

/// A fully parsed/constructed FBSP message, independent of peer role.
#[derive(Debug, Clone, PartialEq)]
pub enum FbspMessage {
    Hello {
        token: u64,
        peer: PeerDescriptor,
        agent: AgentDescriptor,
    },
    Welcome {
        token: u64,
        peer: PeerDescriptor,
        agent: AgentDescriptor,
        interfaces: Vec<InterfaceDescriptor>,
    },
    Noop {
        token: u64,
        flags: FbspFlags,
    },
    Request {
        token: u64,
        interface_number: u8,
        api_code: u8,
        flags: FbspFlags,
        frames: Vec<Bytes>,
    },
    Reply {
        token: u64,
        interface_number: u8,
        api_code: u8,
        flags: FbspFlags,
        frames: Vec<Bytes>,
    },
    Data {
        token: u64,
        handle: u16,
        flags: FbspFlags,
        payload: Bytes,
    },
    Cancel {
        token: u64,
        flags: FbspFlags,
        tokens: Vec<u64>,
    },
    State {
        token: u64,
        flags: FbspFlags,
        state: State,
        supplement: Option<String>,
    },
    Close {
        token: u64,
    },
    Error {
        token: u64,
        error_code: u16,
        relates_to: MessageType,
        descriptions: Vec<ErrorDescription>,
    },
}

impl FbspMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            FbspMessage::Hello { .. } => MessageType::Hello,
            FbspMessage::Welcome { .. } => MessageType::Welcome,
            FbspMessage::Noop { .. } => MessageType::Noop,
            FbspMessage::Request { .. } => MessageType::Request,
            FbspMessage::Reply { .. } => MessageType::Reply,
            FbspMessage::Data { .. } => MessageType::Data,
            FbspMessage::Cancel { .. } => MessageType::Cancel,
            FbspMessage::State { .. } => MessageType::State,
            FbspMessage::Close { .. } => MessageType::Close,
            FbspMessage::Error { .. } => MessageType::Error,
        }
    }

    pub fn token(&self) -> u64 {
        match self {
            FbspMessage::Hello { token, .. }
            | FbspMessage::Welcome { token, .. }
            | FbspMessage::Noop { token, .. }
            | FbspMessage::Request { token, .. }
            | FbspMessage::Reply { token, .. }
            | FbspMessage::Data { token, .. }
            | FbspMessage::Cancel { token, .. }
            | FbspMessage::State { token, .. }
            | FbspMessage::Close { token }
            | FbspMessage::Error { token, .. } => *token,
        }
    }

    fn flags(&self) -> FbspFlags {
        match self {
            FbspMessage::Noop { flags, .. }
            | FbspMessage::Request { flags, .. }
            | FbspMessage::Reply { flags, .. }
            | FbspMessage::Data { flags, .. }
            | FbspMessage::Cancel { flags, .. }
            | FbspMessage::State { flags, .. } => *flags,
            FbspMessage::Hello { .. }
            | FbspMessage::Welcome { .. }
            | FbspMessage::Close { .. }
            | FbspMessage::Error { .. } => FbspFlags::empty(),
        }
    }

    /// Build the ACK_REPLY acknowledgement for a message that carried
    /// ACK_REQ: same type, same token, same `type_data`, `ACK_REPLY` set and
    /// `ACK_REQ` cleared.
    pub fn ack_reply(&self) -> Option<FbspMessage> {
        if !self.flags().contains(FbspFlags::ACK_REQ) {
            return None;
        }
        let token = self.token();
        Some(match self {
            FbspMessage::Noop { .. } => FbspMessage::Noop {
                token,
                flags: FbspFlags::ACK_REPLY,
            },
            FbspMessage::Request {
                interface_number,
                api_code,
                ..
            } => FbspMessage::Request {
                token,
                interface_number: *interface_number,
                api_code: *api_code,
                flags: FbspFlags::ACK_REPLY,
                frames: Vec::new(),
            },
            FbspMessage::Reply {
                interface_number,
                api_code,
                ..
            } => FbspMessage::Reply {
                token,
                interface_number: *interface_number,
                api_code: *api_code,
                flags: FbspFlags::ACK_REPLY,
                frames: Vec::new(),
            },
            FbspMessage::Data { handle, .. } => FbspMessage::Data {
                token,
                handle: *handle,
                flags: FbspFlags::ACK_REPLY,
                payload: Bytes::new(),
            },
            FbspMessage::Cancel { .. } => FbspMessage::Cancel {
                token,
                flags: FbspFlags::ACK_REPLY,
                tokens: Vec::new(),
            },
            FbspMessage::State { state, .. } => FbspMessage::State {
                token,
                flags: FbspFlags::ACK_REPLY,
                state: *state,
                supplement: None,
            },
            _ => return None,
        })
    }

    /// Encode this message into its control header and payload frames.
    pub fn to_wire(&self) -> (FbspHeader, Vec<Bytes>) {
        let token = token_to_bytes(self.token());
        match self {
            FbspMessage::Hello { peer, agent, .. } => {
                let header = FbspHeader::new(MessageType::Hello as u8, FbspFlags::empty(), 0, token);
                (header, vec![encode_greeting(peer, agent)])
            }
            FbspMessage::Welcome {
                peer,
                agent,
                interfaces,
                ..
            } => {
                let header = FbspHeader::new(MessageType::Welcome as u8, FbspFlags::empty(), 0, token);
                let mut frames = vec![encode_greeting(peer, agent)];
                frames.push(Bytes::from(descriptor::encode(interfaces)));
                (header, frames)
            }
            FbspMessage::Noop { flags, .. } => {
                let header = FbspHeader::new(MessageType::Noop as u8, *flags, 0, token);
                (header, Vec::new())
            }
            FbspMessage::Request {
                interface_number,
                api_code,
                flags,
                frames,
                ..
            } => {
                let type_data = pack_interface_api(*interface_number, *api_code);
                let header = FbspHeader::new(MessageType::Request as u8, *flags, type_data, token);
                (header, frames.clone())
            }
            FbspMessage::Reply {
                interface_number,
                api_code,
                flags,
                frames,
                ..
            } => {
                let type_data = pack_interface_api(*interface_number, *api_code);
                let header = FbspHeader::new(MessageType::Reply as u8, *flags, type_data, token);
                (header, frames.clone())
            }
            FbspMessage::Data {
                handle,
                flags,
                payload,
                ..
            } => {
                let header = FbspHeader::new(MessageType::Data as u8, *flags, *handle, token);
                (header, vec![payload.clone()])
            }
            FbspMessage::Cancel { flags, tokens, .. } => {
                let header = FbspHeader::new(MessageType::Cancel as u8, *flags, 0, token);
                let payload = CancelPayload {
                    tokens: tokens.iter().map(|t| token_to_bytes(*t)).collect(),
                };
                (header, vec![Bytes::from(descriptor::encode(&payload))])
            }
            FbspMessage::State {
                flags,
                state,
                supplement,
                ..
            } => {
                let header = FbspHeader::new(MessageType::State as u8, *flags, 0, token);
                let payload = StatePayload {
                    state: *state,
                    supplement: supplement.clone(),
                };
                (header, vec![Bytes::from(descriptor::encode(&payload))])
            }
            FbspMessage::Close { .. } => {
                let header = FbspHeader::new(MessageType::Close as u8, FbspFlags::empty(), 0, token);
                (header, Vec::new())
            }
            FbspMessage::Error {
                error_code,
                relates_to,
                descriptions,
                ..
            } => {
                let type_data = pack_error_type_data(*error_code, *relates_to);
                let header = FbspHeader::new(MessageType::Error as u8, FbspFlags::empty(), type_data, token);
                let frames = descriptions.iter().map(|d| Bytes::from(descriptor::encode(d))).collect();
                (header, frames)
            }
        }
    }

    /// Parse a message from its control header and payload frames,
    /// performing only structural checks (flags permitted for the type,
    /// `type_data` decomposition, frame-count/record shape). Role gating
    /// and greeting-phase rules live in [`crate::fbsp::validator`].
    pub fn from_wire(header: &FbspHeader, frames: &[Bytes]) -> Result<Self, InvalidMessage> {
        let message_type = MessageType::from_u8(header.message_type)
            .ok_or(InvalidMessage::UnknownMessageType { found: header.message_type })?;
        let allowed = message_type.allowed_flags();
        let extra = header.flags.bits() & !allowed.bits();
        if extra != 0 {
            return Err(InvalidMessage::ReservedFlagBits { flags: header.flags.bits() });
        }
        let token = token_from_bytes(header.token);

        Ok(match message_type {
            MessageType::Hello => {
                expect_frames(frames, 1, "HELLO")?;
                let (peer, agent) = decode_greeting(&frames[0])?;
                FbspMessage::Hello { token, peer, agent }
            }
            MessageType::Welcome => {
                expect_frames(frames, 2, "WELCOME")?;
                let (peer, agent) = decode_greeting(&frames[0])?;
                let interfaces: Vec<InterfaceDescriptor> = descriptor::decode(&frames[1])?;
                FbspMessage::Welcome {
                    token,
                    peer,
                    agent,
                    interfaces,
                }
            }
            MessageType::Noop => {
                expect_frames(frames, 0, "NOOP")?;
                FbspMessage::Noop {
                    token,
                    flags: header.flags,
                }
            }
            MessageType::Request => {
                let (interface_number, api_code) = unpack_interface_api(header.type_data);
                if api_code == 0 {
                    return Err(InvalidMessage::ZeroRequestCode);
                }
                FbspMessage::Request {
                    token,
                    interface_number,
                    api_code,
                    flags: header.flags,
                    frames: frames.to_vec(),
                }
            }
            MessageType::Reply => {
                let (interface_number, api_code) = unpack_interface_api(header.type_data);
                FbspMessage::Reply {
                    token,
                    interface_number,
                    api_code,
                    flags: header.flags,
                    frames: frames.to_vec(),
                }
            }
            MessageType::Data => {
                expect_frames(frames, 1, "DATA")?;
                FbspMessage::Data {
                    token,
                    handle: header.type_data,
                    flags: header.flags,
                    payload: frames[0].clone(),
                }
            }
            MessageType::Cancel => {
                expect_frames(frames, 1, "CANCEL")?;
                let payload: CancelPayload = descriptor::decode(&frames[0])?;
                FbspMessage::Cancel {
                    token,
                    flags: header.flags,
                    tokens: payload.tokens.into_iter().map(token_from_bytes).collect(),
                }
            }
            MessageType::State => {
                expect_frames(frames, 1, "STATE")?;
                if token == 0 {
                    return Err(InvalidMessage::ZeroRequestCode);
                }
                let payload: StatePayload = descriptor::decode(&frames[0])?;
                FbspMessage::State {
                    token,
                    flags: header.flags,
                    state: payload.state,
                    supplement: payload.supplement,
                }
            }
            MessageType::Close => {
                expect_frames(frames, 0, "CLOSE")?;
                FbspMessage::Close { token }
            }
            MessageType::Error => {
                let (error_code, relates_to_code) = unpack_error_type_data(header.type_data);
                if error_code == 0 {
                    return Err(InvalidMessage::ZeroErrorCode);
                }
                let relates_to = relates_to_message_type(relates_to_code)
                    .ok_or(InvalidMessage::BadRelatesTo { found: relates_to_code })?;
                let mut descriptions = Vec::with_capacity(frames.len());
                for f in frames {
                    descriptions.push(descriptor::decode(f)?);
                }
                FbspMessage::Error {
                    token,
                    error_code,
                    relates_to,
                    descriptions,
                }
            }
        })
    }
}

fn expect_frames(frames: &[Bytes], expected: usize, name: &'static str) -> Result<(), InvalidMessage> {
    if frames.len() != expected {
        return Err(InvalidMessage::WrongFrameCount {
            found: frames.len(),
            expected: match expected {
                0 => "0",
                1 => "1",
                2 => "2",
                _ => name,
            },
        });
    }
    Ok(())
}

fn encode_greeting(peer: &PeerDescriptor, agent: &AgentDescriptor) -> Bytes {
    Bytes::from(descriptor::encode(&(peer.clone(), agent.clone())))
}

fn decode_greeting(buf: &[u8]) -> Result<(PeerDescriptor, AgentDescriptor), InvalidMessage> {
    descriptor::decode(buf)
}

fn pack_interface_api(interface_number: u8, api_code: u8) -> u16 {
    ((interface_number as u16) << 8) | api_code as u16
}

fn unpack_interface_api(type_data: u16) -> (u8, u8) {
    ((type_data >> 8) as u8, (type_data & 0xff) as u8)
}

/// `error_code` in the high 11 bits, `relates_to` message type in the low 5.
fn pack_error_type_data(error_code: u16, relates_to: MessageType) -> u16 {
    (error_code << 5) | (relates_to as u16 & 0x1f)
}

fn unpack_error_type_data(type_data: u16) -> (u16, u8) {
    (type_data >> 5, (type_data & 0x1f) as u8)
}

fn relates_to_message_type(code: u8) -> Option<MessageType> {
    match MessageType::from_u8(code) {
        Some(mt @ (MessageType::Hello
        | MessageType::Noop
        | MessageType::Request
        | MessageType::Data
        | MessageType::Cancel
        | MessageType::Close)) => Some(mt),
        _ => None,
    }
}
