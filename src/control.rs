//! Control-frame codecs: the 16-byte FBSP header and the 8-byte FBDP header.
//!
//! Both headers are big-endian and fixed-size. Packing/unpacking is pure and
//! allocation-free; semantic validation beyond magic/version/reserved-bits
//! lives in `fbsp::validator` and `fbdp::message`.

use bitflags::bitflags;

use crate::error::InvalidMessage;

const FBSP_MAGIC: [u8; 4] = *b"FBSP";
const FBDP_MAGIC: [u8; 4] = *b"FBDP";

/// Current FBSP/FBDP wire protocol version (low 3 bits of the control byte).
pub const PROTOCOL_VERSION: u8 = 1;

bitflags! {
    /// FBSP message flags, stored in the low 3 bits of the `flags` byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FbspFlags: u8 {
        const ACK_REQ   = 0b001;
        const ACK_REPLY = 0b010;
        const MORE      = 0b100;
    }
}

/// The 16-byte FBSP control frame header.
///
/// Wire layout: `magic[4] | ctrl[1] | flags[1] | type_data[2] | token[8]`,
/// where `ctrl = (message_type << 3) | version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbspHeader {
    pub message_type: u8,
    pub flags: FbspFlags,
    pub type_data: u16,
    pub token: [u8; 8],
}

pub const FBSP_HEADER_LEN: usize = 16;

impl FbspHeader {
    pub fn new(message_type: u8, flags: FbspFlags, type_data: u16, token: [u8; 8]) -> Self {
        FbspHeader {
            message_type,
            flags,
            type_data,
            token,
        }
    }

    pub fn pack(&self) -> [u8; FBSP_HEADER_LEN] {
        let mut buf = [0u8; FBSP_HEADER_LEN];
        buf[0..4].copy_from_slice(&FBSP_MAGIC);
        buf[4] = (self.message_type << 3) | (PROTOCOL_VERSION & 0x07);
        buf[5] = self.flags.bits();
        buf[6..8].copy_from_slice(&self.type_data.to_be_bytes());
        buf[8..16].copy_from_slice(&self.token);
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self, InvalidMessage> {
        if buf.len() < FBSP_HEADER_LEN {
            return Err(InvalidMessage::HeaderTooShort {
                len: buf.len(),
                expected: FBSP_HEADER_LEN,
            });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != FBSP_MAGIC {
            return Err(InvalidMessage::WrongMagic { found: magic });
        }
        let ctrl = buf[4];
        let version = ctrl & 0x07;
        if version != PROTOCOL_VERSION {
            return Err(InvalidMessage::UnsupportedVersion { found: version });
        }
        let message_type = ctrl >> 3;
        let flags_byte = buf[5];
        if flags_byte & !0x07 != 0 {
            return Err(InvalidMessage::ReservedFlagBits { flags: flags_byte });
        }
        let flags = FbspFlags::from_bits_truncate(flags_byte);
        let type_data = u16::from_be_bytes([buf[6], buf[7]]);
        let mut token = [0u8; 8];
        token.copy_from_slice(&buf[8..16]);
        Ok(FbspHeader {
            message_type,
            flags,
            type_data,
            token,
        })
    }
}

/// The 8-byte FBDP control frame header.
///
/// Wire layout: `magic[4] | ctrl[1] | type[1] | type_data[2]`. The low 3 bits
/// of `ctrl` carry the protocol revision; higher bits are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbdpHeader {
    pub message_type: u8,
    pub type_data: u16,
}

pub const FBDP_HEADER_LEN: usize = 8;

impl FbdpHeader {
    pub fn new(message_type: u8, type_data: u16) -> Self {
        FbdpHeader {
            message_type,
            type_data,
        }
    }

    pub fn pack(&self) -> [u8; FBDP_HEADER_LEN] {
        let mut buf = [0u8; FBDP_HEADER_LEN];
        buf[0..4].copy_from_slice(&FBDP_MAGIC);
        buf[4] = PROTOCOL_VERSION & 0x07;
        buf[5] = self.message_type;
        buf[6..8].copy_from_slice(&self.type_data.to_be_bytes());
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self, InvalidMessage> {
        if buf.len() < FBDP_HEADER_LEN {
            return Err(InvalidMessage::HeaderTooShort {
                len: buf.len(),
                expected: FBDP_HEADER_LEN,
            });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != FBDP_MAGIC {
            return Err(InvalidMessage::WrongMagic { found: magic });
        }
        let ctrl = buf[4];
        let version = ctrl & 0x07;
        if ctrl & !0x07 != 0 {
            return Err(InvalidMessage::ReservedFlagBits { flags: ctrl });
        }
        if version != PROTOCOL_VERSION {
            return Err(InvalidMessage::UnsupportedVersion { found: version });
        }
        let message_type = buf[5];
        let type_data = u16::from_be_bytes([buf[6], buf[7]]);
        Ok(FbdpHeader {
            message_type,
            type_data,
        })
    }
}

/// Tokens are 8-byte big-endian-on-the-wire counters; this helper converts
/// to/from the little-endian `u64` the handler-side API works with:
/// tokens are 8-byte little-endian counters on the wire.
pub fn token_to_bytes(token: u64) -> [u8; 8] {
    token.to_le_bytes()
}

pub fn token_from_bytes(bytes: [u8; 8]) -> u64 {
    u64::from_le_bytes(bytes)
}
