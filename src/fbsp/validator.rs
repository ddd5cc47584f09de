//! FBSP validator: role-gating and greeting-phase rules layered on top of
//! the structural checks `fbsp::message` already performs.

use bytes::Bytes;

use crate::control::{FbspFlags, FbspHeader};
use crate::error::InvalidMessage;
use crate::fbsp::message::{FbspMessage, MessageType};

/// Which side of the session the local handler represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Client,
    Service,
}

impl PeerRole {
    /// Message types the *other* peer (across the wire) is permitted to
    /// send to a handler playing this role.
    fn permitted_from_peer(self) -> &'static [MessageType] {
        match self {
            // We are the CLIENT's handler; the peer is the SERVICE.
            PeerRole::Client => &[
                MessageType::Error,
                MessageType::Welcome,
                MessageType::Noop,
                MessageType::Reply,
                MessageType::Data,
                MessageType::State,
                MessageType::Close,
            ],
            // We are the SERVICE's handler; the peer is the CLIENT.
            PeerRole::Service => &[
                MessageType::Hello,
                MessageType::Noop,
                MessageType::Request,
                MessageType::Cancel,
                MessageType::Data,
                MessageType::Close,
            ],
        }
    }
}

/// Validate one incoming multi-frame message.
///
/// `role` is the *local* handler's role (the role gate checks whether the
/// remote peer — the other role — is allowed to send this message type).
/// `greeting` is `true` for the first message expected from a routing id
/// that has no session yet.
pub fn validate(
    header: &FbspHeader,
    frames: &[Bytes],
    role: PeerRole,
    greeting: bool,
) -> Result<FbspMessage, InvalidMessage> {
    let message = FbspMessage::from_wire(header, frames)?;

    if greeting {
        let ok = match (role, message.message_type()) {
            (PeerRole::Service, MessageType::Hello) => true,
            (PeerRole::Client, MessageType::Welcome) => true,
            _ => false,
        };
        if !ok {
            return Err(InvalidMessage::NotAGreeting {
                message_type: message.message_type().name(),
            });
        }
        return Ok(message);
    }

    let permitted = role.permitted_from_peer();
    let message_type = message.message_type();
    if permitted.contains(&message_type) {
        return Ok(message);
    }

    // ACK_REPLY exception: a reply-direction message arriving with
    // ACK_REPLY set is allowed regardless of which side "owns" that type,
    // as long as the type is one that carries acknowledgements at all.
    if header.flags.contains(FbspFlags::ACK_REPLY)
        && matches!(
            message_type,
            MessageType::Noop
                | MessageType::Request
                | MessageType::Reply
                | MessageType::Data
                | MessageType::State
                | MessageType::Cancel
        )
    {
        return Ok(message);
    }

    Err(InvalidMessage::NotPermittedForRole {
        message_type: message_type.name(),
        role: match role {
            PeerRole::Client => "CLIENT",
            PeerRole::Service => "SERVICE",
        },
    })
}
