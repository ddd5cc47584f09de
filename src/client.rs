//! Client-side request/response helper: send a REQUEST and poll for its
//! correlated REPLY against a deadline, reconstructing a remote error from
//! a correlated ERROR instead of a REPLY.

use std::time::Duration;

use crate::channel::Channel;
use crate::control::FbspHeader;
use crate::error::{ClientError, ErrorCode};
use crate::fbsp::message::FbspMessage;
use crate::fbsp::send::{self, SendHooks};
use crate::fbsp::session::Session;

struct NoopHooks;
impl SendHooks for NoopHooks {}

/// Send `request` (its token is whatever the caller already allocated) and
/// wait up to `timeout` for the REPLY correlated by that same token,
/// reconstructing [`ClientError::Remote`] from a correlated ERROR instead.
/// Any other message seen while waiting (a NOOP ack, a DATA frame, a reply
/// to a different in-flight token) is skipped.
pub async fn request(
    channel: &mut Channel,
    session: &mut Session,
    request: FbspMessage,
    timeout: Duration,
) -> Result<FbspMessage, ClientError> {
    let token = request.token();
    let (header, frames) = request.to_wire();
    send::send(channel, Some(session), header, frames, true, &mut NoopHooks)?;

    let wait = async {
        loop {
            let inbound = match channel.recv().await {
                Some(inbound) => inbound,
                None => return Err(ClientError::ConnectionClosed),
            };
            if inbound.frames.is_empty() {
                continue;
            }
            let Ok(header) = FbspHeader::unpack(&inbound.frames[0]) else { continue };
            let Ok(message) = FbspMessage::from_wire(&header, &inbound.frames[1..]) else { continue };
            if message.token() != token {
                continue;
            }
            match message {
                FbspMessage::Reply { .. } => return Ok(message),
                FbspMessage::Error { error_code, relates_to, descriptions, .. } => {
                    return Err(ClientError::Remote {
                        error_code: ErrorCode::from_u16(error_code).unwrap_or(ErrorCode::Error),
                        relates_to: relates_to.name(),
                        descriptions,
                    });
                }
                _ => continue,
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelMode, SocketKind};
    use crate::control::FbspFlags;
    use crate::descriptor::{AgentDescriptor, PeerDescriptor, Uid};
    use crate::endpoint::Endpoint;
    use crate::fbsp::send::FrameSink;
    use crate::fbsp::session::RoutingId;
    use bytes::Bytes;

    fn greeting() -> FbspMessage {
        FbspMessage::Hello {
            token: 0,
            peer: PeerDescriptor {
                uid: Uid::new("p"),
                pid: 1,
                host: "h".into(),
                supplement: None,
            },
            agent: AgentDescriptor {
                uid: Uid::new("a"),
                name: "n".into(),
                version: "1".into(),
                vendor_uid: Uid::new("v"),
                classification: "c".into(),
                platform_uid: Uid::new("pl"),
                platform_version: "1".into(),
                supplement: None,
            },
        }
    }

    #[tokio::test]
    async fn request_resolves_on_matching_reply() {
        let endpoint = Endpoint::parse("inproc://client-request-test").unwrap();
        let mut server = Channel::open(SocketKind::Pair, ChannelMode::Bind, endpoint.clone())
            .await
            .unwrap();
        let mut client_channel = Channel::open(SocketKind::Pair, ChannelMode::Connect, endpoint)
            .await
            .unwrap();
        let mut session = Session::new(RoutingId::Internal, greeting());

        let request_msg = FbspMessage::Request {
            token: 1,
            interface_number: 1,
            api_code: 1,
            flags: FbspFlags::empty(),
            frames: vec![Bytes::from_static(b"ping")],
        };

        let client_task = tokio::spawn(async move {
            request(&mut client_channel, &mut session, request_msg, Duration::from_secs(2)).await
        });

        let inbound = server.recv().await.expect("request arrives");
        let header = FbspHeader::unpack(&inbound.frames[0]).unwrap();
        let parsed = FbspMessage::from_wire(&header, &inbound.frames[1..]).unwrap();

        let reply = FbspMessage::Reply {
            token: parsed.token(),
            interface_number: 1,
            api_code: 1,
            flags: FbspFlags::empty(),
            frames: vec![Bytes::from_static(b"pong")],
        };
        let (reply_header, reply_frames) = reply.to_wire();
        server.try_send(None, &reply_header, &reply_frames).unwrap();

        match client_task.await.unwrap() {
            Ok(FbspMessage::Reply { frames, .. }) => assert_eq!(frames, vec![Bytes::from_static(b"pong")]),
            other => panic!("expected Ok(Reply), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_times_out_with_no_response() {
        let endpoint = Endpoint::parse("inproc://client-request-timeout-test").unwrap();
        let _server = Channel::open(SocketKind::Pair, ChannelMode::Bind, endpoint.clone())
            .await
            .unwrap();
        let mut client_channel = Channel::open(SocketKind::Pair, ChannelMode::Connect, endpoint)
            .await
            .unwrap();
        let mut session = Session::new(RoutingId::Internal, greeting());

        let request_msg = FbspMessage::Request {
            token: 1,
            interface_number: 1,
            api_code: 1,
            flags: FbspFlags::empty(),
            frames: vec![],
        };
        let result = request(&mut client_channel, &mut session, request_msg, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ClientError::Timeout)));
    }
}
