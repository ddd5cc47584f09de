//! End-to-end protocol flows exercised against the public session/pipe API,
//! independent of any live transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use fbsp::control::FbspFlags;
use fbsp::descriptor::{AgentDescriptor, PeerDescriptor, PipeStream, Uid};
use fbsp::error::{ChannelError, ErrorCode, PipeCloseCode};
use fbsp::fbdp::message::FbdpMessage;
use fbsp::fbdp::pipe::{Pipe, PipeRole, PipeState, SendOutcome as PipeSendOutcome};
use fbsp::fbsp::send::{self, FrameSink, RetryOutcome, SendHooks, SendOutcome};
use fbsp::fbsp::session::RoutingId;
use fbsp::{DispatchTable, FbspMessage, MessageType, PeerRole, SessionHandler};

fn hello() -> FbspMessage {
    FbspMessage::Hello {
        token: 0,
        peer: PeerDescriptor {
            uid: Uid::new("client-1"),
            pid: 42,
            host: "localhost".into(),
            supplement: None,
        },
        agent: AgentDescriptor {
            uid: Uid::new("agent-1"),
            name: "tester".into(),
            version: "1.0".into(),
            vendor_uid: Uid::new("vendor"),
            classification: "client".into(),
            platform_uid: Uid::new("platform"),
            platform_version: "1".into(),
            supplement: None,
        },
    }
}

#[test]
fn scenario_echo_round_trip() {
    let mut dispatch = DispatchTable::new();
    dispatch.register(
        MessageType::Request,
        Arc::new(|_session, msg| {
            if let FbspMessage::Request { token, interface_number, api_code, frames, .. } = msg {
                Ok(Some(FbspMessage::Reply {
                    token: *token,
                    interface_number: *interface_number,
                    api_code: *api_code,
                    flags: FbspFlags::empty(),
                    frames: frames.clone(),
                }))
            } else {
                Ok(None)
            }
        }),
    );
    let mut handler = SessionHandler::new(PeerRole::Service, dispatch);
    let rid = RoutingId::Remote(Bytes::from_static(b"client-1"));

    let (header, frames) = hello().to_wire();
    assert!(handler.receive(rid.clone(), &header, &frames).is_none());

    let request = FbspMessage::Request {
        token: 1,
        interface_number: 2,
        api_code: 3,
        flags: FbspFlags::empty(),
        frames: vec![Bytes::from_static(b"ping")],
    };
    let (header, frames) = request.to_wire();
    let reply = handler.receive(rid, &header, &frames).unwrap();
    match reply {
        FbspMessage::Reply { token, frames, .. } => {
            assert_eq!(token, 1);
            assert_eq!(frames, vec![Bytes::from_static(b"ping")]);
        }
        other => panic!("expected Reply, got {other:?}"),
    }
}

#[test]
fn scenario_ack_reply_streaming() {
    let mut handler = SessionHandler::new(PeerRole::Service, DispatchTable::new());
    let rid = RoutingId::Remote(Bytes::from_static(b"client-2"));
    let (header, frames) = hello().to_wire();
    handler.receive(rid.clone(), &header, &frames);

    // No handler registered for DATA, but ACK_REQ still gets ACK_REPLY back
    // from the default no-handler fallback.
    let data = FbspMessage::Data {
        token: 7,
        handle: 1,
        flags: FbspFlags::ACK_REQ | FbspFlags::MORE,
        payload: Bytes::from_static(b"chunk-1"),
    };
    let (header, frames) = data.to_wire();
    let reply = handler.receive(rid, &header, &frames).unwrap();
    match reply {
        FbspMessage::Data { token, handle, flags, payload } => {
            assert_eq!(token, 7);
            assert_eq!(handle, 1);
            assert_eq!(flags, FbspFlags::ACK_REPLY);
            assert!(payload.is_empty());
        }
        other => panic!("expected Data ack, got {other:?}"),
    }
}

#[test]
fn scenario_handle_binding_is_stable() {
    let mut dispatch = DispatchTable::new();
    dispatch.register_exact(
        MessageType::Request,
        ((1u16) << 8) | 1,
        Arc::new(|session, msg| {
            if let FbspMessage::Request { token, .. } = msg {
                let handle = session.get_handle(*token).expect("handle available");
                Ok(Some(FbspMessage::Reply {
                    token: *token,
                    interface_number: 1,
                    api_code: 1,
                    flags: FbspFlags::empty(),
                    frames: vec![Bytes::copy_from_slice(&handle.to_le_bytes())],
                }))
            } else {
                Ok(None)
            }
        }),
    );
    let mut handler = SessionHandler::new(PeerRole::Service, dispatch);
    let rid = RoutingId::Remote(Bytes::from_static(b"client-3"));
    let (header, frames) = hello().to_wire();
    handler.receive(rid.clone(), &header, &frames);

    let request = |token| FbspMessage::Request {
        token,
        interface_number: 1,
        api_code: 1,
        flags: FbspFlags::empty(),
        frames: vec![],
    };

    let (header, frames) = request(1).to_wire();
    let reply1 = handler.receive(rid.clone(), &header, &frames).unwrap();
    let (header, frames) = request(1).to_wire();
    let reply1_again = handler.receive(rid.clone(), &header, &frames).unwrap();
    let (header, frames) = request(2).to_wire();
    let reply2 = handler.receive(rid, &header, &frames).unwrap();

    let handle_of = |msg: &FbspMessage| match msg {
        FbspMessage::Reply { frames, .. } => u16::from_le_bytes([frames[0][0], frames[0][1]]),
        _ => panic!("expected Reply"),
    };
    assert_eq!(handle_of(&reply1), handle_of(&reply1_again));
    assert_ne!(handle_of(&reply1), handle_of(&reply2));
}

#[test]
fn scenario_bad_data_frame_count_is_rejected_without_tearing_down_session() {
    let mut handler = SessionHandler::new(PeerRole::Service, DispatchTable::new());
    let rid = RoutingId::Remote(Bytes::from_static(b"client-4"));
    let (header, frames) = hello().to_wire();
    handler.receive(rid.clone(), &header, &frames);
    assert!(handler.session(&rid).is_some());

    // A DATA message must carry exactly one payload frame.
    let bad_header = fbsp::control::FbspHeader::new(
        MessageType::Data as u8,
        FbspFlags::empty(),
        1,
        fbsp::control::token_to_bytes(9),
    );
    let reply = handler.receive(rid.clone(), &bad_header, &[]);
    assert!(reply.is_none());
    assert!(handler.session(&rid).is_some(), "malformed message must not tear down the session");
}

#[test]
fn scenario_greeting_rejection_drops_routing_id() {
    let mut handler = SessionHandler::new(PeerRole::Service, DispatchTable::new());
    let rid = RoutingId::Remote(Bytes::from_static(b"client-5"));

    // A WELCOME is not a valid greeting for a service-role handler.
    let welcome = FbspMessage::Welcome {
        token: 0,
        peer: hello_peer(),
        agent: hello_agent(),
        interfaces: vec![],
    };
    let (header, frames) = welcome.to_wire();
    let reply = handler.receive(rid.clone(), &header, &frames);
    assert!(reply.is_none());
    assert!(handler.session(&rid).is_none());
}

fn hello_peer() -> PeerDescriptor {
    match hello() {
        FbspMessage::Hello { peer, .. } => peer,
        _ => unreachable!(),
    }
}

fn hello_agent() -> AgentDescriptor {
    match hello() {
        FbspMessage::Hello { agent, .. } => agent,
        _ => unreachable!(),
    }
}

struct NoopHooks;
impl SendHooks for NoopHooks {}

/// A fake sink that always reports `HostUnreachable`, modelling a peer
/// that's gone away mid-stream.
struct UnreachableSink;
impl FrameSink for UnreachableSink {
    fn try_send(
        &mut self,
        _routing_id: Option<&RoutingId>,
        _header: &fbsp::control::FbspHeader,
        _frames: &[Bytes],
    ) -> Result<SendOutcome, ChannelError> {
        Ok(SendOutcome::HostUnreachable)
    }
}

#[test]
fn scenario_backpressure_cancels_on_host_unreachable() {
    let mut session = fbsp::fbsp::session::Session::new(
        RoutingId::Remote(Bytes::from_static(b"client-6")),
        hello(),
    );
    let mut sink = UnreachableSink;
    let mut hooks = NoopHooks;

    let msg = FbspMessage::Noop { token: 1, flags: FbspFlags::empty() };
    let (header, frames) = msg.to_wire();
    let sent = send::send(&mut sink, Some(&mut session), header, frames, true, &mut hooks).unwrap();
    assert!(!sent);
    assert!(session.deferred_messages.is_empty(), "HOST_UNREACHABLE cancels rather than queues");
}

#[test]
fn scenario_suspended_session_times_out_and_cancels() {
    struct BlockedSink;
    impl FrameSink for BlockedSink {
        fn try_send(
            &mut self,
            _routing_id: Option<&RoutingId>,
            _header: &fbsp::control::FbspHeader,
            _frames: &[Bytes],
        ) -> Result<SendOutcome, ChannelError> {
            Ok(SendOutcome::WouldBlock)
        }
    }

    let mut session = fbsp::fbsp::session::Session::new(
        RoutingId::Remote(Bytes::from_static(b"client-7")),
        hello(),
    );
    let mut sink = BlockedSink;
    let mut hooks = NoopHooks;

    let msg = FbspMessage::Noop { token: 1, flags: FbspFlags::empty() };
    let (header, frames) = msg.to_wire();
    send::send(&mut sink, Some(&mut session), header, frames, true, &mut hooks).unwrap();
    session.pending_since = Some(Instant::now() - Duration::from_secs(20));

    let outcome = send::retry_send(&mut sink, &mut session, Duration::from_secs(10), &mut hooks);
    assert_eq!(outcome, RetryOutcome::Cancelled);
}

#[test]
fn fbdp_pipe_backpressure_flows_through_vouchers() {
    let mut pipe = Pipe::new(PipeRole::Producer, Uid::new("p1"), PipeStream::Output, "text/csv".into());
    let open = pipe.open();
    assert!(matches!(open, FbdpMessage::Open { .. }));
    assert_eq!(pipe.state(), PipeState::Open);

    assert_eq!(pipe.send_data(Bytes::from_static(b"row1")), PipeSendOutcome::Deferred);
    pipe.on_ready_received(1);
    let sent = pipe.drain();
    assert_eq!(sent.len(), 1);

    let close = pipe.close(PipeCloseCode::Ok, None);
    assert_eq!(close, FbdpMessage::Close { code: PipeCloseCode::Ok, message: None });
    assert_eq!(pipe.state(), PipeState::Closed);
}

#[test]
fn not_implemented_error_uses_expected_code() {
    assert_eq!(ErrorCode::NotImplemented.as_u16(), 4);
}
