//! Send path with per-session deferral: non-blocking sends that fall back
//! to a FIFO retry queue on `EAGAIN`, with a suspend/resume/cancel timeout.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::control::FbspHeader;
use crate::error::ChannelError;
use crate::fbsp::session::{RoutingId, Session};

/// How long a session may stay suspended (queued sends failing with
/// `EAGAIN`) before it is cancelled.
pub const DEFAULT_RESUME_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one non-blocking multipart send attempt against the
/// underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    WouldBlock,
    HostUnreachable,
}

/// Whatever backs the actual wire send. [`crate::channel::Channel`]
/// implements this; tests use a simple in-memory fake.
pub trait FrameSink {
    fn try_send(
        &mut self,
        routing_id: Option<&RoutingId>,
        header: &FbspHeader,
        frames: &[Bytes],
    ) -> Result<SendOutcome, ChannelError>;
}

/// Hooks a send-path owner implements to react to suspension lifecycle
/// events. The default (no-op) implementations just log, the right
/// behaviour for a recoverable condition nobody has opted in to handle.
pub trait SendHooks {
    fn suspend_session(&mut self, routing_id: &RoutingId) {
        debug!(?routing_id, "session suspended pending retry");
    }
    fn resume_session(&mut self, routing_id: &RoutingId) {
        debug!(?routing_id, "session resumed");
    }
    fn cancel_session(&mut self, routing_id: &RoutingId) {
        warn!(?routing_id, "session cancelled");
    }
}

/// Attempt to send one message, deferring to the session's queue on
/// backpressure.
///
/// Returns `Ok(true)` if the frames went out on the wire immediately,
/// `Ok(false)` if they were queued (or appended behind an already-queued
/// backlog) for a later retry.
pub fn send(
    sink: &mut dyn FrameSink,
    session: Option<&mut Session>,
    header: FbspHeader,
    frames: Vec<Bytes>,
    defer: bool,
    hooks: &mut dyn SendHooks,
) -> Result<bool, ChannelError> {
    let Some(session) = session else {
        // No session: always a direct, non-deferred attempt.
        match sink.try_send(None, &header, &frames)? {
            SendOutcome::Sent => return Ok(true),
            SendOutcome::WouldBlock => return Err(ChannelError::WouldBlock),
            SendOutcome::HostUnreachable => return Err(ChannelError::HostUnreachable),
        }
    };

    if !session.deferred_messages.is_empty() {
        session.deferred_messages.push_back((header, frames));
        return Ok(false);
    }

    match sink.try_send(Some(&session.routing_id), &header, &frames)? {
        SendOutcome::Sent => Ok(true),
        SendOutcome::WouldBlock if defer => {
            session.deferred_messages.push_back((header, frames));
            session.pending_since = Some(Instant::now());
            hooks.suspend_session(&session.routing_id);
            Ok(false)
        }
        SendOutcome::HostUnreachable if defer => {
            hooks.cancel_session(&session.routing_id);
            Ok(false)
        }
        SendOutcome::WouldBlock => Err(ChannelError::WouldBlock),
        SendOutcome::HostUnreachable => Err(ChannelError::HostUnreachable),
    }
}

/// Drain a suspended session's deferred queue in strict FIFO order,
/// attempting each send. Schedule this from the channel manager's deferred
/// task queue whenever a session is suspended.
///
/// On success of the first queued send, `resume_session` fires. When the
/// queue drains completely the session exits suspension. A repeated
/// `EAGAIN` re-arms suspension (the caller is responsible for
/// rescheduling this function); any other error, or `now - pending_since
/// >= resume_timeout`, cancels the session and the queue is cleared.
pub fn retry_send(
    sink: &mut dyn FrameSink,
    session: &mut Session,
    resume_timeout: Duration,
    hooks: &mut dyn SendHooks,
) -> RetryOutcome {
    if session.deferred_messages.is_empty() {
        session.pending_since = None;
        return RetryOutcome::Idle;
    }

    let mut sent_any = false;
    while let Some((header, frames)) = session.deferred_messages.front().cloned() {
        match sink.try_send(Some(&session.routing_id), &header, &frames) {
            Ok(SendOutcome::Sent) => {
                session.deferred_messages.pop_front();
                if !sent_any {
                    sent_any = true;
                    hooks.resume_session(&session.routing_id);
                }
            }
            Ok(SendOutcome::WouldBlock) => {
                let since = *session.pending_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= resume_timeout {
                    session.deferred_messages.clear();
                    session.pending_since = None;
                    hooks.cancel_session(&session.routing_id);
                    return RetryOutcome::Cancelled;
                }
                return RetryOutcome::StillBlocked;
            }
            Ok(SendOutcome::HostUnreachable) | Err(_) => {
                session.deferred_messages.clear();
                session.pending_since = None;
                hooks.cancel_session(&session.routing_id);
                return RetryOutcome::Cancelled;
            }
        }
    }

    session.pending_since = None;
    RetryOutcome::Drained
}

/// Result of one `retry_send` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Nothing was queued.
    Idle,
    /// The queue fully drained.
    Drained,
    /// At least one send succeeded but frames remain queued.
    StillBlocked,
    /// `resume_timeout` was exceeded or a fatal error occurred; the session
    /// was cancelled.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::FbspFlags;
    use crate::descriptor::{AgentDescriptor, PeerDescriptor, Uid};
    use crate::fbsp::message::FbspMessage;
    use std::cell::Cell;

    struct NoopHooks;
    impl SendHooks for NoopHooks {}

    /// A fake sink whose blocking behaviour is toggled by the test and
    /// which records the token of every frame header it actually sent.
    struct FakeSink {
        blocked: Cell<bool>,
        sent_tokens: Vec<u64>,
    }

    impl FakeSink {
        fn new(blocked: bool) -> Self {
            FakeSink {
                blocked: Cell::new(blocked),
                sent_tokens: Vec::new(),
            }
        }

        fn unblock(&mut self) {
            self.blocked.set(false);
        }
    }

    impl FrameSink for FakeSink {
        fn try_send(
            &mut self,
            _routing_id: Option<&RoutingId>,
            header: &FbspHeader,
            _frames: &[Bytes],
        ) -> Result<SendOutcome, ChannelError> {
            if self.blocked.get() {
                return Ok(SendOutcome::WouldBlock);
            }
            self.sent_tokens.push(crate::control::token_from_bytes(header.token));
            Ok(SendOutcome::Sent)
        }
    }

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

    fn test_session() -> Session {
        Session::new(RoutingId::Remote(Bytes::from_static(b"peer")), greeting())
    }

    #[test]
    fn fifo_order_preserved_across_deferral() {
        let mut session = test_session();
        let mut sink = FakeSink::new(true);
        let mut hooks = NoopHooks;

        for i in 1u64..=3 {
            let msg = FbspMessage::Noop {
                token: i,
                flags: FbspFlags::empty(),
            };
            let (header, frames) = msg.to_wire();
            let sent = send(&mut sink, Some(&mut session), header, frames, true, &mut hooks).unwrap();
            assert!(!sent);
        }
        assert_eq!(session.deferred_messages.len(), 3);

        sink.unblock();
        let outcome = retry_send(&mut sink, &mut session, DEFAULT_RESUME_TIMEOUT, &mut hooks);
        assert_eq!(outcome, RetryOutcome::Drained);
        assert_eq!(sink.sent_tokens, vec![1, 2, 3]);
    }

    #[test]
    fn suspension_past_timeout_cancels_session() {
        let mut session = test_session();
        let mut sink = FakeSink::new(true);
        let mut hooks = NoopHooks;

        let msg = FbspMessage::Noop { token: 1, flags: FbspFlags::empty() };
        let (header, frames) = msg.to_wire();
        send(&mut sink, Some(&mut session), header, frames, true, &mut hooks).unwrap();

        session.pending_since = Some(Instant::now() - Duration::from_secs(11));
        let outcome = retry_send(&mut sink, &mut session, DEFAULT_RESUME_TIMEOUT, &mut hooks);
        assert_eq!(outcome, RetryOutcome::Cancelled);
        assert!(session.deferred_messages.is_empty());
    }

    #[test]
    fn no_session_send_is_never_deferred() {
        let mut sink = FakeSink::new(true);
        let mut hooks = NoopHooks;
        let msg = FbspMessage::Noop { token: 1, flags: FbspFlags::empty() };
        let (header, frames) = msg.to_wire();
        let err = send(&mut sink, None, header, frames, true, &mut hooks).unwrap_err();
        assert!(matches!(err, ChannelError::WouldBlock));
    }
}
