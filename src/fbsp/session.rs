//! FBSP session table, handshake state machine, request bookkeeping, and
//! the dispatch table that routes an established session's messages.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::{InvalidMessage, ServiceError};
use crate::fbsp::message::{FbspMessage, MessageType};
use crate::fbsp::validator::{self, PeerRole};
use crate::control::FbspHeader;

/// Routing identity a session is keyed by: either a transport-assigned
/// routing id, or the `INTERNAL` sentinel for unrouted (PAIR-like) channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingId {
    Internal,
    Remote(Bytes),
}

/// Handshake lifecycle of a session. `Fresh`/`AwaitingGreeting` have no
/// [`Session`] row at all — a routing id without a session row is in one of
/// those two states by definition, so only the states a stored `Session`
/// can actually be in are represented here. CLOSE is never retried and
/// discards the session row outright, so a stored session only ever moves
/// `Established -> Closed` right before removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Established,
    Closed,
}

/// A stored REQUEST message plus handler-annotated bookkeeping slots,
/// kept as an explicit record rather than dynamic attribute attachment.
#[derive(Debug, Clone)]
pub struct Request {
    pub token: u64,
    pub interface_number: u8,
    pub api_code: u8,
    pub payload: Vec<Bytes>,
    pub handle: Option<u16>,
}

/// Per-peer FBSP session state, keyed by [`RoutingId`].
pub struct Session {
    pub routing_id: RoutingId,
    /// Set when this session represents an outbound connection the handler
    /// itself opened; closing the session then disconnects this endpoint.
    pub endpoint_address: Option<Endpoint>,
    pub greeting: FbspMessage,
    pub requests: HashMap<u64, Request>,
    pub handles: HashMap<u16, u64>,
    pub deferred_messages: VecDeque<(FbspHeader, Vec<Bytes>)>,
    pub pending_since: Option<Instant>,
    state: SessionState,
}

impl Session {
    /// Construct a session directly from an already-validated greeting.
    /// `SessionHandler::receive` is the normal way a session comes into
    /// being; this is exposed for tests and for embedders driving the send
    /// path or pipe engine without a live `SessionHandler`.
    pub fn new(routing_id: RoutingId, greeting: FbspMessage) -> Self {
        Session {
            routing_id,
            endpoint_address: None,
            greeting,
            requests: HashMap::new(),
            handles: HashMap::new(),
            deferred_messages: VecDeque::new(),
            pending_since: None,
            state: SessionState::Established,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.pending_since.is_some()
    }

    /// Store an incoming REQUEST keyed by its token.
    pub fn note_request(&mut self, msg: &FbspMessage) {
        if let FbspMessage::Request {
            token,
            interface_number,
            api_code,
            frames,
            ..
        } = msg
        {
            self.requests.insert(
                *token,
                Request {
                    token: *token,
                    interface_number: *interface_number,
                    api_code: *api_code,
                    payload: frames.clone(),
                    handle: None,
                },
            );
        }
    }

    /// Lazily allocate the smallest unused positive handle for `token`,
    /// returning the same handle on subsequent calls for the same token.
    ///
    /// Once every value in `1..=u16::MAX` is in use, this returns
    /// `INSUFFICIENT_STORAGE` rather than reusing a handle or panicking.
    pub fn get_handle(&mut self, token: u64) -> Result<u16, ServiceError> {
        if let Some(req) = self.requests.get(&token) {
            if let Some(h) = req.handle {
                return Ok(h);
            }
        }
        let mut candidate: u16 = 1;
        loop {
            if candidate == 0 {
                return Err(ServiceError::Protocol(
                    crate::error::ErrorCode::InsufficientStorage,
                    "no free request handles remain".to_string(),
                ));
            }
            if !self.handles.contains_key(&candidate) {
                break;
            }
            candidate = candidate.wrapping_add(1);
        }
        self.handles.insert(candidate, token);
        if let Some(req) = self.requests.get_mut(&token) {
            req.handle = Some(candidate);
        }
        Ok(candidate)
    }

    /// Resolve a handle back to its owning request's token.
    pub fn token_for_handle(&self, handle: u16) -> Option<u64> {
        self.handles.get(&handle).copied()
    }

    /// Free the handle (if any) and drop the stored request.
    pub fn request_done(&mut self, token: u64) {
        if let Some(req) = self.requests.remove(&token) {
            if let Some(h) = req.handle {
                self.handles.remove(&h);
            }
        }
    }

    fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }
}

/// Client-side monotonic token generator: 8-byte little-endian counters
/// starting at 1, strictly increasing per client handler instance.
pub struct TokenGenerator {
    next: AtomicU64,
}

impl TokenGenerator {
    pub fn new() -> Self {
        TokenGenerator { next: AtomicU64::new(1) }
    }

    pub fn next_token(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of dispatching one established-session message: zero or one
/// reply message to send back to the same peer.
pub type DispatchFn = Arc<dyn Fn(&mut Session, &FbspMessage) -> Result<Option<FbspMessage>, ServiceError> + Send + Sync>;

/// Routes established-session messages by `(message_type, type_data)` then
/// by `message_type` alone, falling back to a default handler. Mirrors a
/// method-id dispatch table keyed the same two-level way.
#[derive(Default)]
pub struct DispatchTable {
    by_type_and_data: HashMap<(u8, u16), DispatchFn>,
    by_type: HashMap<u8, DispatchFn>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_exact(&mut self, message_type: MessageType, type_data: u16, handler: DispatchFn) {
        self.by_type_and_data.insert((message_type as u8, type_data), handler);
    }

    pub fn register(&mut self, message_type: MessageType, handler: DispatchFn) {
        self.by_type.insert(message_type as u8, handler);
    }

    fn lookup(&self, message_type: u8, type_data: u16) -> Option<&DispatchFn> {
        self.by_type_and_data
            .get(&(message_type, type_data))
            .or_else(|| self.by_type.get(&message_type))
    }
}

/// Default handler invoked when dispatch has no registered entry: per
/// emits an ERROR/NOT_IMPLEMENTED for the SERVICE role (the peer made a
/// request we don't support), and simply logs for the CLIENT role (a
/// server is allowed to outlive the client's knowledge of new message
/// kinds).
fn default_dispatch(role: PeerRole, msg: &FbspMessage) -> Option<FbspMessage> {
    match role {
        PeerRole::Service => Some(FbspMessage::Error {
            token: msg.token(),
            error_code: crate::error::ErrorCode::NotImplemented.as_u16(),
            relates_to: match msg.message_type() {
                mt @ (MessageType::Hello
                | MessageType::Noop
                | MessageType::Request
                | MessageType::Data
                | MessageType::Cancel
                | MessageType::Close) => mt,
                _ => MessageType::Noop,
            },
            descriptions: vec![crate::descriptor::ErrorDescription {
                code: crate::error::ErrorCode::NotImplemented.as_u16(),
                description: format!("no handler registered for {}", msg.message_type().name()),
            }],
        }),
        PeerRole::Client => {
            debug!(message_type = msg.message_type().name(), "no handler registered, ignoring");
            None
        }
    }
}

/// A session handler: owns the session table for one channel, the peer
/// role it plays, and the dispatch table for established sessions.
pub struct SessionHandler {
    role: PeerRole,
    sessions: HashMap<RoutingId, Session>,
    dispatch: DispatchTable,
    token_gen: TokenGenerator,
    /// Endpoints this handler dialed itself, keyed by the routing id the
    /// resulting connection will greet under. Consumed the moment the
    /// greeting for that routing id arrives and stamped onto the new
    /// `Session`, mirroring a connect-then-greet outbound flow.
    pending_outbound: HashMap<RoutingId, Endpoint>,
    /// Set when a CLOSE just discarded a session that had an outbound
    /// endpoint recorded; the channel owner drains this to actually tear
    /// the connection down.
    pending_disconnect: Option<Endpoint>,
}

impl SessionHandler {
    pub fn new(role: PeerRole, dispatch: DispatchTable) -> Self {
        SessionHandler {
            role,
            sessions: HashMap::new(),
            dispatch,
            token_gen: TokenGenerator::new(),
            pending_outbound: HashMap::new(),
            pending_disconnect: None,
        }
    }

    /// Record that `routing_id` is the routing id under which a connection
    /// this handler just dialed to `endpoint_address` will greet. The next
    /// session created for that routing id carries the endpoint, so
    /// discarding the session on CLOSE also disconnects it.
    pub fn note_outbound_connection(&mut self, routing_id: RoutingId, endpoint_address: Endpoint) {
        self.pending_outbound.insert(routing_id, endpoint_address);
    }

    /// Take the endpoint a just-processed CLOSE left pending disconnect, if
    /// any. The channel owner should call this right after `receive` and
    /// disconnect the returned endpoint.
    pub fn take_pending_disconnect(&mut self) -> Option<Endpoint> {
        self.pending_disconnect.take()
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn token_generator(&self) -> &TokenGenerator {
        &self.token_gen
    }

    pub fn session(&self, routing_id: &RoutingId) -> Option<&Session> {
        self.sessions.get(routing_id)
    }

    pub fn session_mut(&mut self, routing_id: &RoutingId) -> Option<&mut Session> {
        self.sessions.get_mut(routing_id)
    }

    pub fn discard_session(&mut self, routing_id: &RoutingId) -> Option<Session> {
        self.sessions.remove(routing_id)
    }

    /// Process one incoming multi-frame message for `routing_id`.
    ///
    /// Returns the reply to send back to the same peer, if any. Wire-format
    /// and greeting failures are reported through `on_invalid_message`/
    /// `on_invalid_greeting` (default: log) rather than propagated: a
    /// malformed message never tears down an already-established session.
    pub fn receive(&mut self, routing_id: RoutingId, header: &FbspHeader, frames: &[Bytes]) -> Option<FbspMessage> {
        let greeting = !self.sessions.contains_key(&routing_id);

        let message = match validator::validate(header, frames, self.role, greeting) {
            Ok(m) => m,
            Err(e) => {
                if greeting {
                    warn!(error = %e, ?routing_id, "greeting validation failed, dropping routing id");
                } else {
                    warn!(error = %e, ?routing_id, "invalid message, session retained");
                }
                return None;
            }
        };

        if greeting {
            let endpoint_address = self.pending_outbound.remove(&routing_id);
            match self.sessions.entry(routing_id.clone()) {
                Entry::Occupied(_) => unreachable!("checked contains_key above"),
                Entry::Vacant(v) => {
                    let mut session = Session::new(routing_id, message);
                    session.endpoint_address = endpoint_address;
                    v.insert(session);
                }
            }
            return None;
        }

        if matches!(message.message_type(), MessageType::Close) {
            if let Some(mut session) = self.sessions.remove(&routing_id) {
                session.mark_closed();
                debug!(?session.routing_id, "session closed by peer CLOSE");
                if let Some(endpoint) = session.endpoint_address.take() {
                    debug!(?endpoint, "disconnecting outbound endpoint for closed session");
                    self.pending_disconnect = Some(endpoint);
                }
            }
            return None;
        }

        let type_data = match &message {
            FbspMessage::Request { interface_number, api_code, .. } => {
                ((*interface_number as u16) << 8) | *api_code as u16
            }
            FbspMessage::Reply { interface_number, api_code, .. } => {
                ((*interface_number as u16) << 8) | *api_code as u16
            }
            FbspMessage::Data { handle, .. } => *handle,
            _ => 0,
        };

        let handler = self
            .dispatch
            .lookup(message.message_type() as u8, type_data)
            .cloned();

        let session = self.sessions.get_mut(&routing_id)?;
        if matches!(message.message_type(), MessageType::Request) {
            session.note_request(&message);
        }

        let outcome = match handler {
            Some(f) => f(session, &message).unwrap_or_else(|e| {
                warn!(error = %e, "dispatch handler error");
                Some(FbspMessage::Error {
                    token: message.token(),
                    error_code: crate::error::ErrorCode::InternalServiceError.as_u16(),
                    relates_to: MessageType::Request,
                    descriptions: vec![crate::descriptor::ErrorDescription {
                        code: crate::error::ErrorCode::InternalServiceError.as_u16(),
                        description: e.to_string(),
                    }],
                })
            }),
            None => {
                if let Some(ack) = message.ack_reply() {
                    Some(ack)
                } else {
                    default_dispatch(self.role, &message)
                }
            }
        };

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::FbspFlags;
    use crate::descriptor::{AgentDescriptor, PeerDescriptor, Uid};

    fn hello() -> FbspMessage {
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

    #[test]
    fn first_message_establishes_session_on_valid_greeting() {
        let mut handler = SessionHandler::new(PeerRole::Service, DispatchTable::new());
        let rid = RoutingId::Remote(Bytes::from_static(b"client-1"));
        let (header, frames) = hello().to_wire();
        let reply = handler.receive(rid.clone(), &header, &frames);
        assert!(reply.is_none());
        assert!(handler.session(&rid).is_some());
    }

    #[test]
    fn invalid_greeting_does_not_create_session() {
        let mut handler = SessionHandler::new(PeerRole::Service, DispatchTable::new());
        let rid = RoutingId::Remote(Bytes::from_static(b"client-1"));
        let header = FbspHeader::new(MessageType::Noop as u8, FbspFlags::empty(), 0, [0; 8]);
        let reply = handler.receive(rid.clone(), &header, &[]);
        assert!(reply.is_none());
        assert!(handler.session(&rid).is_none());
    }

    #[test]
    fn echo_round_trip() {
        let mut table = DispatchTable::new();
        table.register(MessageType::Request, Arc::new(|_session, msg| {
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
        }));
        let mut handler = SessionHandler::new(PeerRole::Service, table);
        let rid = RoutingId::Remote(Bytes::from_static(b"client-1"));
        let (header, frames) = hello().to_wire();
        handler.receive(rid.clone(), &header, &frames);

        let request = FbspMessage::Request {
            token: 1,
            interface_number: 1,
            api_code: 1,
            flags: FbspFlags::empty(),
            frames: vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")],
        };
        let (header, frames) = request.to_wire();
        let reply = handler.receive(rid, &header, &frames).unwrap();
        match reply {
            FbspMessage::Reply { token, frames, .. } => {
                assert_eq!(token, 1);
                assert_eq!(frames, vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]);
            }
            _ => panic!("expected Reply"),
        }
    }

    #[test]
    fn handle_allocation_is_stable_and_bijective() {
        let mut session = Session::new(RoutingId::Internal, hello());
        session.note_request(&FbspMessage::Request {
            token: 1,
            interface_number: 1,
            api_code: 1,
            flags: FbspFlags::empty(),
            frames: vec![],
        });
        let h1 = session.get_handle(1).unwrap();
        let h1_again = session.get_handle(1).unwrap();
        assert_eq!(h1, h1_again);

        session.note_request(&FbspMessage::Request {
            token: 2,
            interface_number: 1,
            api_code: 1,
            flags: FbspFlags::empty(),
            frames: vec![],
        });
        let h2 = session.get_handle(2).unwrap();
        assert_ne!(h1, h2);

        session.request_done(1);
        assert!(session.token_for_handle(h1).is_none());
        assert_eq!(session.token_for_handle(h2), Some(2));
    }

    #[test]
    fn token_generator_is_strictly_monotonic_starting_at_one() {
        let gen = TokenGenerator::new();
        assert_eq!(gen.next_token(), 1);
        assert_eq!(gen.next_token(), 2);
        assert_eq!(gen.next_token(), 3);
    }

    #[test]
    fn close_discards_session() {
        let mut handler = SessionHandler::new(PeerRole::Service, DispatchTable::new());
        let rid = RoutingId::Remote(Bytes::from_static(b"client-1"));
        let (header, frames) = hello().to_wire();
        handler.receive(rid.clone(), &header, &frames);
        assert!(handler.session(&rid).is_some());

        let close = FbspMessage::Close { token: 0 };
        let (header, frames) = close.to_wire();
        handler.receive(rid.clone(), &header, &frames);
        assert!(handler.session(&rid).is_none());
    }
}
