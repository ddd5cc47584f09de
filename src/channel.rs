//! Channel & channel manager: typed wrappers over `zeromq` sockets.
//!
//! A [`Channel`] owns exactly one socket of a fixed [`SocketKind`], bound or
//! connected to one or more [`Endpoint`]s, and exposes a non-blocking
//! [`FrameSink`] for the FBSP/FBDP send path (`fbsp::send`) to drive. The
//! actual zeromq I/O happens on a background task; `try_send` only pushes
//! onto a bounded channel, so backpressure shows up as `WouldBlock` exactly
//! like a non-blocking `zmq_send` would.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zeromq::prelude::*;
use zeromq::ZmqMessage;

use crate::endpoint::Endpoint;
use crate::error::ChannelError;
use crate::fbsp::send::{FrameSink, SendOutcome};
use crate::fbsp::session::RoutingId;

/// Which zeromq socket pattern a [`Channel`] wraps. Mirrors the protocol
/// families enumerated in the endpoint/domain spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Dealer,
    Router,
    Pair,
    Pub,
    Sub,
    Push,
    Pull,
    XPub,
    XSub,
}

impl SocketKind {
    /// Sockets that demultiplex by a leading routing-id frame.
    fn is_routed(self) -> bool {
        matches!(self, SocketKind::Router)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Bind,
    Connect,
}

/// One inbound multipart message, with its routing id for ROUTER sockets.
#[derive(Debug)]
pub struct Inbound {
    pub routing_id: RoutingId,
    pub frames: Vec<Bytes>,
}

struct Outbound {
    routing_id: Option<RoutingId>,
    frames: Vec<Bytes>,
}

/// Default bound on the outbound queue. Once full, `try_send` reports
/// `WouldBlock` the same way a hit against zmq's own `SNDHWM` would.
const DEFAULT_SEND_QUEUE: usize = 1024;

/// Pack frames (with an optional routing-id prefix) into a `ZmqMessage`.
fn to_zmq_message(routing_id: Option<&RoutingId>, frames: &[Bytes]) -> ZmqMessage {
    let mut all = Vec::with_capacity(frames.len() + 1);
    if let Some(RoutingId::Remote(id)) = routing_id {
        all.push(id.clone());
    }
    all.extend_from_slice(frames);
    let mut iter = all.into_iter();
    let mut msg = ZmqMessage::from(iter.next().unwrap_or_default());
    for frame in iter {
        msg.push_back(frame);
    }
    msg
}

fn from_zmq_message(kind: SocketKind, msg: ZmqMessage) -> Inbound {
    let mut frames: Vec<Bytes> = msg.into_vec().into_iter().collect();
    if kind.is_routed() && !frames.is_empty() {
        let id = frames.remove(0);
        Inbound {
            routing_id: RoutingId::Remote(id),
            frames,
        }
    } else {
        Inbound {
            routing_id: RoutingId::Internal,
            frames,
        }
    }
}

async fn run_socket<S>(
    mut socket: S,
    kind: SocketKind,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    inbound_tx: mpsc::Sender<Inbound>,
) where
    S: SocketSend + SocketRecv + Unpin,
{
    loop {
        tokio::select! {
            out = outbound_rx.recv() => {
                match out {
                    Some(Outbound { routing_id, frames }) => {
                        let msg = to_zmq_message(routing_id.as_ref(), &frames);
                        if let Err(e) = socket.send(msg).await {
                            warn!(error = %e, "zmq send failed, dropping frames");
                        }
                    }
                    None => {
                        debug!("outbound queue closed, channel task exiting");
                        break;
                    }
                }
            }
            recv = socket.recv() => {
                match recv {
                    Ok(msg) => {
                        let inbound = from_zmq_message(kind, msg);
                        if inbound_tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "zmq recv failed, channel task exiting");
                        break;
                    }
                }
            }
        }
    }
}

/// One FBSP/FBDP-facing channel: a single zeromq socket, its bound/connected
/// endpoints, and the background task pumping it.
pub struct Channel {
    kind: SocketKind,
    mode: ChannelMode,
    endpoints: Vec<Endpoint>,
    outbound_tx: mpsc::Sender<Outbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    task: JoinHandle<()>,
}

macro_rules! spawn_for_kind {
    ($kind:expr, $endpoint:expr, $mode:expr, $outbound_rx:expr, $inbound_tx:expr) => {{
        let kind = $kind;
        let endpoint = $endpoint;
        let mode = $mode;
        match kind {
            SocketKind::Dealer => bind_or_connect(zeromq::DealerSocket::new(), endpoint, mode)
                .await
                .map(|s| tokio::spawn(run_socket(s, kind, $outbound_rx, $inbound_tx))),
            SocketKind::Router => bind_or_connect(zeromq::RouterSocket::new(), endpoint, mode)
                .await
                .map(|s| tokio::spawn(run_socket(s, kind, $outbound_rx, $inbound_tx))),
            SocketKind::Pair => bind_or_connect(zeromq::PairSocket::new(), endpoint, mode)
                .await
                .map(|s| tokio::spawn(run_socket(s, kind, $outbound_rx, $inbound_tx))),
            SocketKind::Pub => bind_or_connect(zeromq::PubSocket::new(), endpoint, mode)
                .await
                .map(|s| tokio::spawn(run_socket(s, kind, $outbound_rx, $inbound_tx))),
            SocketKind::Sub => bind_or_connect(zeromq::SubSocket::new(), endpoint, mode)
                .await
                .map(|s| tokio::spawn(run_socket(s, kind, $outbound_rx, $inbound_tx))),
            SocketKind::Push => bind_or_connect(zeromq::PushSocket::new(), endpoint, mode)
                .await
                .map(|s| tokio::spawn(run_socket(s, kind, $outbound_rx, $inbound_tx))),
            SocketKind::Pull => bind_or_connect(zeromq::PullSocket::new(), endpoint, mode)
                .await
                .map(|s| tokio::spawn(run_socket(s, kind, $outbound_rx, $inbound_tx))),
            SocketKind::XPub => bind_or_connect(zeromq::XPubSocket::new(), endpoint, mode)
                .await
                .map(|s| tokio::spawn(run_socket(s, kind, $outbound_rx, $inbound_tx))),
            SocketKind::XSub => bind_or_connect(zeromq::XSubSocket::new(), endpoint, mode)
                .await
                .map(|s| tokio::spawn(run_socket(s, kind, $outbound_rx, $inbound_tx))),
        }
    }};
}

async fn bind_or_connect<S: Socket>(
    mut socket: S,
    endpoint: &Endpoint,
    mode: ChannelMode,
) -> Result<S, ChannelError> {
    match mode {
        ChannelMode::Bind => {
            socket.bind(endpoint.as_str()).await?;
        }
        ChannelMode::Connect => {
            socket.connect(endpoint.as_str()).await?;
        }
    }
    Ok(socket)
}

impl Channel {
    /// Open a channel of `kind`, either binding or connecting to `endpoint`.
    /// PAIR channels accept at most one endpoint; other kinds may be opened
    /// again against additional endpoints via [`Channel::add_endpoint`]
    /// (zeromq sockets natively support multiple connects/binds).
    pub async fn open(kind: SocketKind, mode: ChannelMode, endpoint: Endpoint) -> Result<Self, ChannelError> {
        let (outbound_tx, outbound_rx) = mpsc::channel(DEFAULT_SEND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(DEFAULT_SEND_QUEUE);
        let task = spawn_for_kind!(kind, &endpoint, mode, outbound_rx, inbound_tx)?;
        Ok(Channel {
            kind,
            mode,
            endpoints: vec![endpoint],
            outbound_tx,
            inbound_rx,
            task,
        })
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Additional endpoints a PAIR channel may not accept.
    pub fn note_endpoint(&mut self, endpoint: Endpoint) -> Result<(), ChannelError> {
        if self.kind == SocketKind::Pair && !self.endpoints.is_empty() {
            return Err(ChannelError::TooManyEndpointsForPair);
        }
        self.endpoints.push(endpoint);
        Ok(())
    }

    /// Receive the next inbound multipart message, if any is queued.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound_rx.recv().await
    }

    /// Non-blocking receive, used by the service container's poll loop.
    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.inbound_rx.try_recv().ok()
    }

    /// Disconnect a previously connected/bound endpoint. For a `Connect`
    /// channel whose last tracked endpoint is removed this tears the
    /// background task down entirely, closing the underlying socket; a
    /// `Bind` channel only drops the bookkeeping entry, since unbinding a
    /// listening ROUTER would also cut off every other session it serves.
    pub fn disconnect(&mut self, endpoint: &Endpoint) {
        self.endpoints.retain(|e| e != endpoint);
        if self.mode == ChannelMode::Connect && self.endpoints.is_empty() {
            debug!(?endpoint, "last endpoint for connect channel removed, aborting channel task");
            self.task.abort();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FrameSink for Channel {
    fn try_send(
        &mut self,
        routing_id: Option<&RoutingId>,
        header: &crate::control::FbspHeader,
        frames: &[Bytes],
    ) -> Result<SendOutcome, ChannelError> {
        let mut all = Vec::with_capacity(frames.len() + 1);
        all.push(Bytes::copy_from_slice(&header.pack()));
        all.extend_from_slice(frames);
        let outbound = Outbound {
            routing_id: routing_id.cloned(),
            frames: all,
        };
        match self.outbound_tx.try_send(outbound) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(SendOutcome::WouldBlock),
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(SendOutcome::HostUnreachable),
        }
    }
}

/// A deferred unit of work the service container's loop owes a channel or a
/// session: a FIFO of typed tasks rather than generic `FnOnce` closures, so
/// the queue stays plain data and strictly single-threaded (only the owning
/// container loop ever touches it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredTask {
    /// Retry a suspended session's queued FBSP sends on the named channel.
    RetrySend {
        channel_id: u32,
        routing_id: RoutingId,
    },
}

/// Owns every channel the service container has opened, keyed by the
/// small integer id handed out on register, plus the deferred-task FIFO
/// shared across them.
#[derive(Default)]
pub struct ChannelManager {
    channels: HashMap<u32, Channel>,
    next_id: u32,
    deferred: VecDeque<DeferredTask>,
}

impl ChannelManager {
    pub fn new() -> Self {
        ChannelManager::default()
    }

    pub fn register(&mut self, channel: Channel) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.channels.insert(id, channel);
        id
    }

    pub fn get(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Channel> {
        self.channels.remove(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.channels.keys().copied()
    }

    /// Queue a task for the next (or a later) drain. A no-op if an
    /// identical task is already queued, to avoid double-scheduling the
    /// same callback.
    pub fn defer(&mut self, task: DeferredTask) {
        if !self.is_deferred(&task) {
            self.deferred.push_back(task);
        }
    }

    pub fn is_deferred(&self, task: &DeferredTask) -> bool {
        self.deferred.contains(task)
    }

    /// Drain the deferred queue: one task per call by default, or every
    /// task currently queued when `process_all` is set. Tasks a caller
    /// re-defers while handling a drained batch are queued for the *next*
    /// call, never the current one.
    pub fn process_deferred(&mut self, process_all: bool) -> Vec<DeferredTask> {
        if process_all {
            self.deferred.drain(..).collect()
        } else {
            self.deferred.pop_front().into_iter().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_rejects_second_endpoint() {
        // Constructing a live socket needs a runtime; this only exercises
        // the bookkeeping guard, so build the struct fields directly isn't
        // possible (fields are private to the module) -- instead check the
        // guard logic through the public note_endpoint path using a
        // channel opened against a loopback inproc endpoint.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let endpoint = Endpoint::parse("inproc://pair-test").unwrap();
            let mut channel = Channel::open(SocketKind::Pair, ChannelMode::Bind, endpoint)
                .await
                .unwrap();
            let second = Endpoint::parse("inproc://pair-test-2").unwrap();
            assert!(matches!(
                channel.note_endpoint(second),
                Err(ChannelError::TooManyEndpointsForPair)
            ));
        });
    }
}
