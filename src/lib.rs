//! Firebird Butler Service Protocol (FBSP) and Data Pipe Protocol (FBDP)
//! core: wire codecs, session/handshake state machines, the deferred send
//! path, and the service container event loop.

pub mod channel;
pub mod client;
pub mod control;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod fbdp;
pub mod fbsp;
pub mod service;

pub use channel::{Channel, ChannelManager, ChannelMode, DeferredTask, SocketKind};
pub use endpoint::{Domain, Endpoint, Protocol};
pub use error::{ChannelError, ClientError, ErrorCode, InvalidMessage, PipeCloseCode, ServiceError, StopError};
pub use fbsp::message::{FbspMessage, MessageType};
pub use fbsp::session::{DispatchTable, RoutingId, Session, SessionHandler};
pub use fbsp::validator::PeerRole;
pub use service::{ServiceContainer, ServiceLogic, StopEvent};
