//! Minimal FBSP echo service: binds a ROUTER socket, replies to every
//! REQUEST with a REPLY carrying the same frames back.
//!
//! ```bash
//! fbsp-echo-demo --bind tcp://127.0.0.1:9999
//! ```

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fbsp::channel::{Channel, ChannelMode, SocketKind};
use fbsp::control::FbspFlags;
use fbsp::{DispatchTable, Endpoint, FbspMessage, MessageType, PeerRole, ServiceContainer, ServiceLogic, SessionHandler};

#[derive(Parser, Debug)]
#[command(name = "fbsp-echo-demo")]
#[command(about = "FBSP echo service reference peer")]
struct Args {
    /// Endpoint to bind the ROUTER socket on.
    #[arg(long, default_value = "tcp://127.0.0.1:9999")]
    bind: String,
}

struct EchoLogic;

impl ServiceLogic for EchoLogic {
    fn configure(&mut self) {
        tracing::debug!("echo service configured, no-op");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let endpoint = match Endpoint::parse(&args.bind) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("invalid --bind endpoint: {e}");
            std::process::exit(2);
        }
    };

    let channel = match Channel::open(SocketKind::Router, ChannelMode::Bind, endpoint.clone()).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to bind {endpoint}: {e}");
            std::process::exit(1);
        }
    };

    let mut dispatch = DispatchTable::new();
    dispatch.register(MessageType::Request, Arc::new(|_session, msg| {
        if let FbspMessage::Request {
            token,
            interface_number,
            api_code,
            frames,
            ..
        } = msg
        {
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

    let handler = SessionHandler::new(PeerRole::Service, dispatch);
    let container = ServiceContainer::new(channel, handler);

    tracing::info!(endpoint = %endpoint, "echo service listening");
    if let Err(e) = fbsp::service::run_service(container, EchoLogic).await {
        eprintln!("service error: {e}");
        std::process::exit(1);
    }
}
