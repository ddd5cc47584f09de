//! FBDP pipe engine: the producer/consumer state machine, batch-voucher
//! flow control, and backpressure-via-deferral for one open data pipe.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::descriptor::{PipeStream, Uid};
use crate::error::{PipeCloseCode, StopError};
use crate::fbdp::message::FbdpMessage;

/// Loose MIME media-type syntax check: `type/subtype` optionally followed by
/// `;params`, both sides non-empty. Good enough to reject garbage without
/// pulling in a full MIME-parsing dependency for a single accept/reject
/// decision.
fn looks_like_mime(data_format: &str) -> bool {
    let media_type = data_format.split(';').next().unwrap_or("");
    match media_type.split_once('/') {
        Some((type_, subtype)) => !type_.is_empty() && !subtype.is_empty(),
        None => false,
    }
}

/// Which end of the pipe this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    Producer,
    Consumer,
}

/// Pipe lifecycle. `Unknown` is the state before any OPEN has been sent or
/// received; `Ready`/`Transmitting` both follow at least one READY, the
/// distinction being whether the voucher balance is currently zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Unknown,
    Open,
    Ready,
    Transmitting,
    Closed,
}

/// Result of offering one chunk of data to a producer-role pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// A voucher was available; send this DATA message now.
    Send(FbdpMessage),
    /// No voucher available; the chunk was queued and will be replayed by
    /// [`Pipe::drain`] once a READY arrives.
    Deferred,
}

/// A single open data pipe, tracking voucher balance and the deferred
/// backlog for the side that's producing data.
pub struct Pipe {
    role: PipeRole,
    state: PipeState,
    pipe_id: Uid,
    pipe_stream: PipeStream,
    data_format: String,
    vouchers: u16,
    /// Next outgoing DATA sequence number. Starts at 1, not 0: a wire DATA
    /// with `seq == 0` carries no payload frame, so 0 is reserved and never
    /// assigned to a real chunk.
    next_seq: u16,
    backlog: VecDeque<Bytes>,
    close: Option<(PipeCloseCode, Option<String>)>,
}

impl Pipe {
    pub fn new(role: PipeRole, pipe_id: Uid, pipe_stream: PipeStream, data_format: String) -> Self {
        Pipe {
            role,
            state: PipeState::Unknown,
            pipe_id,
            pipe_stream,
            data_format,
            vouchers: 0,
            next_seq: 1,
            backlog: VecDeque::new(),
            close: None,
        }
    }

    pub fn role(&self) -> PipeRole {
        self.role
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn pipe_id(&self) -> &Uid {
        &self.pipe_id
    }

    /// Producer side: build the OPEN message and move to `Open`.
    pub fn open(&mut self) -> FbdpMessage {
        self.state = PipeState::Open;
        FbdpMessage::Open {
            data_pipe_id: self.pipe_id.clone(),
            pipe_stream: self.pipe_stream,
            data_format: self.data_format.clone(),
        }
    }

    /// Consumer side: validate and accept an incoming OPEN. Checks the
    /// requested pipe id, stream direction, and data-format syntax against
    /// this pipe's own configuration before moving to `Open`, closing with
    /// the matching code on a mismatch instead of blindly accepting.
    pub fn accept_open(
        &mut self,
        data_pipe_id: &Uid,
        pipe_stream: PipeStream,
        data_format: String,
    ) -> Result<(), PipeCloseCode> {
        if data_pipe_id != &self.pipe_id {
            return Err(PipeCloseCode::PipeEndpointUnavailable);
        }
        if pipe_stream != self.pipe_stream {
            return Err(PipeCloseCode::PipeEndpointUnavailable);
        }
        if !looks_like_mime(&data_format) {
            return Err(PipeCloseCode::DataFormatNotSupported);
        }
        self.data_format = data_format;
        self.state = PipeState::Open;
        Ok(())
    }

    /// Consumer side: grant `batches` more sends and build the READY.
    pub fn grant(&mut self, batches: u16) -> FbdpMessage {
        FbdpMessage::Ready { batches }
    }

    /// Producer side: record vouchers from an incoming READY.
    pub fn on_ready_received(&mut self, batches: u16) {
        self.vouchers = self.vouchers.saturating_add(batches);
        self.state = if self.vouchers > 0 {
            PipeState::Transmitting
        } else {
            PipeState::Ready
        };
    }

    /// Producer side: offer one chunk. Spends a voucher immediately if one
    /// is available; otherwise queues the chunk for [`Pipe::drain`].
    pub fn send_data(&mut self, payload: Bytes) -> SendOutcome {
        if self.vouchers > 0 {
            self.vouchers -= 1;
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            if self.vouchers == 0 {
                self.state = PipeState::Ready;
            }
            SendOutcome::Send(FbdpMessage::Data { seq, payload: Some(payload) })
        } else {
            self.backlog.push_back(payload);
            SendOutcome::Deferred
        }
    }

    /// Replay as much of the backlog as the current voucher balance allows,
    /// producing the DATA messages to send. Call after `on_ready_received`.
    pub fn drain(&mut self) -> Vec<FbdpMessage> {
        let mut out = Vec::new();
        while self.vouchers > 0 {
            let Some(payload) = self.backlog.pop_front() else { break };
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            self.vouchers -= 1;
            out.push(FbdpMessage::Data { seq, payload: Some(payload) });
        }
        if self.vouchers == 0 && !out.is_empty() {
            self.state = PipeState::Ready;
        }
        out
    }

    /// Consumer side: accept an incoming DATA chunk's payload. A DATA with
    /// no payload frame (`seq == 0`) still advances pipe state but yields no
    /// bytes.
    pub fn on_data_received(&mut self, msg: FbdpMessage) -> Option<Bytes> {
        match msg {
            FbdpMessage::Data { payload, .. } => {
                self.state = PipeState::Transmitting;
                payload
            }
            _ => None,
        }
    }

    /// Close the pipe locally, building the CLOSE message to send.
    pub fn close(&mut self, code: PipeCloseCode, message: Option<String>) -> FbdpMessage {
        self.state = PipeState::Closed;
        self.close = Some((code, message.clone()));
        FbdpMessage::Close { code, message }
    }

    /// A clean upstream stop (the producer's data source ran out) closes
    /// with `OK` rather than `INVALID_DATA`.
    pub fn close_on_stop(&mut self, _stop: StopError) -> FbdpMessage {
        self.close(PipeCloseCode::Ok, None)
    }

    pub fn on_close_received(&mut self, code: PipeCloseCode, message: Option<String>) {
        self.state = PipeState::Closed;
        self.close = Some((code, message));
    }

    pub fn close_reason(&self) -> Option<&(PipeCloseCode, Option<String>)> {
        self.close.as_ref()
    }
}
