//! FBDP message model: OPEN/READY/DATA/CLOSE frames carried over the 8-byte
//! data-pipe control header.

use bytes::Bytes;

use crate::control::FbdpHeader;
use crate::descriptor::{self, OpenPayload, PipeStream, Uid};
use crate::error::{InvalidMessage, PipeCloseCode};

/// The four FBDP control frame kinds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FbdpMessageType {
    Open = 1,
    Close = 2,
    Ready = 3,
    Data = 4,
}

impl FbdpMessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => FbdpMessageType::Open,
            2 => FbdpMessageType::Close,
            3 => FbdpMessageType::Ready,
            4 => FbdpMessageType::Data,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            FbdpMessageType::Open => "OPEN",
            FbdpMessageType::Close => "CLOSE",
            FbdpMessageType::Ready => "READY",
            FbdpMessageType::Data => "DATA",
        }
    }
}

/// A parsed FBDP control message.
#[derive(Debug, Clone, PartialEq)]
pub enum FbdpMessage {
    Open {
        data_pipe_id: Uid,
        pipe_stream: PipeStream,
        data_format: String,
    },
    /// Grants the peer `batches` more DATA sends before it must wait for
    /// another READY (the batch-voucher flow-control unit).
    Ready {
        batches: u16,
    },
    /// One chunk of pipe data. `seq` is carried in `type_data` purely for
    /// diagnostics/log correlation; ordering is guaranteed by the transport,
    /// not by this field. A DATA with `seq == 0` carries no payload frame at
    /// all; the second wire frame only appears when `seq` is nonzero.
    Data {
        seq: u16,
        payload: Option<Bytes>,
    },
    Close {
        code: PipeCloseCode,
        message: Option<String>,
    },
}

impl FbdpMessage {
    pub fn message_type(&self) -> FbdpMessageType {
        match self {
            FbdpMessage::Open { .. } => FbdpMessageType::Open,
            FbdpMessage::Ready { .. } => FbdpMessageType::Ready,
            FbdpMessage::Data { .. } => FbdpMessageType::Data,
            FbdpMessage::Close { .. } => FbdpMessageType::Close,
        }
    }

    pub fn to_wire(&self) -> (FbdpHeader, Vec<Bytes>) {
        match self {
            FbdpMessage::Open {
                data_pipe_id,
                pipe_stream,
                data_format,
            } => {
                let header = FbdpHeader::new(FbdpMessageType::Open as u8, 0);
                let payload = OpenPayload {
                    data_pipe_id: data_pipe_id.clone(),
                    pipe_stream: *pipe_stream,
                    data_format: data_format.clone(),
                };
                (header, vec![Bytes::from(descriptor::encode(&payload))])
            }
            FbdpMessage::Ready { batches } => {
                let header = FbdpHeader::new(FbdpMessageType::Ready as u8, *batches);
                (header, Vec::new())
            }
            FbdpMessage::Data { seq, payload } => {
                let header = FbdpHeader::new(FbdpMessageType::Data as u8, *seq);
                let frames = match payload {
                    Some(p) => vec![p.clone()],
                    None => Vec::new(),
                };
                (header, frames)
            }
            FbdpMessage::Close { code, message } => {
                let header = FbdpHeader::new(FbdpMessageType::Close as u8, code.as_u16());
                let frames = match message {
                    Some(m) => vec![Bytes::from(m.clone().into_bytes())],
                    None => Vec::new(),
                };
                (header, frames)
            }
        }
    }

    pub fn from_wire(header: &FbdpHeader, frames: &[Bytes]) -> Result<Self, InvalidMessage> {
        let message_type = FbdpMessageType::from_u8(header.message_type)
            .ok_or(InvalidMessage::UnknownMessageType { found: header.message_type })?;

        Ok(match message_type {
            FbdpMessageType::Open => {
                expect_frames(frames, 1, "OPEN")?;
                let payload: OpenPayload = descriptor::decode(&frames[0])?;
                FbdpMessage::Open {
                    data_pipe_id: payload.data_pipe_id,
                    pipe_stream: payload.pipe_stream,
                    data_format: payload.data_format,
                }
            }
            FbdpMessageType::Ready => {
                expect_frames(frames, 0, "READY")?;
                FbdpMessage::Ready {
                    batches: header.type_data,
                }
            }
            FbdpMessageType::Data => {
                let payload = if header.type_data != 0 {
                    expect_frames(frames, 1, "DATA")?;
                    Some(frames[0].clone())
                } else {
                    expect_frames(frames, 0, "DATA")?;
                    None
                };
                FbdpMessage::Data {
                    seq: header.type_data,
                    payload,
                }
            }
            FbdpMessageType::Close => {
                if frames.len() > 1 {
                    return Err(InvalidMessage::WrongFrameCount {
                        found: frames.len(),
                        expected: "0 or 1",
                    });
                }
                let code = PipeCloseCode::from_u16(header.type_data).ok_or(
                    InvalidMessage::BadRelatesTo {
                        found: header.type_data as u8,
                    },
                )?;
                let message = frames
                    .first()
                    .map(|f| String::from_utf8_lossy(f).into_owned());
                FbdpMessage::Close { code, message }
            }
        })
    }
}

fn expect_frames(frames: &[Bytes], expected: usize, name: &'static str) -> Result<(), InvalidMessage> {
    if frames.len() != expected {
        return Err(InvalidMessage::WrongFrameCount {
            found: frames.len(),
            expected: match expected {
                0 => "0",
                1 => "1",
                _ => name,
            },
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trips() {
        let msg = FbdpMessage::Open {
            data_pipe_id: Uid::new("pipe-1"),
            pipe_stream: PipeStream::Output,
            data_format: "text/csv".into(),
        };
        let (header, frames) = msg.to_wire();
        assert_eq!(FbdpMessage::from_wire(&header, &frames).unwrap(), msg);
    }

    #[test]
    fn ready_carries_batch_count_in_type_data() {
        let msg = FbdpMessage::Ready { batches: 5 };
        let (header, frames) = msg.to_wire();
        assert_eq!(header.type_data, 5);
        assert_eq!(FbdpMessage::from_wire(&header, &frames).unwrap(), msg);
    }

    #[test]
    fn data_round_trips() {
        let msg = FbdpMessage::Data {
            seq: 3,
            payload: Some(Bytes::from_static(b"chunk")),
        };
        let (header, frames) = msg.to_wire();
        assert_eq!(FbdpMessage::from_wire(&header, &frames).unwrap(), msg);
    }

    #[test]
    fn zero_seq_data_carries_no_payload_frame() {
        let msg = FbdpMessage::Data { seq: 0, payload: None };
        let (header, frames) = msg.to_wire();
        assert!(frames.is_empty());
        assert_eq!(FbdpMessage::from_wire(&header, &frames).unwrap(), msg);
    }

    #[test]
    fn nonzero_seq_data_requires_payload_frame() {
        let header = FbdpHeader::new(FbdpMessageType::Data as u8, 1);
        assert!(matches!(
            FbdpMessage::from_wire(&header, &[]),
            Err(InvalidMessage::WrongFrameCount { .. })
        ));
    }

    #[test]
    fn close_with_reason_round_trips() {
        let msg = FbdpMessage::Close {
            code: PipeCloseCode::InvalidData,
            message: Some("bad row 3".into()),
        };
        let (header, frames) = msg.to_wire();
        assert_eq!(FbdpMessage::from_wire(&header, &frames).unwrap(), msg);
    }

    #[test]
    fn close_rejects_unknown_code() {
        let header = FbdpHeader::new(FbdpMessageType::Close as u8, 9999);
        assert!(matches!(
            FbdpMessage::from_wire(&header, &[]),
            Err(InvalidMessage::BadRelatesTo { .. })
        ));
    }
}
