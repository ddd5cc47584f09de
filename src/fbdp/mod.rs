//! FBDP: the Firebird Butler Data Pipe Protocol — OPEN/READY/DATA/CLOSE
//! message model and the producer/consumer pipe engine with batch-voucher
//! flow control.

pub mod message;
pub mod pipe;
