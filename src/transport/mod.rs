//! Agent-to-collector report transport.

pub mod client;
pub mod codec;

pub use client::{ConnectionState, TransportClient, TransportError};
pub use codec::{decode_line, encode_batch, DecodedLine, ReportCodec};
