//! Newline-delimited JSON framing for report streams.
//!
//! Each line carries either a JSON array of reports or a single report
//! object. The decoder never fails a stream on bad content: malformed and
//! over-long lines are surfaced as [`DecodedLine::Invalid`] so the reader can
//! log and move on.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::report::Report;

/// Default longest line accepted by the decoder (excluding the newline).
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Stream-level codec error. Only I/O and encoding failures end a stream.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding reports: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Why a single line was rejected.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },
}

/// Outcome of decoding one line.
#[derive(Debug)]
pub enum DecodedLine {
    Reports(Vec<Report>),
    Invalid(DecodeError),
}

/// Serialize a batch as one JSON array followed by `\n`.
pub fn encode_batch(reports: &[Report]) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(reports.len() * 160 + 1);
    serde_json::to_writer(&mut buf, reports).map_err(CodecError::Encode)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one line (without its newline): an array first, then a single
/// object wrapped into a one-element batch.
pub fn decode_line(line: &[u8]) -> DecodedLine {
    match serde_json::from_slice::<Vec<Report>>(line) {
        Ok(reports) => DecodedLine::Reports(reports),
        Err(array_err) => match serde_json::from_slice::<Report>(line) {
            Ok(report) => DecodedLine::Reports(vec![report]),
            Err(_) => DecodedLine::Invalid(DecodeError::Json(array_err)),
        },
    }
}

/// Codec for report streams, usable with `FramedRead` and `FramedWrite`.
#[derive(Debug, Clone)]
pub struct ReportCodec {
    max_line_bytes: usize,
    // Bytes already scanned for a newline.
    next_index: usize,
    // Skipping the remainder of an over-long line.
    discarding: bool,
}

impl ReportCodec {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for ReportCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ReportCodec {
    type Item = DecodedLine;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<DecodedLine>, CodecError> {
        loop {
            let read_to = self.max_line_bytes.saturating_add(1).min(buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    return Ok(Some(decode_line(&line[..end])));
                }
                (false, None) if buf.len() > self.max_line_bytes => {
                    self.discarding = true;
                    return Ok(Some(DecodedLine::Invalid(DecodeError::LineTooLong {
                        max: self.max_line_bytes,
                    })));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<DecodedLine>, CodecError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }

        // A final line without its newline still counts.
        if buf.is_empty() || self.discarding {
            buf.clear();
            return Ok(None);
        }

        let line = buf.split_to(buf.len());
        self.next_index = 0;
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(decode_line(&line)))
    }
}

impl<'a> Encoder<&'a [Report]> for ReportCodec {
    type Error = CodecError;

    fn encode(&mut self, reports: &'a [Report], dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut writer = dst.writer();
        serde_json::to_writer(&mut writer, reports).map_err(CodecError::Encode)?;
        writer.into_inner().put_u8(b'\n');
        Ok(())
    }
}
