//! Framing of receiver output
//!
//! Frames end with `\n` and a trailing `\r` is stripped. Bytes that are not
//! valid UTF-8 are replaced instead of rejected, and a line longer than the
//! limit is dropped up to its terminator. Neither ends the stream; only an
//! I/O error does.

use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// Longest frame accepted, terminator excluded
pub(crate) const MAX_FRAME_LENGTH: usize = 4096;

#[derive(Debug)]
pub(crate) struct FrameCodec {
    max_length: usize,
    /// Where the next search for a terminator starts
    next_index: usize,
    /// Skipping the remainder of an overlong line
    discarding: bool,
}

impl FrameCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LENGTH)
    }
}

fn to_frame(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let terminator = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match terminator {
                Some(end) if self.discarding => {
                    buf.advance(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                Some(end) => {
                    let line = buf.split_to(end + 1);
                    self.next_index = 0;
                    if end > self.max_length {
                        tracing::warn!("Dropping frame of {} bytes", end);
                        continue;
                    }
                    return Ok(Some(to_frame(&line[..end])));
                }
                None if self.discarding => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                None if buf.len() > self.max_length => {
                    tracing::warn!("Dropping frame longer than {} bytes", self.max_length);
                    buf.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(None);
                }
                None => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        let rest = buf.split();
        self.next_index = 0;
        if std::mem::take(&mut self.discarding) || rest.is_empty() {
            return Ok(None);
        }
        Ok(Some(to_frame(&rest)))
    }
}
