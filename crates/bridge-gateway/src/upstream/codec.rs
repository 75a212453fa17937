//! Line codec for the upstream TCP stream
//!
//! Inbound bytes accumulate in the read buffer until a `\n` or `\r` arrives;
//! everything before it becomes one message with the terminator stripped.
//! Outbound payloads are written verbatim.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Longest partial line held in the buffer before the stream is rejected
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Codec splitting the upstream byte stream into text lines
#[derive(Debug, Clone)]
pub struct LineCodec {
    /// Index already scanned for a terminator
    next_index: usize,
    max_length: usize,
    append_newline: bool,
}

impl LineCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_index: 0,
            max_length: DEFAULT_MAX_LINE_LENGTH,
            append_newline: false,
        }
    }

    /// Terminate every encoded payload with `\n`
    #[must_use]
    pub fn with_newline(mut self, append: bool) -> Self {
        self.append_newline = append;
        self
    }

    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    fn is_terminator(byte: u8) -> bool {
        byte == b'\n' || byte == b'\r'
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.next_index..]
                .iter()
                .position(|b| Self::is_terminator(*b))
            else {
                if src.len() > self.max_length {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("line exceeds {} bytes", self.max_length),
                    ));
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let end = self.next_index + offset;
            let line = src.split_to(end + 1);
            self.next_index = 0;

            // "\r\n" and blank lines leave nothing to deliver
            if line.len() == 1 {
                continue;
            }

            return Ok(Some(String::from_utf8_lossy(&line[..end]).into_owned()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }

        // Unterminated tail before EOF is still a message
        let rest = src.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let terminate = self.append_newline && !item.ends_with(b"\n");

        dst.reserve(item.len() + usize::from(terminate));
        dst.put_slice(&item);
        if terminate {
            dst.put_u8(b'\n');
        }

        Ok(())
    }
}
