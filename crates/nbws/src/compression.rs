//! Streaming decompression for permessage-deflate payloads (RFC 7692).
//!
//! The engine advertises `server_no_context_takeover` and
//! `client_no_context_takeover`, so every message inflates against a fresh
//! dictionary. Decompression is raw DEFLATE: the sender strips the trailing
//! `00 00 FF FF` emitted by its sync flush, and the receiver appends it back
//! before declaring the message complete (RFC 7692 §7.2.2).

use std::io;

use bytes::BytesMut;
use flate2::{Decompress, FlushDecompress, Status};

use crate::pool::Allocator;

/// Tail appended to a complete compressed message before inflation.
pub(crate) const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Output growth is clamped so one hostile message cannot double a huge
/// buffer in a single step.
const MAX_APPEND: usize = 4 * 1024 * 1024;

/// Inflater for messages compressed with permessage-deflate.
///
/// One instance lives per connection. In no-context-takeover mode the
/// dictionary is reset after every message, which is the only mode the
/// engine negotiates; the contextual mode is available for callers driving
/// the inflater directly.
pub struct Decompressor {
    inflate: Decompress,
    reset_after_message: bool,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor {
    /// Creates an inflater that keeps its dictionary across messages.
    pub fn new() -> Self {
        Self {
            inflate: Decompress::new(false),
            reset_after_message: false,
        }
    }

    /// Creates an inflater that resets its dictionary after every message.
    pub fn no_context_takeover() -> Self {
        Self {
            inflate: Decompress::new(false),
            reset_after_message: true,
        }
    }

    /// Inflates one complete message payload.
    ///
    /// Appends the RFC 7692 §7.2.2 tail and drives the inflater until it
    /// stops producing output. The result buffer comes from `alloc`; on
    /// error the partial output is returned to the pool.
    pub fn decompress_message(
        &mut self,
        input: &[u8],
        alloc: &dyn Allocator,
    ) -> io::Result<BytesMut> {
        let mut out = alloc.malloc((input.len() * 2).max(256));

        let res = self
            .write(input, &mut out)
            .and_then(|()| self.write(&DEFLATE_TAIL, &mut out))
            .and_then(|()| self.drain(&mut out));

        if self.reset_after_message {
            self.inflate.reset(false);
        }

        match res {
            Ok(()) => Ok(out),
            Err(err) => {
                alloc.free(out);
                Err(err)
            }
        }
    }

    /// Feeds `input` through the inflater, growing `out` as needed.
    fn write(&mut self, mut input: &[u8], out: &mut BytesMut) -> io::Result<()> {
        while !input.is_empty() {
            if out.len() == out.capacity() {
                grow(out);
            }

            let (consumed, produced, status) = self.step(input, out, FlushDecompress::None)?;
            input = &input[consumed..];

            if consumed == 0 && produced == 0 {
                match status {
                    // Needs more output room before it makes progress.
                    Status::BufError | Status::Ok => grow(out),
                    Status::StreamEnd => break,
                }
            }
        }
        Ok(())
    }

    /// Pulls out whatever the inflater still holds after the tail.
    fn drain(&mut self, out: &mut BytesMut) -> io::Result<()> {
        loop {
            if out.len() == out.capacity() {
                grow(out);
            }
            let (_, produced, status) = self.step(&[], out, FlushDecompress::Sync)?;
            if produced == 0 || status == Status::StreamEnd {
                return Ok(());
            }
        }
    }

    /// One `flate2` call writing into the spare capacity of `out`.
    fn step(
        &mut self,
        input: &[u8],
        out: &mut BytesMut,
        flush: FlushDecompress,
    ) -> io::Result<(usize, usize, Status)> {
        let start = out.len();
        let capacity = out.capacity();
        out.resize(capacity, 0);

        let before_in = self.inflate.total_in();
        let before_out = self.inflate.total_out();
        let result = self.inflate.decompress(input, &mut out[start..], flush);

        let consumed = (self.inflate.total_in() - before_in) as usize;
        let produced = (self.inflate.total_out() - before_out) as usize;
        out.truncate(start + produced);

        match result {
            Ok(status) => Ok((consumed, produced, status)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "corrupt deflate stream",
            )),
        }
    }
}

fn grow(out: &mut BytesMut) {
    let step = out.capacity().clamp(256, MAX_APPEND);
    out.reserve(step);
}
