//! Streaming frame parser.
//!
//! [`next_frame`] is a pure function of the buffer prefix: it either slices
//! one complete frame off the front (unmasking the payload in place) or
//! reports that more bytes are needed, leaving the buffer untouched. The
//! caller owns consumption accounting, which keeps the zero-copy read path
//! possible: the same parser runs over the transport's chunk and over the
//! connection's accumulation buffer.

use crate::{Error, Result, frame::FrameHeader, mask};

/// One complete frame sliced out of the front of a read buffer.
pub(crate) struct RawFrame<'a> {
    pub header: FrameHeader,
    /// Payload bytes, already unmasked in place.
    pub payload: &'a [u8],
    /// Total bytes the frame occupied, header included.
    pub consumed: usize,
}

/// Pulls the next frame from `buf`.
///
/// Returns `Ok(None)` when fewer than `header_size + payload_len` bytes are
/// present; the buffer is left unchanged in that case. Frame validation
/// beyond structural parsing (reserved bits, opcode legality, fragmentation
/// rules) is the caller's job.
pub(crate) fn next_frame(buf: &mut [u8]) -> Result<Option<RawFrame<'_>>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    let rsv1 = buf[0] & 0x40 != 0;
    let rsv2 = buf[0] & 0x20 != 0;
    let rsv3 = buf[0] & 0x10 != 0;
    let opcode = buf[0] & 0x0F;
    let masked = buf[1] & 0x80 != 0;
    let length7 = buf[1] & 0x7F;

    let (payload_len, mut header_size) = match length7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut be = [0u8; 8];
            be.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(be), 10)
        }
        n => (u64::from(n), 2),
    };

    if masked {
        header_size += 4;
    }
    if buf.len() < header_size {
        return Ok(None);
    }

    let payload_len = usize::try_from(payload_len).map_err(|_| Error::MessageTooLarge)?;
    let total = header_size
        .checked_add(payload_len)
        .ok_or(Error::MessageTooLarge)?;
    if buf.len() < total {
        return Ok(None);
    }

    let mut mask_key = [0u8; 4];
    if masked {
        mask_key.copy_from_slice(&buf[header_size - 4..header_size]);
    }

    let payload = &mut buf[header_size..total];
    if masked {
        mask::apply_mask(payload, mask_key);
    }

    Ok(Some(RawFrame {
        header: FrameHeader {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            masked,
            payload_len,
            mask_key,
            header_size,
        },
        payload,
        consumed: total,
    }))
}
