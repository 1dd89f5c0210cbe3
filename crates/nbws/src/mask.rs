//! XOR masking for client-to-server payloads.

/// Unmasks (or masks) a payload in place with a 4-byte key.
///
/// Large buffers are processed eight bytes at a time with the key repeated
/// into a 64-bit word; the scalar tail covers the remainder. Chunking starts
/// at offset zero, so the key phase never needs rotating.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    if buf.len() < 32 {
        return apply_mask_scalar(buf, mask);
    }

    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap()) ^ mask_u64;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    // The remainder begins at a multiple of eight, so the phase is still zero.
    apply_mask_scalar(chunks.into_remainder(), mask);
}

#[inline(always)]
fn apply_mask_scalar(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}
