//! Padding of the encrypted region.
//!
//! Padding makes `sequence header + body + padding + signature` a whole
//! number of plaintext blocks. Every padding byte holds the padding count
//! (excluding the size bytes themselves). With `min_padding == 2` the count
//! may exceed 255: the low byte fills the padding and one extra byte holding
//! the high byte is appended.

use bytes::{BufMut, BytesMut};

use uasc_core::wire::SEQUENCE_HEADER_SIZE;

/// Total padding bytes, size bytes included, for a body of `body_len`.
pub fn padding_size(body_len: usize, signature_size: usize, plain_block: usize, min_padding: usize) -> usize {
    let encrypt_size = SEQUENCE_HEADER_SIZE + body_len + signature_size + min_padding;
    let remainder = encrypt_size % plain_block;
    let pad = if remainder == 0 { 0 } else { plain_block - remainder };
    pad + min_padding
}

/// Append `size` padding bytes.
pub fn write_padding(buf: &mut BytesMut, size: usize, min_padding: usize) {
    let count = size - min_padding;
    if min_padding == 2 {
        buf.put_bytes(count as u8, size - 1);
        buf.put_u8((count >> 8) as u8);
    } else {
        buf.put_bytes(count as u8, size);
    }
}

/// Check the padding that ends at `end` and return where it starts.
///
/// None if the padding bytes are inconsistent or run past `floor`.
pub fn strip_padding(data: &[u8], floor: usize, end: usize, min_padding: usize) -> Option<usize> {
    if end < floor + min_padding {
        return None;
    }
    let (count, low) = if min_padding == 2 {
        let low = data[end - 2];
        let high = data[end - 1];
        ((usize::from(high) << 8) | usize::from(low), low)
    } else {
        let low = data[end - 1];
        (usize::from(low), low)
    };
    let total = count + min_padding;
    let start = end.checked_sub(total)?;
    if start < floor {
        return None;
    }
    let fill_end = if min_padding == 2 { end - 1 } else { end };
    if data[start..fill_end].iter().all(|&b| b == low) {
        Some(start)
    } else {
        None
    }
}
