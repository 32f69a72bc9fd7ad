//! Payload masking (XOR with a 4-byte key)
//!
//! Masking and unmasking are the same operation. Runs in place, no
//! allocation, no panics on any input length.

/// XOR every byte of `buf` with `mask[i & 3]`
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ key;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Fresh random masking key for one client frame
#[inline]
pub fn next_mask() -> [u8; 4] {
    rand::random::<[u8; 4]>()
}
