//! WebSocket frame masking utilities
//!
//! Mask keys come from the operating system CSPRNG via `getrandom`.

use std::io;

use crate::error::Result;

/// XOR `data` in place with the repeating 4-byte mask
///
/// The same call masks and unmasks.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(data, mask, 0);
}

/// Apply mask starting at `offset` bytes into the mask cycle
///
/// Used when a payload is masked in several pieces.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    if data.is_empty() {
        return;
    }

    let rotated = [
        mask[offset & 3],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];

    // 8 bytes at a time
    let mask_u64 = u64::from_ne_bytes([
        rotated[0], rotated[1], rotated[2], rotated[3], rotated[0], rotated[1], rotated[2],
        rotated[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i & 3];
    }
}

/// Generate a random mask for client frames
#[inline]
pub fn generate_mask() -> Result<[u8; 4]> {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf).map_err(io::Error::other)?;
    Ok(buf)
}

/// Fill `buf` with random bytes from the OS
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf).map_err(io::Error::other)?;
    Ok(())
}
