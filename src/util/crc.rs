//! CRC32 checksum utilities.

use crc32fast::Hasher;

/// Mask delta applied to stored CRC values.
const MASK_DELTA: u32 = 0xa282_ead8;

/// Compute CRC32 checksum of the given data.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Extend an existing CRC32 with more data.
pub fn crc32_extend(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

/// Mask a CRC value for storage.
///
/// Rotates right by 15 bits and adds a constant, so that stored CRCs of
/// data that itself contains embedded CRCs do not collide with common
/// patterns.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Unmask a masked CRC value.
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// Verify that data matches an expected masked CRC.
pub fn verify_masked_crc(data: &[u8], masked: u32) -> bool {
    crc32(data) == unmask_crc(masked)
}
