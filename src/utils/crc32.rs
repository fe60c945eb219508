//! CRC32 chunk integrity codec.
//!
//! Every binary chunk frame leads with the IEEE CRC32 of its payload
//! (reflected polynomial 0xEDB88320, seed and final XOR 0xFFFFFFFF).
//! The hex form is what integrity errors show to the user: exactly
//! eight lowercase hex digits, zero-padded.

/// Compute the IEEE CRC32 of a byte slice.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Render a CRC32 value as eight lowercase hex digits.
#[inline]
pub fn crc32_to_hex(crc: u32) -> String {
    format!("{crc:08x}")
}

/// Parse the eight-digit hex form back into a CRC32 value.
///
/// Returns `None` for anything that is not exactly eight hex digits,
/// so a truncated or garbled value is never silently accepted.
pub fn hex_to_crc32(hex: &str) -> Option<u32> {
    if hex.len() != 8 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}
