//! Secure identifier generation.
//!
//! Room, file, and peer identifiers are 16 bytes from the OS CSPRNG,
//! rendered as lowercase hex. There is no weaker fallback path: if the
//! OS RNG is unavailable the process fails instead of degrading.

use rand::rngs::OsRng;
use rand::RngCore;

/// Number of random bytes behind every identifier.
const ID_BYTES: usize = 16;

/// Generate a fresh 32-character lowercase hex identifier.
pub fn secure_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Validate a room identifier: 1..=64 chars from `[A-Za-z0-9_-]`.
///
/// The canonical issuance is [`secure_id`], but any matching string is
/// accepted so hand-typed or externally minted room names keep working.
pub fn is_valid_room_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_id_shape() {
        let id = secure_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(is_valid_room_id(&id));
    }

    #[test]
    fn test_secure_ids_are_unique() {
        let a = secure_id();
        let b = secure_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_room_id_validation() {
        assert!(is_valid_room_id("a"));
        assert!(is_valid_room_id("room_42-A"));
        assert!(is_valid_room_id(&"x".repeat(64)));
        assert!(!is_valid_room_id(""));
        assert!(!is_valid_room_id(&"x".repeat(65)));
        assert!(!is_valid_room_id("has space"));
        assert!(!is_valid_room_id("sneaky/../path"));
        assert!(!is_valid_room_id("émoji"));
    }
}
