//! Generation of our client's [`PeerId`](crate::PeerId).
//!
//! Follows the Azureus-style convention recommended by BEP 20: an 8-byte
//! ASCII prefix of the form `-XXYYYY-` (`XX` a two-letter client
//! abbreviation, `YYYY` a four-digit version), followed by 12 arbitrary
//! bytes. We fill the latter with randomness, which is the most common
//! choice among public clients.

use rand::Rng;

use crate::PeerId;

/// The prefix used by this crate when no other is supplied.
pub const DEFAULT_PREFIX: &[u8; 8] = b"-cT0001-";

/// Generates a new peer id with the given 8-byte Azureus-style prefix.
///
/// # Panics
///
/// Panics if `prefix` is not exactly 8 bytes long.
pub fn generate(prefix: &[u8]) -> PeerId {
    assert_eq!(prefix.len(), 8, "peer id prefix must be 8 bytes");
    let mut id = [0; 20];
    id[..8].copy_from_slice(prefix);
    rand::thread_rng().fill(&mut id[8..]);
    id
}

/// Generates a new peer id using this crate's [`DEFAULT_PREFIX`].
pub fn generate_default() -> PeerId {
    generate(DEFAULT_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_has_the_right_shape() {
        let id = generate_default();
        assert_eq!(&id[..8], DEFAULT_PREFIX);
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn two_generated_ids_differ_in_their_random_suffix() {
        let a = generate_default();
        let b = generate_default();
        assert_ne!(a[8..], b[8..]);
    }

    #[test]
    #[should_panic(expected = "8 bytes")]
    fn rejects_a_prefix_of_the_wrong_length() {
        generate(b"too-short");
    }
}
