//! Short URL-safe identifier generation.
//!
//! Message ids and lock tokens are random strings over a 64-symbol
//! URL-safe alphabet. At 10 characters a message id carries 60 bits of
//! entropy, which makes collisions negligible at single-database scale;
//! lock tokens get two extra characters because they are regenerated on
//! every claim and must never repeat across claims of the same row.

use rand::Rng;

const ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Length of generated message ids.
pub const MESSAGE_ID_LEN: usize = 10;
/// Length of generated lock (fencing) tokens.
pub const LOCK_TOKEN_LEN: usize = 12;

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Generate a new message id.
pub fn message_id() -> String {
    random_string(MESSAGE_ID_LEN)
}

/// Generate a new lock token. Called on every claim.
pub fn lock_token() -> String {
    random_string(LOCK_TOKEN_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_message_id_length_and_alphabet() {
        let id = message_id();
        assert_eq!(id.len(), MESSAGE_ID_LEN);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn test_lock_token_length() {
        assert_eq!(lock_token().len(), LOCK_TOKEN_LEN);
    }

    #[test]
    fn test_ids_are_url_safe() {
        for _ in 0..100 {
            let id = message_id();
            assert!(id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        }
    }

    #[test]
    fn test_no_collisions_in_small_sample() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(lock_token()), "duplicate lock token generated");
        }
    }
}
