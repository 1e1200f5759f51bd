//! Conversation id minting and recognition.

use std::sync::OnceLock;

use rand::RngCore;
use regex::Regex;
use sha1::{Digest, Sha1};

/// Length of the short id form used in listings and save feedback.
pub const SHA1_SHORT: usize = 7;

/// Minimum input length for id-prefix lookup; anything shorter is treated
/// as an exact title.
pub const SHA1_MIN_LEN: usize = 4;

const SHA1_READ_BLOCK_SIZE: usize = 4096;

/// Mints a fresh conversation id: the SHA-1 of one block of cryptographic
/// randomness, hex encoded.
pub fn new_conversation_id() -> String {
    let mut block = [0u8; SHA1_READ_BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut block);
    hex::encode(Sha1::digest(block))
}

/// Whether `s` contains a full 40-hex conversation id.
pub fn looks_like_sha1(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[0-9a-f]{40}\b").expect("sha1 regex"))
        .is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_forty_hex_chars() {
        let id = new_conversation_id();
        assert_eq!(id.len(), 40);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(looks_like_sha1(&id));
    }

    #[test]
    fn ids_are_distinct() {
        assert_ne!(new_conversation_id(), new_conversation_id());
    }

    #[test]
    fn short_form_is_unambiguous_prefix() {
        let id = new_conversation_id();
        assert!(id.starts_with(&id[..SHA1_SHORT]));
        assert!(SHA1_MIN_LEN < SHA1_SHORT);
    }

    #[test]
    fn titles_are_not_mistaken_for_ids() {
        assert!(!looks_like_sha1("my conversation title"));
        assert!(!looks_like_sha1("df31ae23"));
    }
}
