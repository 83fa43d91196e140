//! Connection token generation

use rand::RngCore;
use std::fmt::Write;

/// Length of a generated token in characters (32 random bytes, hex encoded)
pub const CONNECTION_TOKEN_LEN: usize = 64;

/// Generate a fresh connection token
///
/// Tokens are generated once per tunnel and never rotated by the relay.
pub fn generate_connection_token() -> String {
    let mut bytes = [0u8; CONNECTION_TOKEN_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);

    let mut token = String::with_capacity(CONNECTION_TOKEN_LEN);
    for byte in bytes {
        // Writing into a String cannot fail
        let _ = write!(token, "{:02x}", byte);
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        let token = generate_connection_token();
        assert_eq!(token.len(), CONNECTION_TOKEN_LEN);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_tokens_differ() {
        assert_ne!(generate_connection_token(), generate_connection_token());
    }
}
