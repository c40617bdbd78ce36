//! Credential generation.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Default length of generated database passwords.
pub const DEFAULT_PASSWORD_LEN: usize = 24;

/// Generate a random alphanumeric password. Alphanumeric keeps the value
/// safe to embed in connection URLs and env files without escaping.
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_length() {
        assert_eq!(generate_password(DEFAULT_PASSWORD_LEN).len(), DEFAULT_PASSWORD_LEN);
        assert_eq!(generate_password(8).len(), 8);
    }

    #[test]
    fn output_is_alphanumeric() {
        let password = generate_password(64);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn successive_passwords_differ() {
        assert_ne!(generate_password(24), generate_password(24));
    }
}
