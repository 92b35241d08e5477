//! mysql_native_password token verification.
//!
//! The stored hash is `SHA1(SHA1(password))`. The client sends
//! `SHA1(password) XOR SHA1(scramble + stored_hash)`; XOR-ing the token
//! with `SHA1(scramble + stored_hash)` recovers `SHA1(password)`, whose
//! hash must equal the stored value. The recovered stage-1 hash is kept:
//! it is exactly what backend authentication needs.

use sha1::{Digest, Sha1};

use crate::protocol::SCRAMBLE_LEN;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
const HASH_LEN: usize = 20;

/// Outcome of checking a client token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCheck {
    /// Token matched; carries the recovered `SHA1(password)` used to
    /// authenticate against backends (empty for empty passwords).
    Ok { sha1_password: Vec<u8> },
    WrongPassword,
    /// Token had the wrong size or the stored hash is not valid hex.
    Malformed,
}

/// Verify a native-password token against the stored hash (hex, without
/// the leading `*`).
pub fn check_token(stored_hash_hex: &str, scramble: &[u8], token: &[u8]) -> TokenCheck {
    if stored_hash_hex.is_empty() {
        // Accounts without a password expect an empty token.
        return if token.is_empty() {
            TokenCheck::Ok {
                sha1_password: Vec::new(),
            }
        } else {
            TokenCheck::WrongPassword
        };
    }

    if token.is_empty() {
        return TokenCheck::WrongPassword;
    }
    if token.len() != HASH_LEN || scramble.len() != SCRAMBLE_LEN {
        return TokenCheck::Malformed;
    }

    let Some(stored_hash) = decode_hex(stored_hash_hex) else {
        return TokenCheck::Malformed;
    };

    // SHA1(scramble + stored_hash)
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(&stored_hash);
    let mask = hasher.finalize();

    // token XOR mask = SHA1(password)
    let sha1_password: Vec<u8> = token.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();

    // SHA1(SHA1(password)) must equal the stored hash.
    let mut hasher = Sha1::new();
    hasher.update(&sha1_password);
    let check: Vec<u8> = hasher.finalize().to_vec();

    if check == stored_hash {
        TokenCheck::Ok { sha1_password }
    } else {
        TokenCheck::WrongPassword
    }
}

/// Token for a backend's scramble, derived from the recovered stage-1
/// hash: `sha1_password XOR SHA1(scramble + SHA1(sha1_password))`.
pub fn backend_token_from_sha1(sha1_password: &[u8], scramble: &[u8]) -> Vec<u8> {
    if sha1_password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(sha1_password);
    let stored = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stored);
    let mask = hasher.finalize();

    sha1_password
        .iter()
        .zip(mask.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Hex of `SHA1(SHA1(password))`, the value stored in mysql.user.
pub fn hash_password(password: &str) -> String {
    if password.is_empty() {
        return String::new();
    }
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let h1 = hasher.finalize();
    let mut hasher = Sha1::new();
    hasher.update(h1);
    let h2 = hasher.finalize();
    h2.iter().map(|b| format!("{b:02X}")).collect()
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() != HASH_LEN * 2 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::compute_auth_token;

    #[test]
    fn valid_token_accepted_and_sha1_recovered() {
        let scramble = [3u8; SCRAMBLE_LEN];
        let token = compute_auth_token("pw", &scramble);
        let stored = hash_password("pw");

        match check_token(&stored, &scramble, &token) {
            TokenCheck::Ok { sha1_password } => {
                // The recovered hash must produce valid tokens for any
                // other scramble.
                let other = [9u8; SCRAMBLE_LEN];
                assert_eq!(
                    backend_token_from_sha1(&sha1_password, &other),
                    compute_auth_token("pw", &other)
                );
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn wrong_password_rejected() {
        let scramble = [3u8; SCRAMBLE_LEN];
        let token = compute_auth_token("nope", &scramble);
        let stored = hash_password("pw");
        assert_eq!(
            check_token(&stored, &scramble, &token),
            TokenCheck::WrongPassword
        );
    }

    #[test]
    fn empty_password_accounts() {
        let scramble = [3u8; SCRAMBLE_LEN];
        assert_eq!(
            check_token("", &scramble, &[]),
            TokenCheck::Ok {
                sha1_password: Vec::new()
            }
        );
        let token = compute_auth_token("pw", &scramble);
        assert_eq!(check_token("", &scramble, &token), TokenCheck::WrongPassword);
    }

    #[test]
    fn malformed_inputs() {
        let scramble = [3u8; SCRAMBLE_LEN];
        assert_eq!(
            check_token("nothex", &scramble, &[0u8; 20]),
            TokenCheck::Malformed
        );
        assert_eq!(
            check_token(&hash_password("pw"), &scramble, &[0u8; 7]),
            TokenCheck::Malformed
        );
    }
}
