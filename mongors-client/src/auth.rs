//! MONGODB-CR nonce challenge key derivation.

/// Hashes a user's password the way the server stores it:
/// `md5(user + ":mongo:" + password)`, hex-encoded.
pub fn password_digest(user: &str, password: &str) -> String {
    md5_hex(&format!("{user}:mongo:{password}"))
}

/// Computes the challenge response for a server-issued nonce:
/// `md5(nonce + user + password_digest)`, hex-encoded.
pub fn auth_key(nonce: &str, user: &str, password: &str) -> String {
    md5_hex(&format!("{nonce}{user}{}", password_digest(user, password)))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}
