//! Recipient token minting.
//!
//! The token is the only credential a tracking callback carries, so it is
//! drawn from the operating system RNG and never derived from ids.

use rand::rngs::OsRng;
use rand::RngCore;

/// Number of random bytes in a recipient token.
pub const TOKEN_BYTES: usize = 16;

/// Mint a fresh recipient token as lowercase hex.
pub fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Cheap shape check used before touching the database.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_BYTES * 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}
