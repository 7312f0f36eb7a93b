//! Pairing: the human-comparable verification code and the store of base
//! static keys that have been verified at least once.

use crate::identity::PublicKey;

/// RFC 4648 base32 alphabet, no padding. The code only ever shows the first
/// 20 characters so padding never comes into play.
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = (buffer >> bits) & 0x1f;
            out.push(BASE32_ALPHABET[index as usize] as char);
        }
    }
    if bits > 0 {
        let index = (buffer << (5 - bits)) & 0x1f;
        out.push(BASE32_ALPHABET[index as usize] as char);
    }
    out
}

/// Render the channel-binding value as the pairing code shown to the user:
/// 20 base32 characters in four groups, two per line.
pub fn format_pairing_code(channel_binding: &[u8; 32]) -> String {
    let encoded = base32_encode(channel_binding);
    format!(
        "{} {}\n{} {}",
        &encoded[..5],
        &encoded[5..10],
        &encoded[10..15],
        &encoded[15..20]
    )
}

/// Persisted set of base static keys the user has confirmed. Presence means
/// trusted. Shared across sessions; implementations serialize access.
pub trait PairingStore: Send + Sync {
    /// Whether this base key completed verification before.
    fn contains(&self, key: &PublicKey) -> bool;

    /// Record a verified base key. Errors are reported so the caller can log
    /// them; a failed write only means re-verification next time.
    fn add(&self, key: &PublicKey) -> Result<(), std::io::Error>;
}
