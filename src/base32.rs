//! DNSCurve base32: alphabet `0123456789bcdfghjklmnpqrstuvwxyz`, five bits
//! per symbol, least significant bits first. Decoding is case-insensitive.

use std::sync::LazyLock;

use data_encoding::{BitOrder, Encoding, Specification};

pub const SYMBOLS: &str = "0123456789bcdfghjklmnpqrstuvwxyz";

/// Encoded length of a 32-byte public key once its always-zero top bit is dropped.
pub const KEY_CHARS: usize = 51;

static DNSCURVE: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str(SYMBOLS);
    spec.bit_order = BitOrder::LeastSignificantFirst;
    spec.translate.from.push_str("BCDFGHJKLMNPQRSTUVWXYZ");
    spec.translate.to.push_str("bcdfghjklmnpqrstuvwxyz");
    spec.check_trailing_bits = true;
    spec.encoding()
        .unwrap_or_else(|err| unreachable!("static base32 specification: {err}"))
});

pub fn encode(input: &[u8]) -> String {
    DNSCURVE.encode(input)
}

/// Strict decode: a symbol outside the alphabet, an impossible length or
/// non-zero trailing bits all reject the input.
pub fn decode(input: &[u8]) -> Option<Vec<u8>> {
    DNSCURVE.decode(input).ok()
}

/// Encodes a Curve25519 public key as the 51 symbols carried after `uz5`.
pub fn encode_key(key: &[u8; 32]) -> String {
    let mut out = encode(key);
    out.truncate(KEY_CHARS);
    out
}

/// Decodes the 51 symbols of a `x1a`/`uz5` label back into a public key.
/// The missing 52nd symbol is taken as zero, so the key's top bit is always clear.
pub fn decode_key(input: &[u8]) -> Option<[u8; 32]> {
    if input.len() != KEY_CHARS {
        return None;
    }
    let mut padded = [b'0'; KEY_CHARS + 1];
    padded[..KEY_CHARS].copy_from_slice(input);
    let bytes = decode(&padded)?;
    bytes.try_into().ok()
}
