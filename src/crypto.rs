//! Curve25519 / XSalsa20-Poly1305 box primitives.
//!
//! `derive_shared_secret` is the NaCl `box_beforenm` (X25519 followed by
//! HSalsa20 with a zero input block); `seal`/`open` are `secretbox` under
//! that precomputed key. Boxes are laid out as `tag || ciphertext`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use rand::RngCore;
use rand::rngs::OsRng;
use salsa20::cipher::consts::U10;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::RelayError;

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
/// Each side contributes half of the 24-byte XSalsa20 nonce.
pub const HALF_NONCE_LEN: usize = 12;
pub const NONCE_LEN: usize = 2 * HALF_NONCE_LEN;

/// 服务器长期私钥 / The server's long-term Curve25519 secret key.
#[derive(Clone)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Parses 64 hex digits.
    pub fn from_hex(input: &str) -> Result<Self> {
        let bytes = hex::decode(input.trim()).context("private key is not valid hex")?;
        if bytes.len() != KEY_LEN {
            bail!(
                "private key must be {} hex characters, got {}",
                KEY_LEN * 2,
                input.trim().len()
            );
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        PublicKey::from(&StaticSecret::from(self.0)).to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Precomputed per-client box key.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

pub fn derive_shared_secret(public: &[u8; KEY_LEN], secret: &SecretKey) -> SharedSecret {
    let dh = StaticSecret::from(secret.0).diffie_hellman(&PublicKey::from(*public));
    let key = salsa20::hsalsa::<U10>(
        GenericArray::from_slice(dh.as_bytes()),
        &GenericArray::default(),
    );
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&key);
    SharedSecret(out)
}

/// Encrypts `plaintext`, returning `tag || ciphertext`.
pub fn seal(
    shared: &SharedSecret,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, RelayError> {
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(&shared.0));
    let mut out = Vec::with_capacity(TAG_LEN + plaintext.len());
    out.resize(TAG_LEN, 0);
    out.extend_from_slice(plaintext);
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), b"", &mut out[TAG_LEN..])
        .map_err(|_| RelayError::CryptoFailure)?;
    out[..TAG_LEN].copy_from_slice(&tag);
    Ok(out)
}

/// Authenticates and decrypts a `tag || ciphertext` box.
pub fn open(
    shared: &SharedSecret,
    nonce: &[u8; NONCE_LEN],
    boxed: &[u8],
) -> Result<Vec<u8>, RelayError> {
    if boxed.len() < TAG_LEN {
        return Err(RelayError::CryptoFailure);
    }
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(&shared.0));
    let (tag, ciphertext) = boxed.split_at(TAG_LEN);
    let mut out = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            &mut out,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| RelayError::CryptoFailure)?;
    Ok(out)
}

pub fn full_nonce(
    client: &[u8; HALF_NONCE_LEN],
    server: &[u8; HALF_NONCE_LEN],
) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..HALF_NONCE_LEN].copy_from_slice(client);
    nonce[HALF_NONCE_LEN..].copy_from_slice(server);
    nonce
}

/// Server half of a nonce: 8 bytes of big-endian wall-clock nanoseconds
/// followed by 4 random bytes.
pub fn server_nonce() -> [u8; HALF_NONCE_LEN] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut nonce = [0u8; HALF_NONCE_LEN];
    nonce[..8].copy_from_slice(&nanos.to_be_bytes());
    OsRng.fill_bytes(&mut nonce[8..]);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_from_hex(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    const ALICE_SK: &str = "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a";
    const ALICE_PK: &str = "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a";
    const BOB_SK: &str = "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb";
    const BOB_PK: &str = "de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f";
    const BEFORENM: &str = "1b27556473e985d462cd51197a9a46c76009549eac6474f206c4ee0844f68389";

    #[test]
    fn public_key_matches_rfc7748() {
        let alice = SecretKey::from_hex(ALICE_SK).unwrap();
        assert_eq!(alice.public_key(), key_from_hex(ALICE_PK));
        let bob = SecretKey::from_hex(BOB_SK).unwrap();
        assert_eq!(bob.public_key(), key_from_hex(BOB_PK));
    }

    #[test]
    fn shared_secret_matches_nacl_beforenm() {
        let alice = SecretKey::from_hex(ALICE_SK).unwrap();
        let bob = SecretKey::from_hex(BOB_SK).unwrap();
        let ab = derive_shared_secret(&key_from_hex(BOB_PK), &alice);
        let ba = derive_shared_secret(&key_from_hex(ALICE_PK), &bob);
        assert_eq!(ab, ba);
        assert_eq!(ab.as_bytes(), &key_from_hex(BEFORENM));
    }

    #[test]
    fn rejects_bad_hex_keys() {
        assert!(SecretKey::from_hex("zz").is_err());
        assert!(SecretKey::from_hex(&"ab".repeat(31)).is_err());
        assert!(SecretKey::from_hex(&format!(" {ALICE_SK}\n")).is_ok());
    }

    #[test]
    fn seal_then_open() {
        let client = SecretKey::generate();
        let server = SecretKey::generate();
        let shared = derive_shared_secret(&client.public_key(), &server);
        let nonce = full_nonce(&[1u8; 12], &server_nonce());

        let sealed = seal(&shared, &nonce, b"dns message").unwrap();
        assert_eq!(sealed.len(), TAG_LEN + 11);
        assert_ne!(&sealed[TAG_LEN..], b"dns message");

        let peer_view = derive_shared_secret(&server.public_key(), &client);
        assert_eq!(open(&peer_view, &nonce, &sealed).unwrap(), b"dns message");
    }

    #[test]
    fn open_rejects_tampering() {
        let shared = SharedSecret::from_bytes([9u8; 32]);
        let nonce = [3u8; NONCE_LEN];
        let mut sealed = seal(&shared, &nonce, b"payload").unwrap();
        sealed[TAG_LEN + 2] ^= 0x01;
        assert!(matches!(open(&shared, &nonce, &sealed), Err(RelayError::CryptoFailure)));

        let sealed = seal(&shared, &nonce, b"payload").unwrap();
        let mut other = nonce;
        other[23] ^= 0x80;
        assert!(matches!(open(&shared, &other, &sealed), Err(RelayError::CryptoFailure)));
        assert!(matches!(open(&shared, &nonce, &sealed[..10]), Err(RelayError::CryptoFailure)));
    }

    #[test]
    fn empty_plaintext_is_just_a_tag() {
        let shared = SharedSecret::from_bytes([1u8; 32]);
        let nonce = [0u8; NONCE_LEN];
        let sealed = seal(&shared, &nonce, b"").unwrap();
        assert_eq!(sealed.len(), TAG_LEN);
        assert!(open(&shared, &nonce, &sealed).unwrap().is_empty());
    }

    #[test]
    fn server_nonces_differ() {
        let a = server_nonce();
        let b = server_nonce();
        assert_ne!(a, b);
        assert_eq!(full_nonce(&[7u8; 12], &a)[..12], [7u8; 12]);
        assert_eq!(full_nonce(&[7u8; 12], &a)[12..], a);
    }
}
