use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Error;

/// AEAD key length in bytes (128 bits).
pub const KEY_SIZE: usize = 16;

/// AEAD nonce length in bytes (128 bits).
pub const NONCE_SIZE: usize = 16;

/// AEAD tag length in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Session secret length in bytes.
///
/// The sealed envelope carries 32 bytes of session secret; the AEAD keys
/// itself from the leading [`KEY_SIZE`] bytes.
pub const SESSION_KEY_SIZE: usize = 32;

/// Symmetric cipher key.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey([u8; KEY_SIZE]);

impl CipherKey {
    /// Wrap raw key bytes.
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8; KEY_SIZE]> for CipherKey {
    fn as_ref(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// AEAD nonce.
///
/// The serializer never transmits nonces; both sides derive them from the
/// multi-instruction's `instrID`, so every sealed body under one session
/// key gets a distinct nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Wrap raw nonce bytes.
    pub const fn new(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// The all-zero nonce, reserved for the key envelope.
    pub const fn zeroed() -> Self {
        Self([0; NONCE_SIZE])
    }

    /// Big-endian encoding of a counter.
    pub const fn from_counter(counter: u128) -> Self {
        Self(counter.to_be_bytes())
    }
}

impl AsRef<[u8; NONCE_SIZE]> for Nonce {
    fn as_ref(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// Per-compilation session secret.
///
/// Generated fresh for every output stream and shipped sealed to the secure
/// element in the bytecode header.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Wrap raw session secret bytes.
    pub const fn new(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Draw a fresh session secret.
    #[cfg(feature = "random")]
    pub fn random(rng: &mut impl rand::Rng) -> Self {
        Self(rng.gen())
    }

    /// The cipher key for the sealed bodies: the leading [`KEY_SIZE`] bytes
    /// of the secret.
    pub fn cipher_key(&self) -> CipherKey {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&self.0[..KEY_SIZE]);
        CipherKey::new(key)
    }
}

impl AsRef<[u8; SESSION_KEY_SIZE]> for SessionKey {
    fn as_ref(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

/// Authenticated encryption with associated data.
///
/// `encrypt` returns `ciphertext ‖ tag`; `decrypt` takes the same and
/// fails with [`Error::InvalidTag`] when authentication fails. The
/// serializer is generic over this trait so tests can substitute a
/// deterministic double.
pub trait Aead {
    /// Encrypt `plaintext`, authenticating `ad` alongside it.
    fn encrypt(&self, key: &CipherKey, nonce: &Nonce, ad: &[u8], plaintext: &[u8]) -> Vec<u8>;

    /// Decrypt and authenticate `ciphertext` (which carries its tag).
    fn decrypt(
        &self,
        key: &CipherKey,
        nonce: &Nonce,
        ad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error>;
}
