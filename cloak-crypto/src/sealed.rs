use sha2::{Digest, Sha256};

use crate::{Aead, CipherKey, Error, Nonce, SessionKey, KEY_SIZE, SESSION_KEY_SIZE, TAG_SIZE};

/// Sealed session-key envelope length: the 32-byte secret plus the tag.
pub const SEALED_KEY_SIZE: usize = SESSION_KEY_SIZE + TAG_SIZE;

/// Public key material identifying the target secure element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementKey(pub [u8; 32]);

impl AsRef<[u8]> for ElementKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The sealed session key shipped in the bytecode header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedKey(pub [u8; SEALED_KEY_SIZE]);

impl AsRef<[u8]> for SealedKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Seals a session key to a secure element.
///
/// The serializer is generic over this trait; tests substitute a
/// deterministic double.
pub trait KeySealer {
    /// Produce the envelope for `session`, readable only by the element
    /// identified by `element`.
    fn seal(&self, element: &ElementKey, session: &SessionKey) -> SealedKey;
}

/// Envelope construction for elements provisioned with a static key.
///
/// Wraps the session secret with the stream AEAD under a key derived from
/// the element key material by SHA-256, using the all-zero nonce reserved
/// for the envelope. This stands in for the element vendor's
/// key-encapsulation scheme, which lives outside the compiler; the
/// envelope length and layout on the wire are fixed either way.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticKeySealer<A> {
    aead: A,
}

impl<A: Aead> StaticKeySealer<A> {
    /// Build a sealer over the given AEAD.
    pub const fn new(aead: A) -> Self {
        Self { aead }
    }

    fn wrapping_key(element: &ElementKey) -> CipherKey {
        let digest = Sha256::digest(element.as_ref());
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest[..KEY_SIZE]);
        CipherKey::new(key)
    }

    /// Recover the session key from an envelope; the element-side
    /// counterpart of [`KeySealer::seal`].
    pub fn open(&self, element: &ElementKey, sealed: &SealedKey) -> Result<SessionKey, Error> {
        let key = Self::wrapping_key(element);
        let plain = self
            .aead
            .decrypt(&key, &Nonce::zeroed(), &[], sealed.as_ref())?;
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        bytes.copy_from_slice(&plain);
        Ok(SessionKey::new(bytes))
    }
}

impl<A: Aead> KeySealer for StaticKeySealer<A> {
    fn seal(&self, element: &ElementKey, session: &SessionKey) -> SealedKey {
        let key = Self::wrapping_key(element);
        let sealed = self
            .aead
            .encrypt(&key, &Nonce::zeroed(), &[], session.as_ref().as_slice());
        let mut bytes = [0u8; SEALED_KEY_SIZE];
        bytes.copy_from_slice(&sealed);
        SealedKey(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Schwaemm128128;

    #[test]
    fn seal_then_open_returns_the_session_key() {
        let sealer = StaticKeySealer::new(Schwaemm128128);
        let element = ElementKey([7; 32]);
        let session = SessionKey::new([9; SESSION_KEY_SIZE]);

        let sealed = sealer.seal(&element, &session);
        let opened = sealer.open(&element, &sealed).expect("envelope is valid");
        assert_eq!(opened, session);
    }

    #[test]
    fn wrong_element_key_fails_to_open() {
        let sealer = StaticKeySealer::new(Schwaemm128128);
        let session = SessionKey::new([9; SESSION_KEY_SIZE]);

        let sealed = sealer.seal(&ElementKey([7; 32]), &session);
        assert!(sealer.open(&ElementKey([8; 32]), &sealed).is_err());
    }
}
