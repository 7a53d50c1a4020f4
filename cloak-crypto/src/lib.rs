//! Cryptographic primitives of the cloak compiler.
//!
//! The serializer encrypts every multi-instruction body with an AEAD keyed
//! by a per-compilation session key, and ships that session key sealed to
//! the secure element. This crate provides the [`Aead`] and [`KeySealer`]
//! abstractions the serializer is generic over, together with the concrete
//! Schwaemm128-128 instantiation ([`Schwaemm128128`]) built on the
//! Sparkle256 permutation.

#![warn(missing_docs)]
#![deny(unused_must_use)]

mod aead;
mod error;
mod schwaemm;
mod sealed;
pub mod sparkle;

pub use aead::{Aead, CipherKey, Nonce, SessionKey, KEY_SIZE, NONCE_SIZE, SESSION_KEY_SIZE, TAG_SIZE};
pub use error::Error;
pub use schwaemm::Schwaemm128128;
pub use sealed::{ElementKey, KeySealer, SealedKey, StaticKeySealer, SEALED_KEY_SIZE};
