/// Crypto error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The authentication tag did not match the ciphertext.
    #[error("authentication tag mismatch")]
    InvalidTag,

    /// The ciphertext is shorter than a tag.
    #[error("ciphertext is too short to carry a tag")]
    TruncatedCiphertext,
}
