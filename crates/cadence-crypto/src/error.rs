//! Errors from key handling and ECDSA operations

use thiserror::Error;

/// Key, signing or recovery failure
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Secret key bytes or hex that do not form a secp256k1 scalar
    #[error("bad validator key: {0}")]
    BadKey(String),

    /// The signer could not produce a signature
    #[error("cannot sign: {0}")]
    Signing(String),

    /// Signature bytes that do not decode (scalars or recovery byte)
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// No public key matches the signature and hash
    #[error("cannot recover signer: {0}")]
    Recovery(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
