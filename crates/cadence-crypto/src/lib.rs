//! # cadence-crypto
//!
//! Cryptographic primitives for Cadence.
//!
//! - Keccak-256 hashing of consensus messages
//! - ECDSA signing/verification (secp256k1) with address recovery
//! - `HashSigner` / `HashVerifier` seams used by the consensus core

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod hash;
mod signature;
mod signer;

pub use error::{CryptoError, CryptoResult};
pub use hash::{keccak256, keccak256_concat};
pub use signature::{
    public_key_to_address, recover_address, recover_public_key, sign, verify, PrivateKey,
    PublicKey, Signature,
};
pub use signer::{EcdsaSigner, EcdsaVerifier, HashSigner, HashVerifier};
