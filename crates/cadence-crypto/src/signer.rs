//! Signing seams used by the consensus core

use crate::{
    keccak256, public_key_to_address, recover_address, sign, CryptoError, CryptoResult,
    PrivateKey, Signature,
};
use cadence_primitives::{Address, H256};

/// Signs pre-computed message hashes on behalf of one node
pub trait HashSigner: Send + Sync {
    /// Address of the signing node
    fn address(&self) -> Address;

    /// Sign a 32-byte digest
    fn sign(&self, hash: &H256) -> CryptoResult<Signature>;
}

/// Checks that a signature over a digest was produced by a given node
pub trait HashVerifier: Send + Sync {
    /// Returns true if `signature` over `hash` was made by `signer`
    fn verify(&self, signer: &Address, hash: &H256, signature: &Signature) -> bool;
}

/// secp256k1 signer
pub struct EcdsaSigner {
    key: PrivateKey,
    address: Address,
}

impl EcdsaSigner {
    /// Wrap an existing private key
    pub fn new(key: PrivateKey) -> Self {
        let address = public_key_to_address(key.verifying_key());
        Self { key, address }
    }

    /// Deterministic key derived from a seed string (devnets and tests)
    pub fn from_seed(seed: &str) -> CryptoResult<Self> {
        let digest = keccak256(seed.as_bytes());
        Self::from_bytes(digest.as_bytes())
    }

    /// Parse a raw 32-byte secret
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let key = PrivateKey::from_slice(bytes)
            .map_err(|e| CryptoError::BadKey(e.to_string()))?;
        Ok(Self::new(key))
    }

    /// Parse a hex-encoded secret (with or without 0x prefix)
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| CryptoError::BadKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl HashSigner for EcdsaSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign(&self, hash: &H256) -> CryptoResult<Signature> {
        sign(hash, &self.key)
    }
}

/// Verifies by recovering the signer address from the signature
#[derive(Debug, Default, Clone, Copy)]
pub struct EcdsaVerifier;

impl HashVerifier for EcdsaVerifier {
    fn verify(&self, signer: &Address, hash: &H256, signature: &Signature) -> bool {
        if !signature.is_low_s() {
            return false;
        }
        matches!(recover_address(hash, signature), Ok(addr) if addr == *signer)
    }
}
