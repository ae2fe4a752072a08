//! ECDSA signature operations using secp256k1

use crate::{keccak256, CryptoError, CryptoResult};
use cadence_primitives::{Address, H256};
use k256::ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey};
use std::fmt;

/// Recoverable ECDSA signature
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature {
    /// r component (32 bytes)
    pub r: [u8; 32],
    /// s component (32 bytes), always in the lower half of the curve order
    pub s: [u8; 32],
    /// recovery id (0 or 1)
    pub v: u8,
}

/// Public key
pub type PublicKey = VerifyingKey;

/// Private key
pub type PrivateKey = SigningKey;

impl Signature {
    /// Create signature from r, s, v components
    pub fn new(r: [u8; 32], s: [u8; 32], v: u8) -> Self {
        Signature { r, s, v }
    }

    /// Placeholder signature carried by the genesis certificate
    pub const fn empty() -> Self {
        Signature {
            r: [0u8; 32],
            s: [0u8; 32],
            v: 0,
        }
    }

    /// Convert to 65-byte representation (r || s || v)
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = self.v;
        bytes
    }

    /// Parse from 65-byte representation
    pub fn from_bytes(bytes: &[u8; 65]) -> Self {
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Signature { r, s, v: bytes[64] }
    }

    fn to_k256(self) -> CryptoResult<K256Signature> {
        let r: k256::FieldBytes = self.r.into();
        let s: k256::FieldBytes = self.s.into();
        K256Signature::from_scalars(r, s)
            .map_err(|e| CryptoError::MalformedSignature(e.to_string()))
    }

    /// Check if signature has low-s value
    pub fn is_low_s(&self) -> bool {
        match self.to_k256() {
            Ok(sig) => sig.normalize_s().is_none(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.r[..4]))
    }
}

/// Sign a message hash with a private key. The result is always low-s.
pub fn sign(message_hash: &H256, private_key: &PrivateKey) -> CryptoResult<Signature> {
    let (mut signature, mut recovery_id) = private_key
        .sign_prehash_recoverable(message_hash.as_bytes())
        .map_err(|e| CryptoError::Signing(e.to_string()))?;

    if let Some(normalized) = signature.normalize_s() {
        signature = normalized;
        recovery_id = RecoveryId::from_byte(recovery_id.to_byte() ^ 1)
            .ok_or_else(|| CryptoError::Signing("recovery id out of range".to_string()))?;
    }

    Ok(Signature {
        r: signature.r().to_bytes().into(),
        s: signature.s().to_bytes().into(),
        v: recovery_id.to_byte(),
    })
}

/// Verify a signature against a message hash and public key
pub fn verify(
    message_hash: &H256,
    signature: &Signature,
    public_key: &PublicKey,
) -> CryptoResult<bool> {
    if !signature.is_low_s() {
        return Ok(false);
    }
    let k256_sig = signature.to_k256()?;

    use k256::ecdsa::signature::hazmat::PrehashVerifier;
    Ok(public_key
        .verify_prehash(message_hash.as_bytes(), &k256_sig)
        .is_ok())
}

/// Recover public key from signature and message hash
pub fn recover_public_key(
    message_hash: &H256,
    signature: &Signature,
) -> CryptoResult<PublicKey> {
    let k256_sig = signature.to_k256()?;
    let recovery_id = RecoveryId::from_byte(signature.v).ok_or_else(|| {
        CryptoError::MalformedSignature(format!("recovery byte {}", signature.v))
    })?;

    VerifyingKey::recover_from_prehash(message_hash.as_bytes(), &k256_sig, recovery_id)
        .map_err(|e| CryptoError::Recovery(e.to_string()))
}

/// Recover the signer address from signature and message hash
pub fn recover_address(message_hash: &H256, signature: &Signature) -> CryptoResult<Address> {
    recover_public_key(message_hash, signature).map(|pk| public_key_to_address(&pk))
}

/// Derive the node address from a public key (last 20 bytes of keccak(x || y))
pub fn public_key_to_address(public_key: &PublicKey) -> Address {
    let encoded = public_key.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);

    let mut addr_bytes = [0u8; 20];
    addr_bytes.copy_from_slice(&hash.as_bytes()[12..]);
    Address::from_bytes(addr_bytes)
}
