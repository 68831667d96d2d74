//! Ed25519 identity keypairs and public-key digests.
//!
//! A Host is known to the Router by the SHA-256 digest of its public key;
//! the digest is the primary lookup key in the directory.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{NetError, NetResult};

/// 32-byte SHA-256 digest of an identity public key.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct KeyHash(pub [u8; 32]);

impl KeyHash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> NetResult<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NetError::InvalidKey(format!("key hash must be 32 bytes, got {}", bytes.len())))?;
        Ok(KeyHash(arr))
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({})", self)
    }
}

/// Digest of a raw public key.
pub fn hash_public_key(public_key: &[u8]) -> KeyHash {
    let digest = Sha256::digest(public_key);
    KeyHash(digest.into())
}

/// An Ed25519 identity keypair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Parse from the hex form produced by [`private_key_hex`](Self::private_key_hex).
    pub fn from_hex(private_hex: &str) -> NetResult<Self> {
        let bytes = hex::decode(private_hex.trim()).map_err(|e| NetError::InvalidKey(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| NetError::InvalidKey(format!("private key must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&arr),
        })
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn public_key_hash(&self) -> KeyHash {
        hash_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

/// Verify `signature` over `message` against a hex public key.
pub fn verify(public_key_hex: &str, message: &[u8], signature: &[u8]) -> NetResult<()> {
    let key_bytes = hex::decode(public_key_hex).map_err(|e| NetError::InvalidKey(e.to_string()))?;
    let arr: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| NetError::InvalidKey(format!("public key must be 32 bytes, got {}", key_bytes.len())))?;
    let key = VerifyingKey::from_bytes(&arr).map_err(|e| NetError::InvalidKey(e.to_string()))?;
    let sig = Signature::from_slice(signature).map_err(|_| NetError::InvalidSignature)?;
    key.verify(message, &sig).map_err(|_| NetError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_serialize_parse_sign_verify_round_trip() {
        let pair = IdentityKeyPair::generate();
        let parsed = IdentityKeyPair::from_hex(&pair.private_key_hex()).unwrap();
        assert_eq!(pair.public_key_hex(), parsed.public_key_hex());

        let sig = parsed.sign(b"challenge");
        verify(&pair.public_key_hex(), b"challenge", &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails_verification() {
        let pair = IdentityKeyPair::generate();
        let sig = pair.sign(b"challenge");
        assert!(matches!(
            verify(&pair.public_key_hex(), b"challenge!", &sig),
            Err(NetError::InvalidSignature)
        ));
    }

    #[test]
    fn key_hash_is_stable_for_a_key() {
        let pair = IdentityKeyPair::generate();
        assert_eq!(pair.public_key_hash(), hash_public_key(&pair.public_key_bytes()));
        assert_eq!(pair.public_key_hash().to_string().len(), 64);
    }
}
