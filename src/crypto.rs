//! Hashing and signature primitives
//!
//! The ledger consumes signing through the [`CryptoProvider`] trait so the
//! signature scheme stays opaque to validators: a provider may return any
//! signature blob (classical, post-quantum, or both concatenated) as long as
//! its own `verify` accepts it.

use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{ConsensusError, Result};
use crate::types::{ByteString, Hash};

/// SHA256(x)
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// SHA256(SHA256(x))
pub fn double_sha256(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

/// SHA256(SHA256(left || right))
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(left);
    engine.input(right);
    sha256d::Hash::from_engine(engine).into_inner()
}

/// RIPEMD160(SHA256(x))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// Address owned by a public key: hex(HASH160(pk))
pub fn address_from_public_key(public_key: &[u8]) -> String {
    hex::encode(hash160(public_key))
}

/// Number of leading zero bits of a digest
pub fn leading_zero_bits(hash: &Hash) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// secp256k1 key pair
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Derive a key pair deterministically: secret = SHA256(seed)
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        Self::from_secret_bytes(&sha256(seed))
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| ConsensusError::InvalidSignature(format!("invalid secret key: {}", e)))?;
        let secp = Secp256k1::signing_only();
        let public = PublicKey::from_secret_key(&secp, &secret);
        Ok(Self { secret, public })
    }

    /// Compressed SEC1 public key (33 bytes)
    pub fn public_key_bytes(&self) -> ByteString {
        self.public.serialize().to_vec()
    }

    pub fn address(&self) -> String {
        address_from_public_key(&self.public.serialize())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.serialize()))
            .finish_non_exhaustive()
    }
}

/// Signing collaborator consumed by the UTXO set and the validators
pub trait CryptoProvider: Send + Sync {
    fn hash(&self, data: &[u8]) -> Hash;

    fn sign(&self, message: &[u8], keypair: &KeyPair) -> Result<ByteString>;

    /// Never errors: malformed keys or signatures simply fail verification
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// ECDSA over secp256k1, signing SHA256(message), compact signatures
pub struct Secp256k1Crypto {
    secp: Secp256k1<All>,
}

impl Secp256k1Crypto {
    pub fn new() -> Self {
        Self { secp: Secp256k1::new() }
    }
}

impl Default for Secp256k1Crypto {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for Secp256k1Crypto {
    fn hash(&self, data: &[u8]) -> Hash {
        double_sha256(data)
    }

    fn sign(&self, message: &[u8], keypair: &KeyPair) -> Result<ByteString> {
        let digest = sha256(message);
        let msg = Message::from_digest_slice(&digest)
            .map_err(|e| ConsensusError::InvalidSignature(e.to_string()))?;
        let signature = self.secp.sign_ecdsa(&msg, &keypair.secret);
        Ok(signature.serialize_compact().to_vec())
    }

    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let pubkey = match PublicKey::from_slice(public_key) {
            Ok(pk) => pk,
            Err(_) => return false,
        };

        let signature = match Signature::from_compact(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };

        let digest = sha256(message);
        let msg = match Message::from_digest_slice(&digest) {
            Ok(m) => m,
            Err(_) => return false,
        };

        self.secp.verify_ecdsa(&msg, &signature, &pubkey).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let crypto = Secp256k1Crypto::new();
        let keys = KeyPair::from_seed(b"alice").unwrap();
        let sig = crypto.sign(b"message", &keys).unwrap();

        assert!(crypto.verify(b"message", &sig, &keys.public_key_bytes()));
        assert!(!crypto.verify(b"other message", &sig, &keys.public_key_bytes()));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let crypto = Secp256k1Crypto::new();
        let alice = KeyPair::from_seed(b"alice").unwrap();
        let bob = KeyPair::from_seed(b"bob").unwrap();
        let sig = crypto.sign(b"message", &alice).unwrap();

        assert!(!crypto.verify(b"message", &sig, &bob.public_key_bytes()));
    }

    #[test]
    fn test_verify_malformed_inputs() {
        let crypto = Secp256k1Crypto::new();
        let keys = KeyPair::from_seed(b"alice").unwrap();

        assert!(!crypto.verify(b"message", &[0u8; 10], &keys.public_key_bytes()));
        assert!(!crypto.verify(b"message", &[0u8; 64], &[0x02; 5]));
    }

    #[test]
    fn test_address_is_hash160_hex() {
        let keys = KeyPair::from_seed(b"alice").unwrap();
        let address = keys.address();
        assert_eq!(address.len(), 40);
        assert_eq!(address, address_from_public_key(&keys.public_key_bytes()));
    }

    #[test]
    fn test_leading_zero_bits() {
        let mut hash = [0xffu8; 32];
        assert_eq!(leading_zero_bits(&hash), 0);
        hash[0] = 0;
        hash[1] = 0x0f;
        assert_eq!(leading_zero_bits(&hash), 12);
        assert_eq!(leading_zero_bits(&[0u8; 32]), 256);
    }

    #[test]
    fn test_double_sha256_differs_from_single() {
        assert_ne!(sha256(b"abc"), double_sha256(b"abc"));
        assert_eq!(double_sha256(b"abc"), sha256(&sha256(b"abc")));
    }

    #[test]
    fn test_provider_hash_is_double_sha256() {
        let crypto = Secp256k1Crypto::new();
        assert_eq!(crypto.hash(b"abc"), double_sha256(b"abc"));
    }
}
