//! Cryptographic primitives for the VSportChain node

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub const ADDRESS_LENGTH: usize = 20;

/// 32-byte SHA-256 digest used for block and header hashes.
pub type Hash = [u8; 32];

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Account address: the trailing 20 bytes of SHA-256 over the compressed public key.
///
/// The all-zero address is the "unset" sentinel for the mining address.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    pub const fn zero() -> Self {
        Address([0u8; ADDRESS_LENGTH])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LENGTH]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_public_key(pubkey: &[u8]) -> Self {
        let digest = sha256(pubkey);
        let mut out = [0u8; ADDRESS_LENGTH];
        out.copy_from_slice(&digest[32 - ADDRESS_LENGTH..]);
        Address(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(trimmed)
            .map_err(|e| ChainError::CryptoError(format!("Invalid hex address: {}", e)))?;
        if bytes.len() != ADDRESS_LENGTH {
            return Err(ChainError::CryptoError(format!(
                "Address must be {} bytes, got {}",
                ADDRESS_LENGTH,
                bytes.len()
            )));
        }
        let mut out = [0u8; ADDRESS_LENGTH];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Hex form of a 32-byte hash, `0x`-prefixed.
pub fn hash_to_hex(hash: &Hash) -> String {
    format!("0x{}", hex::encode(hash))
}

/// A signature over a 32-byte digest, carrying the signer's compressed public key
/// so that verifiers can derive the signing address without key recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedDigest {
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub signature: [u8; COMPACT_SIGNATURE_SIZE],
}

pub const SIGNED_DIGEST_LENGTH: usize = PUBLIC_KEY_SIZE + COMPACT_SIGNATURE_SIZE;

impl SignedDigest {
    pub fn to_bytes(&self) -> [u8; SIGNED_DIGEST_LENGTH] {
        let mut out = [0u8; SIGNED_DIGEST_LENGTH];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(&self.public_key);
        out[PUBLIC_KEY_SIZE..].copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() != SIGNED_DIGEST_LENGTH {
            return Err(ChainError::CryptoError(format!(
                "Signed digest must be {} bytes, got {}",
                SIGNED_DIGEST_LENGTH,
                bytes.len()
            )));
        }
        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        let mut signature = [0u8; COMPACT_SIGNATURE_SIZE];
        public_key.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        signature.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);
        Ok(Self {
            public_key,
            signature,
        })
    }

    /// Verifies the signature against `digest` and returns the signer address.
    pub fn verify(&self, digest: &Hash) -> Result<Address, ChainError> {
        verify_digest(&self.public_key, digest, &self.signature)?;
        Ok(Address::from_public_key(&self.public_key))
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Result<Self, ChainError> {
        let secret_key = SecretKey::new(&mut OsRng);
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key.serialize())
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Signs an already-hashed 32-byte digest.
    pub fn sign_digest(&self, digest: &Hash) -> Result<SignedDigest, ChainError> {
        let message = Message::from_digest_slice(digest)
            .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;
        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(SignedDigest {
            public_key: self.public_key_bytes(),
            signature: signature.serialize_compact(),
        })
    }
}

/// Verifies a compact ECDSA signature over a 32-byte digest.
pub fn verify_digest(
    public_key_bytes: &[u8],
    digest: &Hash,
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;
    let message = Message::from_digest_slice(digest)
        .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;
    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip_through_hex() {
        let keypair = KeyPair::generate().unwrap();
        let address = keypair.address();
        let text = address.to_string();
        assert!(text.starts_with("0x"));
        assert_eq!(text.len(), 2 + ADDRESS_LENGTH * 2);
        assert_eq!(text.parse::<Address>().unwrap(), address);
    }

    #[test]
    fn test_zero_address_is_unset() {
        assert!(Address::zero().is_zero());
        assert!(Address::default().is_zero());
        let keypair = KeyPair::generate().unwrap();
        assert!(!keypair.address().is_zero());
    }

    #[test]
    fn test_sign_and_verify_digest() {
        let keypair = KeyPair::generate().unwrap();
        let digest = sha256(b"header seal hash");
        let signed = keypair.sign_digest(&digest).unwrap();
        assert_eq!(signed.verify(&digest).unwrap(), keypair.address());

        let decoded = SignedDigest::from_bytes(&signed.to_bytes()).unwrap();
        assert_eq!(decoded, signed);
    }

    #[test]
    fn test_tampered_digest() {
        let keypair = KeyPair::generate().unwrap();
        let signed = keypair.sign_digest(&sha256(b"original")).unwrap();
        let result = signed.verify(&sha256(b"tampered"));
        assert_eq!(
            result.unwrap_err().to_string(),
            "Cryptographic error: Signature verification failed"
        );
    }

    #[test]
    fn test_invalid_address_length() {
        let result = "0xabcd".parse::<Address>();
        assert!(result.unwrap_err().to_string().contains("Address must be"));
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let short_bytes = [0u8; SECRET_KEY_SIZE - 1];
        let result = KeyPair::from_secret_bytes(&short_bytes);
        assert!(result.unwrap_err().to_string().contains("Secret key must be"));
    }
}
