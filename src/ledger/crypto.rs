use blake2::{Blake2b512, Digest};
use blake2b_simd::Params;
use ed25519_dalek::hazmat::{self, ExpandedSecretKey};
use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use super::types::{BlockHash, PublicKey, Signature};

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid address checksum")]
    InvalidChecksum,
}

const ADDRESS_PREFIX: &str = "xrb_";
const ADDRESS_LENGTH: usize = 64;
const ALPHABET: &[u8; 32] = b"13456789abcdefghijkmnopqrstuwxyz";

/// Encodes bytes with the address alphabet; input length must be a multiple of 5
fn encode_base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 8 / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for &byte in bytes {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
        buffer &= (1 << bits) - 1;
    }

    out
}

fn decode_base32(text: &str) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for c in text.bytes() {
        let value = ALPHABET
            .iter()
            .position(|a| *a == c)
            .ok_or_else(|| CryptoError::InvalidAddress(format!("invalid character '{}'", c as char)))?;
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    if buffer != 0 {
        return Err(CryptoError::InvalidAddress("trailing bits".to_string()));
    }

    Ok(out)
}

/// Blake2b-40 of the key, byte-reversed
fn address_checksum(key: &PublicKey) -> [u8; 5] {
    let hash = Params::new().hash_length(5).hash(key.as_bytes());
    let mut checksum = [0u8; 5];
    checksum.copy_from_slice(hash.as_bytes());
    checksum.reverse();
    checksum
}

impl PublicKey {
    /// Renders the key as a checksummed `xrb_` address
    pub fn address(&self) -> String {
        // 256 bits don't split into 5-bit groups; left-pad to 280 bits and
        // drop the four leading zero characters
        let mut padded = [0u8; 35];
        padded[3..].copy_from_slice(self.as_bytes());
        let encoded = encode_base32(&padded);

        format!(
            "{}{}{}",
            ADDRESS_PREFIX,
            &encoded[4..],
            encode_base32(&address_checksum(self))
        )
    }

    /// Parses and validates a checksummed `xrb_` address
    pub fn from_address(address: &str) -> Result<Self, CryptoError> {
        if address.len() != ADDRESS_LENGTH || !address.starts_with(ADDRESS_PREFIX) {
            return Err(CryptoError::InvalidAddress("invalid address format".to_string()));
        }

        let key_part = format!("1111{}", &address[4..56]);
        let decoded = decode_base32(&key_part)?;
        if decoded.len() != 35 || decoded[..3].iter().any(|b| *b != 0) {
            return Err(CryptoError::InvalidAddress("key out of range".to_string()));
        }

        let mut key = PublicKey::ZERO;
        key.0.copy_from_slice(&decoded[3..]);

        if encode_base32(&address_checksum(&key)) != address[56..] {
            return Err(CryptoError::InvalidChecksum);
        }

        Ok(key)
    }
}

/// Checks whether the string is a well-formed address with a valid checksum
pub fn validate_address(address: &str) -> bool {
    PublicKey::from_address(address).is_ok()
}

/// Expands a private key with blake2b-512 in place of ed25519's SHA-512
fn expand(private_key: &[u8; 32]) -> ExpandedSecretKey {
    let mut digest = [0u8; 64];
    digest.copy_from_slice(&Blake2b512::digest(private_key));
    ExpandedSecretKey::from_bytes(&digest)
}

/// An ed25519 key pair owning one account chain
///
/// Keys, signatures and verification use the blake2b-512 variant of ed25519
/// that the network's blocks are signed with.
#[derive(Clone)]
pub struct KeyPair {
    private_key: [u8; 32],
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish()
    }
}

impl KeyPair {
    /// Creates a new key pair from the operating system's RNG
    pub fn generate() -> Self {
        let mut private_key = [0u8; 32];
        OsRng.fill_bytes(&mut private_key);
        Self::from_bytes(&private_key)
    }

    /// Creates a key pair from an existing 32-byte private key
    pub fn from_private_key(private_key: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = private_key.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey(format!(
                "expected 32 bytes, got {}",
                private_key.len()
            ))
        })?;

        Ok(Self::from_bytes(&bytes))
    }

    pub fn from_bytes(private_key: &[u8; 32]) -> Self {
        KeyPair {
            private_key: *private_key,
            verifying_key: VerifyingKey::from(&expand(private_key)),
        }
    }

    /// Derives the key pair at `index` from a wallet seed
    ///
    /// The private key is `blake2b-256(seed || index as big-endian u32)`.
    pub fn from_seed(seed: &[u8; 32], index: u32) -> Self {
        let hash = Params::new()
            .hash_length(32)
            .to_state()
            .update(seed)
            .update(&index.to_be_bytes())
            .finalize();

        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(hash.as_bytes());
        Self::from_bytes(&private_key)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.verifying_key.to_bytes())
    }

    pub fn address(&self) -> String {
        self.public_key().address()
    }

    /// Signs a block hash
    pub fn sign(&self, hash: &BlockHash) -> Signature {
        self.sign_message(hash.as_bytes())
    }

    pub fn sign_message(&self, message: &[u8]) -> Signature {
        let expanded = expand(&self.private_key);
        let signature = hazmat::raw_sign::<Blake2b512>(&expanded, message, &self.verifying_key);
        Signature(signature.to_bytes())
    }

    pub fn export_private_key(&self) -> [u8; 32] {
        self.private_key
    }
}

/// Verifies a signature against a message and public key
///
/// Malformed keys verify as false rather than erroring.
pub fn verify_signature(message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    let key = match VerifyingKey::from_bytes(public_key.as_bytes()) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = ed25519_dalek::Signature::from_bytes(signature.as_bytes());

    hazmat::raw_verify::<Blake2b512>(&key, message, &signature).is_ok()
}
