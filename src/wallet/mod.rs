use rand::rngs::OsRng;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, ecdsa::Signature};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use thiserror::Error;

/// Version marker every address starts with.
pub const ADDRESS_PREFIX: &str = "0x";

/// Number of hex characters after the prefix (20 bytes).
pub const ADDRESS_HEX_LEN: usize = 40;

/// Reserved issuer of mining rewards. Never signs anything.
pub const SYSTEM_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid hex: {0}")]
    Hex(String),
}

/// Freshly generated key material, all hex encoded.
#[derive(Debug, Clone, Serialize)]
pub struct Wallet {
    pub private_key: String,
    pub public_key: String,
    pub address: String,
}

impl Wallet {
    /// Generate a new secp256k1 keypair and its address.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut OsRng);
        let public_key = hex::encode(pk.serialize()); // compressed (33 bytes)
        Self {
            private_key: hex::encode(sk.secret_bytes()),
            address: address_from_pubkey(&pk),
            public_key,
        }
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 applied twice. The outer hash runs over the raw inner digest.
pub fn double_hash(data: &[u8]) -> String {
    let inner = Sha256::digest(data);
    hex::encode(Sha256::digest(inner))
}

fn address_from_pubkey(pk: &PublicKey) -> String {
    let sha = Sha256::digest(pk.serialize());
    let keccak = Keccak256::digest(sha);
    format!("{ADDRESS_PREFIX}{}", hex::encode(&keccak[12..]))
}

/// Derive the address for a hex-encoded public key (compressed or not).
pub fn derive_address(pubkey_hex: &str) -> Result<String, CryptoError> {
    let pk = parse_public_key(pubkey_hex)?;
    Ok(address_from_pubkey(&pk))
}

/// Public key (hex, compressed) belonging to a hex private key.
pub fn public_key_for(privkey_hex: &str) -> Result<String, CryptoError> {
    let secp = Secp256k1::signing_only();
    let sk = parse_private_key(privkey_hex)?;
    Ok(hex::encode(PublicKey::from_secret_key(&secp, &sk).serialize()))
}

/// Format check only: prefix plus 40 lowercase hex chars.
pub fn is_valid_address(address: &str) -> bool {
    match address.strip_prefix(ADDRESS_PREFIX) {
        Some(body) => {
            body.len() == ADDRESS_HEX_LEN
                && body
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

/// True when the hex decodes to a scalar in the curve order.
pub fn is_valid_private_key(privkey_hex: &str) -> bool {
    parse_private_key(privkey_hex).is_ok()
}

/// Sign `data` (hashed with SHA-256 first) and return a hex DER signature.
pub fn sign(data: &[u8], privkey_hex: &str) -> Result<String, CryptoError> {
    let secp = Secp256k1::signing_only();
    let sk = parse_private_key(privkey_hex)?;
    let msg = message_for(data)?;
    let sig = secp.sign_ecdsa(&msg, &sk);
    Ok(hex::encode(&*sig.serialize_der()))
}

/// Verify a hex DER signature against a hex public key. Malformed input is
/// simply `false`.
pub fn verify(data: &[u8], sig_hex: &str, pubkey_hex: &str) -> bool {
    let secp = Secp256k1::verification_only();

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(sig) = Signature::from_der(&sig_bytes) else {
        return false;
    };
    let Ok(pk) = parse_public_key(pubkey_hex) else {
        return false;
    };
    let Ok(msg) = message_for(data) else {
        return false;
    };
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

fn message_for(data: &[u8]) -> Result<Message, CryptoError> {
    let digest = Sha256::digest(data);
    Message::from_slice(&digest).map_err(|_| CryptoError::InvalidSignature)
}

fn parse_private_key(privkey_hex: &str) -> Result<SecretKey, CryptoError> {
    let bytes = hex::decode(privkey_hex).map_err(|e| CryptoError::Hex(e.to_string()))?;
    SecretKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPrivateKey)
}

fn parse_public_key(pubkey_hex: &str) -> Result<PublicKey, CryptoError> {
    let bytes = hex::decode(pubkey_hex).map_err(|e| CryptoError::Hex(e.to_string()))?;
    PublicKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_wallet_is_consistent() {
        let w = Wallet::generate();
        assert!(is_valid_private_key(&w.private_key));
        assert!(is_valid_address(&w.address));
        assert_eq!(derive_address(&w.public_key).unwrap(), w.address);
        assert_eq!(public_key_for(&w.private_key).unwrap(), w.public_key);
    }

    #[test]
    fn sign_and_verify() {
        let w = Wallet::generate();
        let sig = sign(b"batch-42 shipped", &w.private_key).unwrap();
        assert!(verify(b"batch-42 shipped", &sig, &w.public_key));
        assert!(!verify(b"batch-42 received", &sig, &w.public_key));

        let other = Wallet::generate();
        assert!(!verify(b"batch-42 shipped", &sig, &other.public_key));
    }

    #[test]
    fn verify_rejects_garbage_without_panicking() {
        let w = Wallet::generate();
        assert!(!verify(b"x", "zz", &w.public_key));
        assert!(!verify(b"x", "3044", &w.public_key));
        assert!(!verify(b"x", "", "not-a-key"));
    }

    #[test]
    fn sign_rejects_bad_private_key() {
        // zero is not a valid scalar
        let zero = "00".repeat(32);
        assert_eq!(sign(b"x", &zero), Err(CryptoError::InvalidPrivateKey));
        assert!(matches!(sign(b"x", "nothex"), Err(CryptoError::Hex(_))));
        assert!(!is_valid_private_key(&zero));
    }

    #[test]
    fn address_format() {
        assert!(is_valid_address(SYSTEM_ADDRESS));
        assert!(!is_valid_address("0x1234"));
        assert!(!is_valid_address(&format!("1x{}", "a".repeat(40))));
        assert!(!is_valid_address(&format!("0x{}", "A".repeat(40))));
        assert!(!is_valid_address(&format!("0x{}", "g".repeat(40))));
    }

    #[test]
    fn hashing() {
        assert_eq!(
            hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(double_hash(b"abc"), hash(b"abc"));
        assert_eq!(double_hash(b"abc"), double_hash(b"abc"));
        assert_eq!(double_hash(b"abc").len(), 64);
    }
}
