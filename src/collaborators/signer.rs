//! Signing service used for update co-signatures.

use ed25519_dalek::{Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Detached signature in the `{signer, v, r, s, vs}` shape peers exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Hex public key of the signer
    pub signer: String,
    pub v: u8,
    /// Hex, first half of the signature
    pub r: String,
    /// Hex, second half of the signature
    pub s: String,
    /// Hex, full compact signature
    pub vs: String,
}

pub trait Signer: Send + Sync {
    fn sign_message(&self, blockchain: &str, payload: &[u8]) -> Result<Signature>;
}

pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Check a signature produced by any Ed25519 signer.
    pub fn verify(signature: &Signature, payload: &[u8]) -> Result<bool> {
        let key_bytes: [u8; 32] = decode_fixed(&signature.signer)?;
        let sig_bytes: [u8; 64] = decode_fixed(&signature.vs)?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| NodeError::Signature(e.to_string()))?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        Ok(key.verify(payload, &sig).is_ok())
    }
}

impl Signer for Ed25519Signer {
    fn sign_message(&self, _blockchain: &str, payload: &[u8]) -> Result<Signature> {
        let bytes = self.key.sign(payload).to_bytes();
        Ok(Signature {
            signer: self.public_key_hex(),
            v: 0,
            r: hex::encode(&bytes[..32]),
            s: hex::encode(&bytes[32..]),
            vs: hex::encode(bytes),
        })
    }
}

fn decode_fixed<const N: usize>(hex_str: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str).map_err(|e| NodeError::Signature(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| NodeError::Signature(format!("expected {} bytes", N)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = Ed25519Signer::generate();
        let sig = signer.sign_message("hardhat:31337", b"0xabc").unwrap();
        assert_eq!(sig.r.len(), 64);
        assert!(Ed25519Signer::verify(&sig, b"0xabc").unwrap());
        assert!(!Ed25519Signer::verify(&sig, b"0xabd").unwrap());
    }
}
