//! Block ciphers sealing every frame on the wire.
//!
//! The cipher is a pluggable capability: transports only see [`BlockCrypt`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

/// Upper bound of bytes a cipher adds to one frame.
pub const SEAL_OVERHEAD: usize = 64;

const GCM_NONCE_LEN: usize = 12;

/// Cipher errors.
#[derive(Debug, Error)]
pub enum CryptError {
    #[error("unknown cipher algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("cipher {0} requires a non-empty secret")]
    EmptySecret(String),

    #[error("sealed frame too short: {0} bytes")]
    Truncated(usize),

    #[error("frame authentication failed")]
    Authentication,
}

pub type Result<T> = std::result::Result<T, CryptError>;

/// Cipher selection as it appears in configuration files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptConfig {
    /// `none`, `xor` or `aes-256-gcm`.
    #[serde(default)]
    pub algorithm: String,
    #[serde(default)]
    pub secret: String,
}

impl CryptConfig {
    pub fn new(algorithm: &str, secret: &str) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            secret: secret.to_string(),
        }
    }

    /// Build the configured cipher, `None` when frames travel in the clear.
    pub fn block(&self) -> Result<Option<Arc<dyn BlockCrypt>>> {
        match self.algorithm.as_str() {
            "" | "none" => Ok(None),
            "xor" => Ok(Some(Arc::new(XorBlock::new(&self.secret)?))),
            "aes-256-gcm" | "aes" => Ok(Some(Arc::new(AesGcmBlock::new(&self.secret)?))),
            other => Err(CryptError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// A cipher applied to whole frames.
pub trait BlockCrypt: Send + Sync {
    fn name(&self) -> &'static str;

    /// Encrypt `data` in place.
    fn seal(&self, data: &mut Vec<u8>) -> Result<()>;

    /// Decrypt `data` in place.
    fn open(&self, data: &mut Vec<u8>) -> Result<()>;
}

/// Repeating-key XOR. Obfuscation only.
pub struct XorBlock {
    key: Vec<u8>,
}

impl XorBlock {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(CryptError::EmptySecret("xor".to_string()));
        }
        Ok(Self {
            key: secret.as_bytes().to_vec(),
        })
    }

    fn apply(&self, data: &mut [u8]) {
        for (byte, k) in data.iter_mut().zip(self.key.iter().cycle()) {
            *byte ^= k;
        }
    }
}

impl BlockCrypt for XorBlock {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn seal(&self, data: &mut Vec<u8>) -> Result<()> {
        self.apply(data);
        Ok(())
    }

    fn open(&self, data: &mut Vec<u8>) -> Result<()> {
        self.apply(data);
        Ok(())
    }
}

/// AES-256-GCM with a random nonce prepended to each frame.
///
/// The key is the SHA-256 digest of the configured secret.
pub struct AesGcmBlock {
    cipher: Aes256Gcm,
}

impl AesGcmBlock {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(CryptError::EmptySecret("aes-256-gcm".to_string()));
        }
        let key = Sha256::digest(secret.as_bytes());
        Ok(Self {
            cipher: Aes256Gcm::new(&key),
        })
    }
}

impl BlockCrypt for AesGcmBlock {
    fn name(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn seal(&self, data: &mut Vec<u8>) -> Result<()> {
        let nonce: [u8; GCM_NONCE_LEN] = rand::random();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), data.as_slice())
            .map_err(|_| CryptError::Authentication)?;
        data.clear();
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&sealed);
        Ok(())
    }

    fn open(&self, data: &mut Vec<u8>) -> Result<()> {
        if data.len() < GCM_NONCE_LEN {
            return Err(CryptError::Truncated(data.len()));
        }
        let (nonce, sealed) = data.split_at(GCM_NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptError::Authentication)?;
        *data = plain;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_cleartext() {
        assert!(CryptConfig::default().block().unwrap().is_none());
        assert!(CryptConfig::new("none", "").block().unwrap().is_none());
    }

    #[test]
    fn test_unknown_algorithm() {
        let err = CryptConfig::new("rot13", "x").block().err().unwrap();
        assert!(matches!(err, CryptError::UnknownAlgorithm(a) if a == "rot13"));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(CryptConfig::new("xor", "").block().is_err());
        assert!(CryptConfig::new("aes-256-gcm", "").block().is_err());
    }

    #[test]
    fn test_xor_restores_payload() {
        let block = CryptConfig::new("xor", "k3y").block().unwrap().unwrap();
        let mut data = b"hello overlay".to_vec();
        block.seal(&mut data).unwrap();
        assert_ne!(data, b"hello overlay");
        block.open(&mut data).unwrap();
        assert_eq!(data, b"hello overlay");
    }

    #[test]
    fn test_aes_gcm_detects_tampering() {
        let block = CryptConfig::new("aes-256-gcm", "secret").block().unwrap().unwrap();
        let mut data = vec![7u8; 100];
        block.seal(&mut data).unwrap();
        assert!(data.len() <= 100 + SEAL_OVERHEAD);

        let mut tampered = data.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(block.open(&mut tampered), Err(CryptError::Authentication)));

        block.open(&mut data).unwrap();
        assert_eq!(data, vec![7u8; 100]);
    }

    #[test]
    fn test_aes_gcm_wrong_secret() {
        let a = AesGcmBlock::new("one").unwrap();
        let b = AesGcmBlock::new("two").unwrap();
        let mut data = b"frame".to_vec();
        a.seal(&mut data).unwrap();
        assert!(b.open(&mut data).is_err());
    }
}
