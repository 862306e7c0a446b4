//! # Cipher Primitives
//!
//! This module provides the cryptographic building blocks the protocol engine
//! combines. It deliberately knows nothing about handshakes or sessions:
//!
//! - **Asymmetric**: RSA-OAEP (SHA-256, MGF1-SHA-256, empty label) under the
//!   server's long-term keypair, with PEM loading and storage
//! - **Symmetric**: AES-128-GCM with an explicit, caller-supplied 12-byte IV
//! - **Key derivation**: 16-byte session keys from a Diffie-Hellman secret
//! - **Randomness**: CSPRNG helpers for IVs, nonces and fresh keys
//!
//! ## Chunked OAEP
//!
//! A single OAEP block carries at most `k - 2*hLen - 2` bytes, which is smaller
//! than a handshake message holding a 1536-bit Diffie-Hellman public value.
//! [`ServerPublicKey::seal`] splits the plaintext into maximal chunks and
//! concatenates the `k`-byte ciphertext blocks; [`ServerKeys::open`] reverses
//! this and rejects any ciphertext that is not a whole number of blocks.
//!
//! ## Security Properties
//!
//! - Session keys are zeroized on drop and never printed by `Debug`
//! - Decryption failures carry no detail (no padding or tag oracle)

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ProtocolError;

// ============================================================================
// Constants
// ============================================================================

/// Length of a symmetric session key (AES-128).
pub const SESSION_KEY_LEN: usize = 16;

/// Length of the explicit IV passed to every symmetric operation.
pub const IV_LEN: usize = 12;

/// Default modulus size for freshly generated server keypairs.
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Length of the client's SHA-384 confirmation hash.
pub const CONFIRMATION_LEN: usize = 48;

/// OAEP overhead with SHA-256: two digest lengths plus two framing bytes.
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

// ============================================================================
// CSPRNG Helpers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoError {
    pub code: Option<u32>,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "CSPRNG unavailable (error code {})", code),
            None => write!(f, "CSPRNG unavailable"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<getrandom::Error> for CryptoError {
    fn from(err: getrandom::Error) -> Self {
        Self { code: Some(err.code().get()) }
    }
}

pub fn random_bytes<const N: usize>() -> std::result::Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes)?;
    Ok(bytes)
}

pub fn random_iv() -> std::result::Result<[u8; IV_LEN], CryptoError> {
    random_bytes::<IV_LEN>()
}

/// Draw a 64-bit message nonce.
pub fn random_nonce() -> std::result::Result<u64, CryptoError> {
    Ok(u64::from_be_bytes(random_bytes::<8>()?))
}

// ============================================================================
// Transcript Hashes
// ============================================================================

/// `SHA-256(gpowbw ‖ S)`: the server's proof that it holds the verifier.
///
/// Both operands must already be fixed-width encodings.
pub fn server_proof(gpowbw: &[u8], secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(gpowbw);
    hasher.update(secret);
    hasher.finalize().into()
}

/// `SHA-384(gpowbw ‖ S)`: the client's proof that it knows the password.
pub fn client_confirmation(gpowbw: &[u8], secret: &[u8]) -> [u8; CONFIRMATION_LEN] {
    let mut hasher = Sha384::new();
    hasher.update(gpowbw);
    hasher.update(secret);
    let mut out = [0u8; CONFIRMATION_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

// ============================================================================
// Symmetric Channel (AES-128-GCM)
// ============================================================================

/// A 16-byte symmetric key shared by a client and the server, or minted
/// fresh for a pair of introduced clients.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> std::result::Result<Self, CryptoError> {
        Ok(Self(random_bytes::<SESSION_KEY_LEN>()?))
    }

    /// Derive the session key from the fixed-width encoding of a DH secret.
    ///
    /// The key is the first 16 bytes of `SHA-256(secret)`.
    pub fn derive(shared_secret: &[u8]) -> Self {
        let digest = Sha256::digest(shared_secret);
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&digest[..SESSION_KEY_LEN]);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    /// Encrypt `plaintext` under this key with the given IV.
    pub fn seal(&self, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let cipher = Aes128Gcm::new((&self.0).into());
        cipher
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|_| ProtocolError::Malformed("plaintext too large"))
    }

    /// Decrypt and authenticate `ciphertext` under this key with the given IV.
    pub fn open(&self, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let cipher = Aes128Gcm::new((&self.0).into());
        cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| ProtocolError::Decryption)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

// ============================================================================
// Asymmetric Channel (RSA-OAEP-SHA256)
// ============================================================================

/// The server's long-term keypair.
#[derive(Clone)]
pub struct ServerKeys {
    private: RsaPrivateKey,
    public: ServerPublicKey,
}

impl ServerKeys {
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .context("failed to generate RSA keypair")?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public = ServerPublicKey { key: RsaPublicKey::from(&private) };
        Self { private, public }
    }

    /// Parse a PEM private key (PKCS#8, falling back to PKCS#1).
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private = match RsaPrivateKey::from_pkcs8_pem(pem) {
            Ok(key) => key,
            Err(_) => RsaPrivateKey::from_pkcs1_pem(pem)
                .context("private key is neither PKCS#8 nor PKCS#1 PEM")?,
        };
        Ok(Self::from_private(private))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read private key {}", path.display()))?;
        Self::from_pem(&pem)
    }

    pub fn to_pem(&self) -> Result<String> {
        let pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .context("failed to encode private key")?;
        Ok(pem.to_string())
    }

    pub fn public(&self) -> &ServerPublicKey {
        &self.public
    }

    /// Decrypt a chunked OAEP ciphertext produced by [`ServerPublicKey::seal`].
    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let block = self.private.size();
        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(ProtocolError::Decryption);
        }

        let mut plaintext = Vec::with_capacity(ciphertext.len());
        for chunk in ciphertext.chunks(block) {
            let part = self
                .private
                .decrypt(Oaep::new::<Sha256>(), chunk)
                .map_err(|_| ProtocolError::Decryption)?;
            plaintext.extend_from_slice(&part);
        }
        Ok(plaintext)
    }
}

impl std::fmt::Debug for ServerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeys")
            .field("bits", &(self.private.size() * 8))
            .finish_non_exhaustive()
    }
}

/// The server's long-term public key, distributed to clients out of band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerPublicKey {
    key: RsaPublicKey,
}

impl ServerPublicKey {
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .context("public key is not SubjectPublicKeyInfo PEM")?;
        Ok(Self { key })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read public key {}", path.display()))?;
        Self::from_pem(&pem)
    }

    pub fn to_pem(&self) -> Result<String> {
        self.key
            .to_public_key_pem(LineEnding::LF)
            .context("failed to encode public key")
    }

    /// Largest plaintext carried by one OAEP block.
    fn chunk_len(&self) -> usize {
        self.key.size().saturating_sub(OAEP_SHA256_OVERHEAD)
    }

    /// Encrypt `plaintext` for the server, splitting it into OAEP blocks.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let chunk_len = self.chunk_len();
        if chunk_len == 0 {
            return Err(ProtocolError::Malformed("server key too small for OAEP-SHA256"));
        }

        let blocks = plaintext.len().div_ceil(chunk_len).max(1);
        let mut ciphertext = Vec::with_capacity(blocks * self.key.size());
        // An empty plaintext still yields one block so the receiver sees a ciphertext.
        let chunks: Vec<&[u8]> = if plaintext.is_empty() {
            vec![plaintext]
        } else {
            plaintext.chunks(chunk_len).collect()
        };
        for chunk in chunks {
            let block = self
                .key
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), chunk)
                .map_err(|_| ProtocolError::Malformed("OAEP encryption failed"))?;
            ciphertext.extend_from_slice(&block);
        }
        Ok(ciphertext)
    }
}

/// Shared 1024-bit keypair for unit tests. Key generation is slow in debug
/// builds, so every test in the crate reuses one.
#[cfg(test)]
pub(crate) fn test_server_keys() -> &'static ServerKeys {
    static KEYS: std::sync::OnceLock<ServerKeys> = std::sync::OnceLock::new();
    KEYS.get_or_init(|| ServerKeys::generate(1024).expect("test keypair"))
}

// ============================================================================
// Tests
// ============================================================================
