//! Block cipher objects
//!
//! A `BlockCipher` is an AEAD cipher plus the context it was derived
//! for. Server candidate lists tag each cipher with the owning user
//! name so a successful authentication identifies the user.

use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::{Error, Result};

use super::NONCE_SIZE;

/// Cipher types supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    ChaCha20Poly1305,
    Aes128Gcm,
    Aes256Gcm,
}

impl CipherKind {
    /// Key length this cipher expects, in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// Stable name used in key derivation info strings
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::ChaCha20Poly1305 => "chacha20-poly1305",
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
        }
    }
}

/// Identity attached to a cipher in a server candidate list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockContext {
    pub user_name: String,
}

enum CipherInner {
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
}

/// AEAD block cipher with an optional user context.
pub struct BlockCipher {
    kind: CipherKind,
    inner: CipherInner,
    context: BlockContext,
}

impl BlockCipher {
    /// Build a cipher of `kind` from raw key material.
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self> {
        check_key(kind, key)?;
        let inner = match kind {
            CipherKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map(|cipher| CipherInner::ChaCha20Poly1305(Box::new(cipher))),
            CipherKind::Aes128Gcm => Aes128Gcm::new_from_slice(key)
                .map(|cipher| CipherInner::Aes128Gcm(Box::new(cipher))),
            CipherKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map(|cipher| CipherInner::Aes256Gcm(Box::new(cipher))),
        }
        .map_err(|e| Error::Crypto(format!("{} init rejected the key: {}", kind.name(), e)))?;

        Ok(Self {
            kind,
            inner,
            context: BlockContext::default(),
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Attach the owning user's identity.
    pub fn set_block_context(&mut self, context: BlockContext) {
        self.context = context;
    }

    pub fn block_context(&self) -> &BlockContext {
        &self.context
    }

    /// Encrypt plaintext with associated data
    pub fn encrypt(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        check_nonce(nonce)?;
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.encrypt(nonce, payload),
            CipherInner::Aes128Gcm(cipher) => cipher.encrypt(nonce, payload),
            CipherInner::Aes256Gcm(cipher) => cipher.encrypt(nonce, payload),
        };
        result.map_err(|e| Error::Crypto(format!("{} seal failed: {}", self.kind.name(), e)))
    }

    /// Decrypt ciphertext with associated data
    pub fn decrypt(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        check_nonce(nonce)?;
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.decrypt(nonce, payload),
            CipherInner::Aes128Gcm(cipher) => cipher.decrypt(nonce, payload),
            CipherInner::Aes256Gcm(cipher) => cipher.decrypt(nonce, payload),
        };
        result.map_err(|e| Error::Crypto(format!("{} open failed: {}", self.kind.name(), e)))
    }
}

fn check_key(kind: CipherKind, key: &[u8]) -> Result<()> {
    if key.len() != kind.key_size() {
        return Err(Error::Crypto(format!(
            "{} needs a {}-byte key, got {} bytes",
            kind.name(),
            kind.key_size(),
            key.len()
        )));
    }
    Ok(())
}

fn check_nonce(nonce: &[u8]) -> Result<()> {
    if nonce.len() != NONCE_SIZE {
        return Err(Error::Crypto(format!(
            "nonce must be {} bytes, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }
    Ok(())
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher")
            .field("kind", &self.kind)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
