//! Cipher material for underlay authentication
//!
//! Every underlay carries a block cipher derived from a shared
//! password. Clients derive one cipher for the transport they dial;
//! servers derive a candidate list per user and authenticate incoming
//! carriers against the union of all candidates.

mod block;

pub use block::{BlockCipher, BlockContext, CipherKind};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Nonce size for AEAD ciphers (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Tag size for AEAD ciphers (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Domain separation salt for key derivation.
const KEY_SALT: &[u8] = b"velum-block-cipher-v1";

/// Generate a random nonce
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    use rand::RngCore;
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Stretch `secret` into `key_len` bytes of key material with
/// HKDF-SHA256.
pub fn derive_key(secret: &[u8], salt: &[u8], info: &[u8], key_len: usize) -> Result<Vec<u8>> {
    use hkdf::Hkdf;

    let mut key = vec![0u8; key_len];
    Hkdf::<Sha256>::new(Some(salt), secret)
        .expand(info, &mut key)
        .map_err(|e| Error::Crypto(format!("cannot expand {} key bytes: {}", key_len, e)))?;
    Ok(key)
}

/// Hash a plaintext password with the user name as salt.
///
/// Produces the stored-password form used by the server user table
/// when only a plaintext password is configured.
pub fn hash_password(password: &[u8], username: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(username);
    hasher.update([0u8]);
    hasher.update(password);
    hasher.finalize().into()
}

fn derivation_info(kind: CipherKind, datagram: bool) -> Vec<u8> {
    let transport: &[u8] = if datagram { b"datagram" } else { b"stream" };
    let mut info = Vec::with_capacity(transport.len() + 16);
    info.extend_from_slice(transport);
    info.push(b'/');
    info.extend_from_slice(kind.name().as_bytes());
    info
}

/// Derive the block cipher a client uses for a new underlay.
///
/// The derivation is transport-specific: stream and datagram carriers
/// never share key material.
pub fn block_cipher_from_password(password: &[u8], datagram: bool) -> Result<BlockCipher> {
    if password.is_empty() {
        return Err(Error::Crypto("empty password".to_string()));
    }
    let kind = CipherKind::Aes256Gcm;
    let key = derive_key(password, KEY_SALT, &derivation_info(kind, datagram), kind.key_size())?;
    BlockCipher::new(kind, &key)
}

/// Derive the full candidate list for one password.
///
/// One candidate per supported cipher kind; the list is a pure
/// function of the password and the transport flag.
pub fn block_cipher_list_from_password(password: &[u8], datagram: bool) -> Result<Vec<BlockCipher>> {
    if password.is_empty() {
        return Err(Error::Crypto("empty password".to_string()));
    }
    let kinds = [
        CipherKind::Aes256Gcm,
        CipherKind::Aes128Gcm,
        CipherKind::ChaCha20Poly1305,
    ];
    let mut blocks = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let key = derive_key(password, KEY_SALT, &derivation_info(kind, datagram), kind.key_size())?;
        blocks.push(BlockCipher::new(kind, &key)?);
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_password_is_salted() {
        let a = hash_password(b"secret", b"alice");
        let b = hash_password(b"secret", b"bob");
        assert_ne!(a, b);
        assert_eq!(a, hash_password(b"secret", b"alice"));
    }

    #[test]
    fn test_block_cipher_transport_separation() {
        let password = [0x5au8; 16];
        let stream = block_cipher_from_password(&password, false).unwrap();
        let datagram = block_cipher_from_password(&password, true).unwrap();

        let nonce = random_nonce();
        let sealed = stream.encrypt(&nonce, b"probe", &[]).unwrap();
        assert!(datagram.decrypt(&nonce, &sealed, &[]).is_err());
        assert_eq!(stream.decrypt(&nonce, &sealed, &[]).unwrap(), b"probe");
    }

    #[test]
    fn test_candidate_list_is_deterministic() {
        let password = [7u8; 16];
        let a = block_cipher_list_from_password(&password, false).unwrap();
        let b = block_cipher_list_from_password(&password, false).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.kind(), y.kind());
            let nonce = [3u8; NONCE_SIZE];
            let sealed = x.encrypt(&nonce, b"same key", &[]).unwrap();
            assert_eq!(y.decrypt(&nonce, &sealed, &[]).unwrap(), b"same key");
        }
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(block_cipher_from_password(&[], false).is_err());
        assert!(block_cipher_list_from_password(&[], true).is_err());
    }
}
