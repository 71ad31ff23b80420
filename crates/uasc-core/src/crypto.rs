//! Symmetric cryptographic primitives for secure conversation.
//!
//! Provides four things:
//!   1. HMAC-SHA256 chunk signatures
//!   2. AES-CBC (128 or 256) encryption over whole blocks. The framing layer
//!      pads chunks itself, so no padding is applied here.
//!   3. P_SHA256 key derivation (the TLS 1.2 PRF shape OPC UA uses)
//!   4. Random nonces
//!
//! Derived key material is held in [`SessionKeys`], which zeroizes on drop.
//! There is no unsafe code in this module.

use aes::{Aes128, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// HMAC-SHA256 output size in bytes.
pub const SHA256_SIGNATURE_SIZE: usize = 32;

// ── HMAC-SHA256 ───────────────────────────────────────────────────────────────

fn hmac(key: &[u8]) -> Result<HmacSha256, CryptoError> {
    HmacSha256::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: SHA256_SIGNATURE_SIZE,
        actual: key.len(),
    })
}

/// Sign `data` with HMAC-SHA256, writing the 32-byte MAC into `signature`.
pub fn hmac_sha256_sign(key: &[u8], data: &[u8], signature: &mut [u8]) -> Result<(), CryptoError> {
    if signature.len() != SHA256_SIGNATURE_SIZE {
        return Err(CryptoError::BufferSize {
            expected: SHA256_SIGNATURE_SIZE,
            actual: signature.len(),
        });
    }
    let mut mac = hmac(key)?;
    mac.update(data);
    signature.copy_from_slice(&mac.finalize().into_bytes());
    Ok(())
}

/// Verify an HMAC-SHA256 signature in constant time.
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let mut mac = hmac(key)?;
    mac.update(data);
    mac.verify_slice(signature)
        .map_err(|_| CryptoError::SignatureMismatch)
}

// ── AES-CBC ───────────────────────────────────────────────────────────────────

fn check_aligned(len: usize) -> Result<(), CryptoError> {
    if len % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::Unaligned {
            len,
            block_size: AES_BLOCK_SIZE,
        });
    }
    Ok(())
}

/// Encrypt `data` in place with AES-CBC. The key length selects AES-128 or AES-256.
///
/// `data` must already be a whole number of blocks.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
    check_aligned(data.len())?;
    let len = data.len();
    let result = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidIvLength(iv.len()))?
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map(|_| ()),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidIvLength(iv.len()))?
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map(|_| ()),
        other => {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: other,
            })
        }
    };
    result.map_err(|_| CryptoError::Unaligned {
        len,
        block_size: AES_BLOCK_SIZE,
    })
}

/// Decrypt `data` in place with AES-CBC. No padding is removed.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
    check_aligned(data.len())?;
    let len = data.len();
    let result = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidIvLength(iv.len()))?
            .decrypt_padded_mut::<NoPadding>(data)
            .map(|_| ()),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidIvLength(iv.len()))?
            .decrypt_padded_mut::<NoPadding>(data)
            .map(|_| ()),
        other => {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: other,
            })
        }
    };
    result.map_err(|_| CryptoError::Unaligned {
        len,
        block_size: AES_BLOCK_SIZE,
    })
}

// ── Key Derivation ────────────────────────────────────────────────────────────

/// P_SHA256(secret, seed) truncated to `length` bytes.
///
///   A(0) = seed
///   A(i) = HMAC(secret, A(i-1))
///   out  = HMAC(secret, A(1) || seed) || HMAC(secret, A(2) || seed) || ...
pub fn p_sha256(secret: &[u8], seed: &[u8], length: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(length + SHA256_SIGNATURE_SIZE);
    let mut a = {
        let mut mac = hmac(secret)?;
        mac.update(seed);
        mac.finalize().into_bytes()
    };
    while out.len() < length {
        let mut mac = hmac(secret)?;
        mac.update(&a);
        mac.update(seed);
        out.extend_from_slice(&mac.finalize().into_bytes());

        let mut next = hmac(secret)?;
        next.update(&a);
        a = next.finalize().into_bytes();
    }
    out.truncate(length);
    Ok(out)
}

/// Symmetric keys for one direction of one token: signing key, encrypting key, IV.
///
/// Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    signing_key: Vec<u8>,
    encrypting_key: Vec<u8>,
    iv: Vec<u8>,
}

impl SessionKeys {
    /// Derive keys from a nonce pair, laid out as signing key, encrypting key, IV.
    pub fn derive(
        secret: &[u8],
        seed: &[u8],
        signing_key_length: usize,
        encrypting_key_length: usize,
        block_size: usize,
    ) -> Result<Self, CryptoError> {
        let total = signing_key_length + encrypting_key_length + block_size;
        let mut material = p_sha256(secret, seed, total)?;
        let keys = Self {
            signing_key: material[..signing_key_length].to_vec(),
            encrypting_key: material[signing_key_length..signing_key_length + encrypting_key_length]
                .to_vec(),
            iv: material[signing_key_length + encrypting_key_length..].to_vec(),
        };
        material.zeroize();
        Ok(keys)
    }

    pub fn signing_key(&self) -> &[u8] {
        &self.signing_key
    }

    pub fn encrypting_key(&self) -> &[u8] {
        &self.encrypting_key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("signing_key_len", &self.signing_key.len())
            .field("encrypting_key_len", &self.encrypting_key.len())
            .finish_non_exhaustive()
    }
}

// ── Nonces ────────────────────────────────────────────────────────────────────

/// Generate a cryptographically random nonce of `len` bytes.
pub fn generate_nonce(len: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid IV length {0}")]
    InvalidIvLength(usize),

    #[error("input of {len} bytes is not a multiple of the {block_size}-byte block size")]
    Unaligned { len: usize, block_size: usize },

    #[error("output buffer must be {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("certificate rejected: {0}")]
    Certificate(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
