//! Test doubles. Enabled by the `test-util` feature.
//!
//! [`FakeCertificates`] stands in for an RSA key pair. Its "certificate"
//! embeds the shared secret, so any party holding the certificate can
//! verify and decrypt, which is fine for exercising framing. Signatures
//! and cipher blocks have real RSA sizes, so padding and block arithmetic
//! behave as they would with real keys.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::certificate::CertificateProvider;
use crate::crypto::{p_sha256, CryptoError};
use crate::policy::SecurityPolicy;

const MAGIC: &[u8; 8] = b"FAKECERT";
const SECRET_LEN: usize = 32;
const CERT_LEN: usize = MAGIC.len() + 2 + SECRET_LEN;

#[derive(Debug, Clone)]
pub struct FakeCertificates {
    certificate: Bytes,
    secret: [u8; SECRET_LEN],
    key_size: usize,
}

impl FakeCertificates {
    /// `key_size` is in bytes: 256 for a 2048-bit key, 512 for 4096-bit.
    pub fn new(id: u8, key_size: usize) -> Self {
        let secret = [id; SECRET_LEN];
        let mut cert = BytesMut::with_capacity(CERT_LEN);
        cert.put_slice(MAGIC);
        cert.put_u16_le(key_size as u16);
        cert.put_slice(&secret);
        Self {
            certificate: cert.freeze(),
            secret,
            key_size,
        }
    }

    fn parse(certificate: &[u8]) -> Result<([u8; SECRET_LEN], usize), CryptoError> {
        if certificate.len() != CERT_LEN || &certificate[..MAGIC.len()] != MAGIC {
            return Err(CryptoError::Certificate("not a fake certificate".to_string()));
        }
        let key_size = u16::from_le_bytes([certificate[8], certificate[9]]) as usize;
        let mut secret = [0u8; SECRET_LEN];
        secret.copy_from_slice(&certificate[10..]);
        Ok((secret, key_size))
    }

    fn keystream(secret: &[u8], block: usize, len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut seed = b"fake-rsa-block".to_vec();
        seed.extend_from_slice(&(block as u64).to_le_bytes());
        p_sha256(secret, &seed, len)
    }
}

impl CertificateProvider for FakeCertificates {
    fn own_certificate(&self) -> Bytes {
        self.certificate.clone()
    }

    fn thumbprint(&self, certificate: &[u8]) -> Bytes {
        Bytes::copy_from_slice(&Sha256::digest(certificate)[..20])
    }

    fn own_key_size(&self) -> usize {
        self.key_size
    }

    fn key_size(&self, certificate: &[u8]) -> Result<usize, CryptoError> {
        Self::parse(certificate).map(|(_, size)| size)
    }

    fn sign(&self, _policy: SecurityPolicy, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        p_sha256(&self.secret, data, self.key_size)
    }

    fn verify(
        &self,
        _policy: SecurityPolicy,
        certificate: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let (secret, key_size) = Self::parse(certificate)?;
        if p_sha256(&secret, data, key_size)? == signature {
            Ok(())
        } else {
            Err(CryptoError::SignatureMismatch)
        }
    }

    fn encrypt(
        &self,
        policy: SecurityPolicy,
        certificate: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let (secret, key_size) = Self::parse(certificate)?;
        let plain_block = self.plain_block_size(policy, key_size);
        if plain_block == 0 || plaintext.len() % plain_block != 0 {
            return Err(CryptoError::Unaligned {
                len: plaintext.len(),
                block_size: plain_block,
            });
        }
        let mut out = Vec::with_capacity(plaintext.len() / plain_block * key_size);
        for (i, block) in plaintext.chunks(plain_block).enumerate() {
            let stream = Self::keystream(&secret, i, plain_block)?;
            out.extend(block.iter().zip(&stream).map(|(b, k)| b ^ k));
            out.resize(out.len() + key_size - plain_block, 0);
        }
        Ok(out)
    }

    fn decrypt(&self, policy: SecurityPolicy, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plain_block = self.plain_block_size(policy, self.key_size);
        if ciphertext.len() % self.key_size != 0 {
            return Err(CryptoError::Unaligned {
                len: ciphertext.len(),
                block_size: self.key_size,
            });
        }
        let mut out = Vec::with_capacity(ciphertext.len() / self.key_size * plain_block);
        for (i, block) in ciphertext.chunks(self.key_size).enumerate() {
            let (body, tail) = block.split_at(plain_block);
            if tail.iter().any(|&b| b != 0) {
                return Err(CryptoError::DecryptionFailed);
            }
            let stream = Self::keystream(&self.secret, i, plain_block)?;
            out.extend(body.iter().zip(&stream).map(|(b, k)| b ^ k));
        }
        Ok(out)
    }
}
