//! Asymmetric operations behind OpenSecureChannel.
//!
//! Certificate parsing, trust and the RSA primitives live outside this
//! crate. The channel only needs the operations below, supplied by whoever
//! owns the application instance certificate.

use bytes::Bytes;

use crate::crypto::CryptoError;
use crate::policy::SecurityPolicy;

/// Holder of the local certificate and private key.
///
/// All sizes are in bytes. A signature made with a key is exactly the key
/// size long, and one cipher block is exactly the key size long.
pub trait CertificateProvider: Send + Sync {
    /// Our DER-encoded certificate, sent as the sender certificate.
    fn own_certificate(&self) -> Bytes;

    /// Thumbprint of a DER certificate, as carried in the asymmetric header.
    fn thumbprint(&self, certificate: &[u8]) -> Bytes;

    /// Size of our private key.
    fn own_key_size(&self) -> usize;

    /// Size of the public key in `certificate`.
    fn key_size(&self, certificate: &[u8]) -> Result<usize, CryptoError>;

    /// Sign `data` with our private key.
    fn sign(&self, policy: SecurityPolicy, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verify a signature made with the private key behind `certificate`.
    fn verify(
        &self,
        policy: SecurityPolicy,
        certificate: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError>;

    /// Encrypt for the holder of `certificate`. `plaintext` is a whole number
    /// of plain blocks and the result a whole number of cipher blocks.
    fn encrypt(
        &self,
        policy: SecurityPolicy,
        certificate: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt with our private key.
    fn decrypt(&self, policy: SecurityPolicy, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn own_thumbprint(&self) -> Bytes {
        self.thumbprint(&self.own_certificate())
    }

    /// Plaintext bytes per cipher block for a `key_size`-byte key.
    fn plain_block_size(&self, policy: SecurityPolicy, key_size: usize) -> usize {
        policy.asymmetric_plain_block_size(key_size)
    }
}
