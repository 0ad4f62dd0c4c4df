//! AES-256-GCM-SIV key wrapping.
//!
//! AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant: an accidental nonce
//! collision leaks only equality of wrapped keys, never the KEK.

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Byte length of an AES-256 KEK (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Prefix that appears at the start of every wrapped DEK.
pub const VERSION_PREFIX: &str = "v1";

/// Errors produced by the codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The KEK is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid KEK length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// AEAD sealing failed, or opening failed authentication (wrong KEK,
    /// wrong key ID, or tampered ciphertext).
    #[error("aead operation failed")]
    AeadFailure,

    /// The wrapped value does not match `v1.<nonce>.<ciphertext>`.
    #[error("invalid wrapped key format")]
    InvalidFormat,
}

/// A 256-bit key-encryption key held in memory.
///
/// Zeroed on drop; never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KekBytes(Box<[u8; KEY_LEN]>);

impl KekBytes {
    /// Copy `bytes` into a new KEK.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidKeyLength`] unless `bytes` is [`KEY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != KEY_LEN {
            return Err(CodecError::InvalidKeyLength(bytes.len()));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Debug for KekBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KekBytes([REDACTED])")
    }
}

/// A DEK sealed under a KEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedDek {
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext followed by the 16-byte authentication tag.
    pub ciphertext: Vec<u8>,
}

impl WrappedDek {
    /// Encode to the canonical `v1.<nonce>.<ciphertext>` form.
    pub fn to_string_repr(&self) -> String {
        format!(
            "{}.{}.{}",
            VERSION_PREFIX,
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
        )
    }

    /// Parse the canonical form back into a [`WrappedDek`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidFormat`] on any structural mismatch.
    pub fn parse(s: &str) -> Result<Self, CodecError> {
        let mut parts = s.splitn(3, '.');
        let (Some(version), Some(nonce_b64), Some(ct_b64)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CodecError::InvalidFormat);
        };
        if version != VERSION_PREFIX {
            return Err(CodecError::InvalidFormat);
        }

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|_| CodecError::InvalidFormat)?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| CodecError::InvalidFormat)?;

        let ciphertext = URL_SAFE_NO_PAD
            .decode(ct_b64)
            .map_err(|_| CodecError::InvalidFormat)?;
        if ciphertext.is_empty() {
            return Err(CodecError::InvalidFormat);
        }

        Ok(Self { nonce, ciphertext })
    }
}

/// Wraps and unwraps DEKs under a locally held KEK.
pub struct KeyWrapCodec {
    cipher: Aes256GcmSiv,
}

impl KeyWrapCodec {
    /// Build a codec for `kek`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidKeyLength`] if the cipher rejects the key.
    pub fn new(kek: &KekBytes) -> Result<Self, CodecError> {
        let cipher = Aes256GcmSiv::new_from_slice(kek.as_bytes())
            .map_err(|_| CodecError::InvalidKeyLength(kek.as_bytes().len()))?;
        Ok(Self { cipher })
    }

    /// Seal `dek` with a fresh random nonce, binding `key_id` as associated data.
    pub fn wrap(&self, key_id: &str, dek: &[u8]) -> Result<WrappedDek, CodecError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: dek,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| CodecError::AeadFailure)?;

        Ok(WrappedDek { nonce, ciphertext })
    }

    /// Open `wrapped`, which must have been sealed for the same `key_id`.
    pub fn unwrap(&self, key_id: &str, wrapped: &WrappedDek) -> Result<Zeroizing<Vec<u8>>, CodecError> {
        self.cipher
            .decrypt(
                Nonce::from_slice(&wrapped.nonce),
                Payload {
                    msg: &wrapped.ciphertext,
                    aad: key_id.as_bytes(),
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| CodecError::AeadFailure)
    }
}

/// Fill a new buffer of `len` bytes from the OS CSPRNG.
pub fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut buf = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> KeyWrapCodec {
        let kek = KekBytes::from_slice(&random_bytes(KEY_LEN)).unwrap();
        KeyWrapCodec::new(&kek).unwrap()
    }

    #[test]
    fn wrap_unwrap_recovers_dek() {
        let codec = codec();
        let dek = random_bytes(64);
        let wrapped = codec.wrap("disk-a", &dek).unwrap();
        assert_eq!(*codec.unwrap("disk-a", &wrapped).unwrap(), *dek);
    }

    #[test]
    fn wrong_kek_fails() {
        let wrapped = codec().wrap("disk-a", b"secret").unwrap();
        assert!(matches!(
            codec().unwrap("disk-a", &wrapped),
            Err(CodecError::AeadFailure)
        ));
    }

    #[test]
    fn key_id_is_bound() {
        let codec = codec();
        let wrapped = codec.wrap("disk-a", b"secret").unwrap();
        assert!(codec.unwrap("disk-b", &wrapped).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let codec = codec();
        let mut wrapped = codec.wrap("disk-a", b"tamper me").unwrap();
        wrapped.ciphertext[0] ^= 0xFF;
        assert!(codec.unwrap("disk-a", &wrapped).is_err());
    }

    #[test]
    fn kek_length_is_checked() {
        assert!(matches!(
            KekBytes::from_slice(&[0u8; 16]),
            Err(CodecError::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn string_repr_parses_back() {
        let wrapped = codec().wrap("disk-a", b"hello").unwrap();
        let s = wrapped.to_string_repr();
        assert!(s.starts_with("v1."));
        assert_eq!(WrappedDek::parse(&s).unwrap(), wrapped);
    }

    #[test]
    fn parse_rejects_malformed_values() {
        for bad in ["v2.AAAAAAAAAAAAAAAA.abc", "v1.abc", "v1.!!!.abc", "v1.AAAA.abc", ""] {
            assert!(WrappedDek::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn kek_redacted_in_debug() {
        let kek = KekBytes::from_slice(&[0xFF; KEY_LEN]).unwrap();
        assert!(format!("{kek:?}").contains("REDACTED"));
    }
}
