//! Optional authenticated encryption of the payload (AES-GCM).
//!
//! Sealed layout: `nonce (12) || ciphertext || tag (16)`. A fresh random nonce is
//! drawn for every message. The frame body of an encrypted message is
//! `padding length (1) || random padding || sealed`. The length byte is always
//! present; it is zero when padding is disabled.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use rand::{Rng, RngCore};

use crate::error::CipherError;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Bytes added to a payload by [`CipherCodec::seal`].
pub const CIPHER_OVERHEAD: usize = NONCE_LEN + TAG_LEN;
/// Largest random padding drawn by [`CipherCodec::seal_padded`].
pub const MAX_PADDING: usize = 32;
/// Fixed bytes added by [`CipherCodec::seal_padded`] on top of the padding.
pub const PADDED_OVERHEAD: usize = 1 + CIPHER_OVERHEAD;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Accepted key sizes in bytes (AES-128, AES-192, AES-256).
pub const KEY_SIZES: [usize; 3] = [16, 24, 32];

/// A 128-, 192- or 256-bit AES key. Never serialized and redacted from `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey(Vec<u8>);

impl CipherKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CipherError> {
        if KEY_SIZES.contains(&bytes.len()) {
            Ok(Self(bytes))
        } else {
            Err(CipherError::InvalidKeyLength(bytes.len()))
        }
    }

    /// Draw a random key of `len` bytes (16, 24 or 32).
    pub fn generate(len: usize) -> Result<Self, CipherError> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bits(&self) -> usize {
        self.0.len() * 8
    }
}

impl TryFrom<&[u8]> for CipherKey {
    type Error = CipherError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::new(bytes.to_vec())
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CipherKey(<{} bits>)", self.bits())
    }
}

fn seal_with<C: KeyInit + Aead>(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    C::new_from_slice(key)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?
        .encrypt(GenericArray::<u8, <C as AeadCore>::NonceSize>::from_slice(nonce), plaintext)
        .map_err(|_| CipherError::EncryptionFailed)
}

fn open_with<C: KeyInit + Aead>(key: &[u8], nonce: &[u8], body: &[u8]) -> Result<Vec<u8>, CipherError> {
    C::new_from_slice(key)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?
        .decrypt(GenericArray::<u8, <C as AeadCore>::NonceSize>::from_slice(nonce), body)
        .map_err(|_| CipherError::TagMismatch)
}

pub struct CipherCodec;

impl CipherCodec {
    pub fn seal(key: &CipherKey, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = match key.0.len() {
            16 => seal_with::<Aes128Gcm>(&key.0, &nonce, plaintext)?,
            24 => seal_with::<Aes192Gcm>(&key.0, &nonce, plaintext)?,
            _ => seal_with::<Aes256Gcm>(&key.0, &nonce, plaintext)?,
        };

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn open(key: &CipherKey, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < CIPHER_OVERHEAD {
            return Err(CipherError::Truncated);
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);

        match key.0.len() {
            16 => open_with::<Aes128Gcm>(&key.0, nonce, body),
            24 => open_with::<Aes192Gcm>(&key.0, nonce, body),
            _ => open_with::<Aes256Gcm>(&key.0, nonce, body),
        }
    }

    /// Seal `plaintext` behind a length byte and `padding` random bytes.
    pub fn seal_padded(key: &CipherKey, plaintext: &[u8], padding: usize) -> Result<Vec<u8>, CipherError> {
        let padding = padding.min(MAX_PADDING);
        let sealed = Self::seal(key, plaintext)?;

        let mut out = vec![0u8; 1 + padding];
        out[0] = padding as u8;
        rand::thread_rng().fill_bytes(&mut out[1..]);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Random padding length in `1..=MAX_PADDING`.
    pub fn random_padding() -> usize {
        rand::thread_rng().gen_range(1..=MAX_PADDING)
    }

    /// Strip the padding written by [`CipherCodec::seal_padded`] and open the rest.
    pub fn open_padded(key: &CipherKey, body: &[u8]) -> Result<Vec<u8>, CipherError> {
        let (&padding, rest) = body.split_first().ok_or(CipherError::Truncated)?;
        let padding = padding as usize;
        if padding > MAX_PADDING || padding > rest.len() {
            return Err(CipherError::BadPadding(padding));
        }
        Self::open(key, &rest[padding..])
    }
}
