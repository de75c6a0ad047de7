use std::path::Path;

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key size (expected {KEY_SIZE} bytes for AES-256)")]
    InvalidKeySize,
    #[error("encrypted data too short (missing IV)")]
    TruncatedData,
    #[error("no ciphertext after IV")]
    EmptyCiphertext,
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptFailed,
    #[error("encryption I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// 256-bit key from the OS secure RNG.
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// AES-256-CBC with PKCS#7 padding. Output layout: `[16-byte IV][ciphertext]`.
pub fn encrypt_data(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeySize);
    }

    let iv = generate_iv();
    let cipher = Aes256CbcEnc::new_from_slices(key, &iv).map_err(|_| CryptoError::InvalidKeySize)?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt_data`]; validates the IV prefix and padding.
pub fn decrypt_data(blob: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeySize);
    }
    if blob.len() < IV_SIZE {
        return Err(CryptoError::TruncatedData);
    }

    let (iv, ciphertext) = blob.split_at(IV_SIZE);
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeySize)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

pub fn encrypt_file(input: &Path, output: &Path, key: &[u8]) -> Result<(), CryptoError> {
    let plaintext = std::fs::read(input)?;
    let blob = encrypt_data(&plaintext, key)?;
    std::fs::write(output, blob)?;
    Ok(())
}

pub fn decrypt_file(input: &Path, output: &Path, key: &[u8]) -> Result<(), CryptoError> {
    let blob = std::fs::read(input)?;
    let plaintext = decrypt_data(&blob, key)?;
    std::fs::write(output, plaintext)?;
    Ok(())
}
