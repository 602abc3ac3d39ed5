use std::io;
use std::path::Path;

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::{info, warn};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid key material")]
    InvalidKey,
}

/// Symmetric at-rest encryption for the chat document and uploaded media.
///
/// The key lives in a hex-encoded secret file next to the data; the stored
/// forms are `hex(iv):hex(ciphertext)` for strings and `iv || ciphertext`
/// for raw files, with a fresh random 16-byte IV per call.
pub struct StorageCrypto {
    key: [u8; KEY_LEN],
}

impl StorageCrypto {
    /// Loads the key from `path`, or generates and persists a new one when
    /// the file is missing or does not hold 32 valid hex-encoded bytes.
    pub fn load_or_generate(path: &Path) -> io::Result<Self> {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(bytes) = hex::decode(raw.trim()) {
                if bytes.len() == KEY_LEN {
                    let mut key = [0u8; KEY_LEN];
                    key.copy_from_slice(&bytes);
                    return Ok(StorageCrypto { key });
                }
                warn!(
                    "secret file {} holds {} bytes, expected {KEY_LEN}; regenerating",
                    path.display(),
                    bytes.len()
                );
            } else {
                warn!("secret file {} is not valid hex; regenerating", path.display());
            }
        }

        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(key))?;
        info!("generated new encryption key at {}", path.display());
        Ok(StorageCrypto { key })
    }

    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        StorageCrypto { key }
    }

    /// Encrypts to the delimited hex form used for the persisted document.
    pub fn encrypt_str(&self, plaintext: &str) -> String {
        let (iv, ciphertext) = self.encrypt_raw(plaintext.as_bytes());
        format!("{}:{}", hex::encode(iv), hex::encode(ciphertext))
    }

    pub fn decrypt_str(&self, payload: &str) -> Result<String, CryptoError> {
        let (iv_hex, body_hex) = payload.split_once(':').ok_or(CryptoError::Decrypt)?;
        let iv = hex::decode(iv_hex.trim()).map_err(|_| CryptoError::Decrypt)?;
        let ciphertext = hex::decode(body_hex.trim()).map_err(|_| CryptoError::Decrypt)?;
        let plaintext = self.decrypt_raw(&iv, &ciphertext)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
    }

    /// Encrypts to the `iv || ciphertext` byte form used for stored media.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Vec<u8> {
        let (iv, ciphertext) = self.encrypt_raw(plaintext);
        let mut combined = iv.to_vec();
        combined.extend(ciphertext);
        combined
    }

    pub fn decrypt_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < IV_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (iv, ciphertext) = data.split_at(IV_LEN);
        self.decrypt_raw(iv, ciphertext)
    }

    fn encrypt_raw(&self, plaintext: &[u8]) -> ([u8; IV_LEN], Vec<u8>) {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        // new_from_slices only fails on length mismatch; both are fixed here
        let ciphertext = match Aes256CbcEnc::new_from_slices(&self.key, &iv) {
            Ok(cipher) => cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            Err(_) => Vec::new(),
        };
        (iv, ciphertext)
    }

    fn decrypt_raw(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher =
            Aes256CbcDec::new_from_slices(&self.key, iv).map_err(|_| CryptoError::Decrypt)?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}
