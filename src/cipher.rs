//! Symmetric codec (C1): AES-256-CBC with PKCS#7 padding over a fixed
//! 48-byte key layout (`key[0..32]` = AES key, `key[32..48]` = IV).
//!
//! The IV is fixed per repository rather than randomized so that
//! encrypting the same cleartext twice produces byte-identical
//! ciphertext -- incremental pushes and deterministic wrapper-commit
//! ids both depend on that property. No authentication tag is added;
//! every plaintext payload this codec wraps carries its own SHA-1
//! integrity prefix instead (see `refname` and `envelope`).

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::IncryptError;

pub const KEY_LEN: usize = 48;
const BLOCK_LEN: usize = 16;

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

fn split_key(key: &[u8; KEY_LEN]) -> (&[u8], &[u8]) {
    key.split_at(32)
}

pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Vec<u8> {
    let (aes_key, iv) = split_key(key);
    let encryptor =
        Encryptor::new_from_slices(aes_key, iv).expect("key/iv are fixed-size and valid");
    encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn decrypt(ciphertext: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, IncryptError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(IncryptError::CorruptCipher(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            ciphertext.len()
        )));
    }

    let (aes_key, iv) = split_key(key);
    let decryptor =
        Decryptor::new_from_slices(aes_key, iv).expect("key/iv are fixed-size and valid");
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| IncryptError::CorruptCipher(format!("padding error: {e}")))
}
