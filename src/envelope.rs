//! Small helper shared by every metadata blob (`msg`, `def`, `map`):
//! each one is stored on the remote as `enc(sha1(payload) ‖ payload)`,
//! so corruption or a wrong key is caught on read instead of silently
//! producing garbage.

use sha1::{Digest, Sha1};

use crate::cipher::{self, KEY_LEN};
use crate::error::IncryptError;

pub fn seal(payload: &[u8], key: &[u8; KEY_LEN]) -> Vec<u8> {
    let mut plain = Vec::with_capacity(20 + payload.len());
    plain.extend_from_slice(&Sha1::digest(payload));
    plain.extend_from_slice(payload);
    cipher::encrypt(&plain, key)
}

pub fn unseal(sealed: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, IncryptError> {
    let plain = cipher::decrypt(sealed, key)?;
    if plain.len() < 20 {
        return Err(IncryptError::CorruptMetadata(
            "sealed payload shorter than its SHA-1 prefix".to_string(),
        ));
    }
    let (want, payload) = plain.split_at(20);
    if Sha1::digest(payload).as_slice() != want {
        return Err(IncryptError::CorruptMetadata(
            "SHA-1 prefix mismatch".to_string(),
        ));
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_empty_and_nonempty_payloads() {
        let key = [9u8; KEY_LEN];
        for payload in [b"".as_slice(), b"refs/heads/main"] {
            let sealed = seal(payload, &key);
            assert_eq!(unseal(&sealed, &key).expect("unseal"), payload);
        }
    }

    #[test]
    fn rejects_corrupted_prefix() {
        let key = [9u8; KEY_LEN];
        let mut sealed = seal(b"refs/heads/main", &key);
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(unseal(&sealed, &key).is_err());
    }
}
