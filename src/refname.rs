//! Reference-name codec (C2): deterministically turns a cleartext
//! reference name into a filesystem- and git-ref-safe ciphertext token,
//! and back. `~N`/`^N` revision suffixes are split off before
//! encryption and reattached after decryption so that ref resolution
//! syntax survives the round trip untouched.

use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};

use crate::cipher::{self, KEY_LEN};

const REF_PREFIX: &str = "refs/heads/";

static ALPHABET: Lazy<base64::alphabet::Alphabet> = Lazy::new(|| {
    // Standard base64 alphabet, but '/' (index 63) is replaced with '#'
    // so the encoded token never introduces a spurious path component
    // when placed under refs/heads/.
    base64::alphabet::Alphabet::new(
        "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+#",
    )
    .expect("64 distinct ASCII characters")
});

fn engine() -> base64::engine::GeneralPurpose {
    base64::engine::GeneralPurpose::new(&ALPHABET, base64::engine::general_purpose::PAD)
}

fn split_suffix(name: &str) -> (&str, &str) {
    match name.find(['~', '^']) {
        Some(idx) => name.split_at(idx),
        None => (name, ""),
    }
}

/// Encrypts a cleartext reference name into `refs/heads/<token><suffix>`.
pub fn encrypt_ref(name: &str, key: &[u8; KEY_LEN]) -> String {
    let (base, suffix) = split_suffix(name);

    let mut payload = Vec::with_capacity(20 + base.len());
    payload.extend_from_slice(&Sha1::digest(base.as_bytes()));
    payload.extend_from_slice(base.as_bytes());

    let ciphertext = cipher::encrypt(&payload, key);
    let token = base64::Engine::encode(&engine(), ciphertext);

    format!("{REF_PREFIX}{token}{suffix}")
}

/// Decrypts a ciphertext ref name (either the bare last path component,
/// or a full `refs/.../<token><suffix>` string) back to its cleartext
/// name, including any `~N`/`^N` suffix. Returns `None` -- "not a
/// managed reference" -- for anything that doesn't decode, pad, or
/// checksum correctly; the caller treats that as a foreign reference,
/// never as an error.
pub fn decrypt_ref(token: &str, key: &[u8; KEY_LEN]) -> Option<String> {
    let tail = token.rsplit('/').next().unwrap_or(token);
    let (encoded, suffix) = split_suffix(tail);

    let ciphertext = base64::Engine::decode(&engine(), encoded).ok()?;
    let payload = cipher::decrypt(&ciphertext, key).ok()?;

    if payload.len() < 20 {
        return None;
    }
    let (want_sha1, base) = payload.split_at(20);
    if Sha1::digest(base).as_slice() != want_sha1 {
        return None;
    }

    let base = std::str::from_utf8(base).ok()?;
    Some(format!("{base}{suffix}"))
}
