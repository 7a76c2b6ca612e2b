//! Wire format for a single wrapped object blob on the encrypted
//! remote: `enc(clear_id(20) ‖ type_byte(1) ‖ raw_body)`, where
//! `raw_body` is the cleartext object's canonical serialization
//! exactly as the object database would emit it (loose-object body,
//! header stripped). Carrying `clear_id` inside the ciphertext lets
//! decryption recompute and verify it after re-hashing the recovered
//! bytes.

use anyhow::{Context, Result};
use git2::{ObjectType, Oid, Repository};

use crate::cipher::{self, KEY_LEN};
use crate::error::IncryptError;

fn type_byte(kind: ObjectType) -> Result<u8> {
    match kind {
        ObjectType::Commit => Ok(1),
        ObjectType::Tree => Ok(2),
        ObjectType::Blob => Ok(3),
        ObjectType::Tag => Ok(4),
        other => Err(IncryptError::UnexpectedType(other).into()),
    }
}

fn byte_type(byte: u8) -> Result<ObjectType> {
    match byte {
        1 => Ok(ObjectType::Commit),
        2 => Ok(ObjectType::Tree),
        3 => Ok(ObjectType::Blob),
        4 => Ok(ObjectType::Tag),
        other => Err(IncryptError::CorruptMetadata(format!("unknown wrapped object type byte {other}")).into()),
    }
}

/// Reads `clear_id` from `cr`'s object database, wraps it, and writes
/// the resulting ciphertext as a new blob in `er`. Returns the new
/// blob's id.
pub fn wrap_object(cr: &Repository, er: &Repository, key: &[u8; KEY_LEN], clear_id: Oid, kind: ObjectType) -> Result<Oid> {
    let odb_object = cr
        .odb()?
        .read(clear_id)
        .with_context(|| format!("reading cleartext object {clear_id}"))?;

    let mut plain = Vec::with_capacity(20 + 1 + odb_object.data().len());
    plain.extend_from_slice(clear_id.as_bytes());
    plain.push(type_byte(kind)?);
    plain.extend_from_slice(odb_object.data());

    let ciphertext = cipher::encrypt(&plain, key);
    Ok(er.blob(&ciphertext)?)
}

/// Decrypts a wrapped blob, verifying that the recovered bytes really
/// hash to the `clear_id` carried inside the ciphertext, and writes
/// the recovered object into `cr`'s object database. Returns
/// `(clear_id, kind)`.
pub fn unwrap_object(cr: &Repository, er: &Repository, key: &[u8; KEY_LEN], wrapped_blob_id: Oid) -> Result<(Oid, ObjectType)> {
    let blob = er.find_blob(wrapped_blob_id)?;
    let plain = cipher::decrypt(blob.content(), key)?;

    if plain.len() < 21 {
        anyhow::bail!(IncryptError::CorruptMetadata(
            "wrapped object payload shorter than its header".to_string()
        ));
    }

    let claimed_id = Oid::from_bytes(&plain[0..20]).context("decoding clear_id from wrapped object")?;
    let kind = byte_type(plain[20])?;
    let raw_body = &plain[21..];

    let written_id = cr.odb()?.write(kind, raw_body)?;
    if written_id != claimed_id {
        anyhow::bail!(IncryptError::CorruptMetadata(format!(
            "wrapped object hashes to {written_id} but claimed {claimed_id}"
        )));
    }

    Ok((written_id, kind))
}

/// Like [`unwrap_object`], but only computes the id the recovered
/// object would have -- it is never written to `cr`'s object
/// database. Used by `list` to report ref tip ids cheaply, without
/// materializing history that `fetch` may never be asked for.
pub fn peek_object(cr: &Repository, er: &Repository, key: &[u8; KEY_LEN], wrapped_blob_id: Oid) -> Result<(Oid, ObjectType)> {
    let blob = er.find_blob(wrapped_blob_id)?;
    let plain = cipher::decrypt(blob.content(), key)?;

    if plain.len() < 21 {
        anyhow::bail!(IncryptError::CorruptMetadata(
            "wrapped object payload shorter than its header".to_string()
        ));
    }

    let claimed_id = Oid::from_bytes(&plain[0..20]).context("decoding clear_id from wrapped object")?;
    let kind = byte_type(plain[20])?;
    let raw_body = &plain[21..];

    let computed_id = cr.odb()?.hash(raw_body, kind)?;
    if computed_id != claimed_id {
        anyhow::bail!(IncryptError::CorruptMetadata(format!(
            "wrapped object hashes to {computed_id} but claimed {claimed_id}"
        )));
    }

    Ok((computed_id, kind))
}
