//! Metadata record (C3): a dedicated root commit, `refs/heads/_` on the
//! encrypted remote, carrying everything needed to bootstrap a fresh
//! clone -- the wrapped symmetric key, the wrapper-commit template, the
//! encrypted default branch name, and the persisted object map.

use std::collections::HashMap;

use anyhow::{Context, Result};
use git2::{FileMode, Oid, Repository};

use crate::cipher::KEY_LEN;
use crate::envelope;
use crate::error::IncryptError;
use crate::keytool;

const VERSION: &[u8] = b"git-incrypt\n1.0.0\n";
const KEY_TAG: &[u8] = b"AES-256-CBC+IV";
const METADATA_REF: &str = "refs/heads/_";
const README: &[u8] = b"This branch is managed by git-incrypt. Do not edit its contents;\n\
they are required to decrypt every other branch in this repository.\n";

const RECORD_LEN: usize = 20 + 20;

/// Everything persisted in the metadata commit, fully decoded.
pub struct MetaData {
    pub key: [u8; KEY_LEN],
    pub template: Vec<u8>,
    pub default_branch: String,
    /// The unfiltered clear_id/crypt_id pairs as currently persisted.
    /// Stale entries (whose crypt_id no longer exists on the remote)
    /// are kept here and only filtered out at read-map time.
    pub records: Vec<(Oid, Oid)>,
}

fn encode_records(records: &[(Oid, Oid)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * RECORD_LEN);
    for (clear, crypt) in records {
        out.extend_from_slice(clear.as_bytes());
        out.extend_from_slice(crypt.as_bytes());
    }
    out
}

fn decode_records(bytes: &[u8]) -> Result<Vec<(Oid, Oid)>> {
    if bytes.len() % RECORD_LEN != 0 {
        anyhow::bail!(IncryptError::CorruptMetadata(format!(
            "object map payload length {} is not a multiple of {RECORD_LEN}",
            bytes.len()
        )));
    }
    bytes
        .chunks_exact(RECORD_LEN)
        .map(|chunk| {
            let clear = Oid::from_bytes(&chunk[..20]).context("decoding clear_id")?;
            let crypt = Oid::from_bytes(&chunk[20..]).context("decoding crypt_id")?;
            Ok((clear, crypt))
        })
        .collect()
}

/// Builds a deterministic commit body: author/committer lines plus the
/// message, canonicalized the way git itself would serialize a commit
/// with no tree/parent lines yet attached. This becomes the fixed
/// envelope every wrapper commit is built on top of.
pub fn build_template(name: &str, email: &str, epoch_seconds: i64, messages: &[String]) -> Vec<u8> {
    let signature = format!("{name} <{email}> {epoch_seconds} +0000");
    let mut buf = format!("author {signature}\ncommitter {signature}\n\n").into_bytes();
    let message = if messages.is_empty() {
        "Initial commit.\n".to_string()
    } else {
        let mut joined = messages.join("\n");
        joined.push('\n');
        joined
    };
    buf.extend_from_slice(message.as_bytes());
    buf
}

/// Builds the metadata commit directly via the odb, the same way a
/// wrapper commit is built: `tree <sha>\n` with no parent lines,
/// followed by the template verbatim as the commit body. This makes
/// the metadata commit's id a pure function of the tree and the
/// template, matching every other commit this crate writes to the ER.
fn write_record_commit(repo: &Repository, template: &[u8], entries: &[(&str, &[u8])]) -> Result<Oid> {
    let mut builder = repo.treebuilder(None)?;
    for (name, content) in entries {
        let blob_id = repo.blob(content)?;
        builder.insert(name, blob_id, FileMode::Blob.into())?;
    }
    let tree_id = builder.write()?;

    let mut buf = format!("tree {tree_id}\n").into_bytes();
    buf.extend_from_slice(template);
    let commit_id = repo.odb()?.write(git2::ObjectType::Commit, &buf)?;

    repo.reference(METADATA_REF, commit_id, true, "update metadata record")?;
    Ok(commit_id)
}

/// Generates a fresh symmetric key, wraps it for `recipients`, and
/// writes the initial metadata commit. Called exactly once, by
/// `git-incrypt init`.
pub fn init(
    repo: &Repository,
    keytool_cmd: &str,
    recipients: &[String],
    template: &[u8],
    default_branch: &str,
) -> Result<MetaData> {
    let mut key = [0u8; KEY_LEN];
    getrandom(&mut key)?;

    let wrapped = keytool::wrap(keytool_cmd, recipients, &key)?;
    let mut key_blob = Vec::with_capacity(KEY_TAG.len() + 1 + wrapped.len());
    key_blob.extend_from_slice(KEY_TAG);
    key_blob.push(0);
    key_blob.extend_from_slice(&wrapped);

    let msg_blob = envelope::seal(template, &key);
    let def_blob = envelope::seal(default_branch.as_bytes(), &key);
    let map_blob = envelope::seal(&[], &key);

    write_record_commit(
        repo,
        template,
        &[
            ("ver", VERSION),
            ("key", &key_blob),
            ("msg", &msg_blob),
            ("def", &def_blob),
            ("map", &map_blob),
            ("README.md", README),
        ],
    )?;

    Ok(MetaData {
        key,
        template: template.to_vec(),
        default_branch: default_branch.to_string(),
        records: Vec::new(),
    })
}

/// Reads and fully decodes the metadata commit. Fails loudly on a
/// version mismatch or corrupt envelope; unwrapping the key is
/// delegated to the external key-management tool, so a missing
/// private key surfaces as `KeyToolFailure` rather than a silent wrong
/// key.
pub fn read(repo: &Repository, keytool_cmd: &str) -> Result<MetaData> {
    let commit = repo
        .find_reference(METADATA_REF)
        .context("metadata record ref refs/heads/_ not found -- not a git-incrypt remote?")?
        .peel_to_commit()?;
    let tree = commit.tree()?;

    let blob = |name: &str| -> Result<Vec<u8>> {
        let entry = tree
            .get_name(name)
            .with_context(|| format!("metadata record missing `{name}` entry"))?;
        Ok(repo.find_blob(entry.id())?.content().to_vec())
    };

    let ver = blob("ver")?;
    if ver != VERSION {
        anyhow::bail!(IncryptError::CorruptMetadata(format!(
            "unsupported metadata version {:?}",
            String::from_utf8_lossy(&ver)
        )));
    }

    let key_blob = blob("key")?;
    let tag_end = key_blob
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| IncryptError::CorruptMetadata("key blob missing tag terminator".into()))?;
    if &key_blob[..tag_end] != KEY_TAG {
        anyhow::bail!(IncryptError::CorruptMetadata(format!(
            "unsupported key wrapping tag {:?}",
            String::from_utf8_lossy(&key_blob[..tag_end])
        )));
    }
    let unwrapped = keytool::unwrap(keytool_cmd, &key_blob[tag_end + 1..])?;
    let key: [u8; KEY_LEN] = unwrapped
        .try_into()
        .map_err(|v: Vec<u8>| IncryptError::CorruptMetadata(format!("unwrapped key is {} bytes, expected {KEY_LEN}", v.len())))?;

    let template = envelope::unseal(&blob("msg")?, &key)?;
    let default_branch = String::from_utf8(envelope::unseal(&blob("def")?, &key)?)
        .context("decrypted default branch name is not valid UTF-8")?;
    let records = decode_records(&envelope::unseal(&blob("map")?, &key)?)?;

    Ok(MetaData {
        key,
        template,
        default_branch,
        records,
    })
}

/// Persists `meta` (whose `records` field already reflects the push
/// in progress) back to the metadata commit.
pub fn write(repo: &Repository, keytool_cmd: &str, recipients: &[String], meta: &MetaData) -> Result<()> {
    // Recipients are only needed to re-wrap the key; reuse the
    // existing wrapped blob when we still have the original
    // ciphertext on hand would be preferable, but recipients can
    // legitimately change across a push (key rotation), so rewrap.
    let wrapped = keytool::wrap(keytool_cmd, recipients, &meta.key)?;
    let mut key_blob = Vec::with_capacity(KEY_TAG.len() + 1 + wrapped.len());
    key_blob.extend_from_slice(KEY_TAG);
    key_blob.push(0);
    key_blob.extend_from_slice(&wrapped);

    let msg_blob = envelope::seal(&meta.template, &meta.key);
    let def_blob = envelope::seal(meta.default_branch.as_bytes(), &meta.key);
    let map_blob = envelope::seal(&encode_records(&meta.records), &meta.key);

    write_record_commit(
        repo,
        &meta.template,
        &[
            ("ver", VERSION),
            ("key", &key_blob),
            ("msg", &msg_blob),
            ("def", &def_blob),
            ("map", &map_blob),
            ("README.md", README),
        ],
    )?;
    Ok(())
}

/// Filters the persisted records against `existence_repo`. With
/// `reverse = false` this is the clear_id -> crypt_id view used while
/// pushing (kept entries are the ones whose crypt_id still exists on
/// the encrypted remote); with `reverse = true` it is the crypt_id ->
/// clear_id view used while fetching (kept entries are the ones whose
/// clear_id still exists in the cleartext repository).
pub fn read_map(existence_repo: &Repository, records: &[(Oid, Oid)], reverse: bool) -> HashMap<Oid, Oid> {
    let mut map = HashMap::with_capacity(records.len());
    for &(clear, crypt) in records {
        let (probe, key, value) = if reverse {
            (clear, crypt, clear)
        } else {
            (crypt, clear, crypt)
        };
        if existence_repo.find_object(probe, None).is_ok() {
            map.insert(key, value);
        }
    }
    map
}

fn getrandom(buf: &mut [u8]) -> Result<()> {
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(buf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bare_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn encode_decode_records_round_trips() {
        let records = vec![
            (Oid::from_bytes(&[1u8; 20]).unwrap(), Oid::from_bytes(&[2u8; 20]).unwrap()),
            (Oid::from_bytes(&[3u8; 20]).unwrap(), Oid::from_bytes(&[4u8; 20]).unwrap()),
        ];
        let encoded = encode_records(&records);
        assert_eq!(decode_records(&encoded).unwrap(), records);
    }

    #[test]
    fn decode_records_rejects_misaligned_length() {
        assert!(decode_records(&[0u8; 39]).is_err());
    }

    #[test]
    fn read_map_filters_entries_by_existence() {
        let (_dir, repo) = bare_repo();
        let blob_id = repo.blob(b"present").unwrap();
        let missing = Oid::from_bytes(&[0xAB; 20]).unwrap();
        let clear = Oid::from_bytes(&[1u8; 20]).unwrap();

        let records = vec![(clear, blob_id), (Oid::from_bytes(&[2u8; 20]).unwrap(), missing)];
        let map = read_map(&repo, &records, false);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&clear), Some(&blob_id));
    }

    #[test]
    fn build_template_includes_messages_and_trailing_newline() {
        let template = build_template("A U Thor", "a@example.com", 0, &["one".into(), "two".into()]);
        let text = String::from_utf8(template).unwrap();
        assert!(text.starts_with("author A U Thor <a@example.com> 0 +0000\n"));
        assert!(text.ends_with("one\ntwo\n"));
    }
}
