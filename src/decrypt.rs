//! Decryption walker (C6). Given one or more wrapper-commit tips on
//! the encrypted remote, reconstructs the corresponding cleartext
//! commits/tags in the local object database. Every wrapper's payload
//! tree is self-contained, so unlike encryption this walk never needs
//! a children/readiness structure: a wrapper can always be decoded
//! the moment it is visited, using the commit-map to rewrite its
//! parents.

use std::collections::HashMap;

use anyhow::{Context, Result};
use git2::{ObjectType, Oid, Repository};
use log::debug;

use crate::cipher::KEY_LEN;
use crate::error::IncryptError;
use crate::wrapped;

/// Walks backwards from `wrapper_tips` over wrapper-commit parent
/// links, decrypting every wrapper not already present in
/// `crypt_to_clear`, and returns the cleartext id corresponding to
/// each requested tip, in order. `crypt_to_clear` is extended in
/// place with every newly decrypted mapping.
pub fn decrypt_tips(
    er: &Repository,
    cr: &Repository,
    key: &[u8; KEY_LEN],
    crypt_to_clear: &mut HashMap<Oid, Oid>,
    wrapper_tips: &[Oid],
) -> Result<Vec<Oid>> {
    // Discover every undecrypted wrapper, then process in reverse
    // discovery order so a wrapper's parents are always decrypted
    // (and therefore present in `crypt_to_clear`) before it is.
    let mut order = Vec::new();
    let mut stack: Vec<Oid> = wrapper_tips.to_vec();
    let mut seen = crypt_to_clear.keys().copied().collect::<std::collections::HashSet<_>>();

    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        order.push(id);
        let wrapper = er.find_commit(id).with_context(|| format!("looking up wrapper commit {id}"))?;
        for parent in wrapper.parent_ids() {
            if !crypt_to_clear.contains_key(&parent) {
                stack.push(parent);
            }
        }
    }

    for wrapper_id in order.into_iter().rev() {
        if crypt_to_clear.contains_key(&wrapper_id) {
            continue;
        }
        let clear_id = decrypt_one(er, cr, key, crypt_to_clear, wrapper_id)?;
        debug!("decrypted {wrapper_id} -> {clear_id}");
        crypt_to_clear.insert(wrapper_id, clear_id);
    }

    wrapper_tips
        .iter()
        .map(|tip| crypt_to_clear.get(tip).copied().context("tip was not decrypted"))
        .collect()
}

/// Reports the cleartext id a wrapper commit's root object would have,
/// without writing anything to `cr`. Used to answer `list` cheaply.
pub fn peek_tip(er: &Repository, cr: &Repository, key: &[u8; KEY_LEN], wrapper_id: Oid) -> Result<Oid> {
    let wrapper = er.find_commit(wrapper_id)?;
    let payload_tree = wrapper.tree()?;
    let last_entry = payload_tree
        .iter()
        .last()
        .ok_or_else(|| IncryptError::CorruptMetadata(format!("wrapper commit {wrapper_id} has an empty payload tree")))?;
    let (clear_id, _kind) = wrapped::peek_object(cr, er, key, last_entry.id())?;
    Ok(clear_id)
}

fn decrypt_one(
    er: &Repository,
    cr: &Repository,
    key: &[u8; KEY_LEN],
    crypt_to_clear: &HashMap<Oid, Oid>,
    wrapper_id: Oid,
) -> Result<Oid> {
    let wrapper = er.find_commit(wrapper_id)?;
    let payload_tree = wrapper.tree()?;

    let mut last_clear_id = None;
    let mut last_kind = None;
    for entry in payload_tree.iter() {
        let (clear_id, kind) = wrapped::unwrap_object(cr, er, key, entry.id())
            .with_context(|| format!("unwrapping payload entry {:?} of wrapper {wrapper_id}", entry.name()))?;
        last_clear_id = Some(clear_id);
        last_kind = Some(kind);
    }

    let (root_clear_id, root_kind) = match (last_clear_id, last_kind) {
        (Some(id), Some(kind)) => (id, kind),
        _ => anyhow::bail!(IncryptError::CorruptMetadata(format!(
            "wrapper commit {wrapper_id} has an empty payload tree"
        ))),
    };

    match root_kind {
        ObjectType::Commit => rewrite_commit_parents(cr, root_clear_id, crypt_to_clear),
        ObjectType::Tag => Ok(root_clear_id),
        other => Err(IncryptError::UnexpectedType(other).into()),
    }
}

/// The commit object recovered from the payload tree still has its
/// original cleartext parent ids -- which is exactly what we want,
/// since those parents were decrypted (and written under the same
/// ids) in an earlier step of this same walk or a previous fetch.
/// Nothing to rewrite; this function exists to make that invariant
/// explicit and to fail loudly if it's ever violated.
fn rewrite_commit_parents(cr: &Repository, clear_commit_id: Oid, crypt_to_clear: &HashMap<Oid, Oid>) -> Result<Oid> {
    let commit = cr
        .find_commit(clear_commit_id)
        .with_context(|| format!("recovered commit {clear_commit_id} missing after unwrap"))?;

    for parent_id in commit.parent_ids() {
        if cr.find_commit(parent_id).is_err() && !crypt_to_clear.values().any(|&c| c == parent_id) {
            anyhow::bail!(IncryptError::CorruptMetadata(format!(
                "commit {clear_commit_id} has parent {parent_id} that was never decrypted"
            )));
        }
    }

    Ok(clear_commit_id)
}
