//! Encryption walker (C5). Given a set of cleartext tips to push,
//! discovers every commit/tag reachable from them that isn't already
//! in the object map, then wraps the graph bottom-up: each wrapper
//! commit's payload tree is self-contained, carrying every sub-tree
//! and blob needed to reconstruct its cleartext commit independently
//! of any other wrapper.

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, Result};
use git2::{FileMode, ObjectType, Oid, Repository};
use log::debug;

use crate::cipher::KEY_LEN;
use crate::error::IncryptError;
use crate::objectmap::ObjectMap;
use crate::wrapped;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
}

/// Returns every parent (commit) or target (tag) of `id`, along with
/// its kind. Fails if `id` is a tree or blob -- those may only appear
/// as commit/tag history, never as a push tip or a parent.
fn parents_of(cr: &Repository, id: Oid) -> Result<(ObjectType, Vec<Oid>)> {
    let kind = cr
        .find_object(id, None)
        .with_context(|| format!("looking up {id}"))?
        .kind()
        .ok_or_else(|| IncryptError::UnexpectedType(ObjectType::Any))?;

    match kind {
        ObjectType::Commit => {
            let commit = cr.find_commit(id)?;
            Ok((kind, commit.parent_ids().collect()))
        }
        ObjectType::Tag => {
            let tag = cr.find_tag(id)?;
            Ok((kind, vec![tag.target_id()]))
        }
        other => Err(IncryptError::UnexpectedType(other).into()),
    }
}

/// Discovers every object between `tips` and objects already present
/// in `map`, classifying each as immediately `Ready` (all its parents
/// are already mapped) or `Pending` (still waiting on at least one).
/// `children` records, for every discovered parent, which of its
/// children are waiting on it -- the adjacency the topological walk
/// advances along.
fn discover(
    cr: &Repository,
    map: &ObjectMap,
    tips: &[Oid],
) -> Result<(HashMap<Oid, Readiness>, HashMap<Oid, Vec<Oid>>)> {
    let mut state: HashMap<Oid, Readiness> = HashMap::new();
    let mut children: HashMap<Oid, Vec<Oid>> = HashMap::new();
    let mut stack: Vec<Oid> = tips.to_vec();

    while let Some(id) = stack.pop() {
        if map.get(&id).is_some() || state.contains_key(&id) {
            continue;
        }

        let (_kind, parents) = parents_of(cr, id)?;

        let mut complete = true;
        for parent in &parents {
            children.entry(*parent).or_default().push(id);
            if map.get(parent).is_none() {
                complete = false;
                if !state.contains_key(parent) {
                    stack.push(*parent);
                }
            }
        }

        state.insert(id, if complete { Readiness::Ready } else { Readiness::Pending });
    }

    Ok((state, children))
}

fn tree_entries(cr: &Repository, tree_id: Oid) -> Result<Vec<(Oid, ObjectType)>> {
    let tree = cr.find_tree(tree_id)?;
    let mut out = Vec::with_capacity(tree.len());
    for entry in tree.iter() {
        let kind = entry
            .kind()
            .ok_or_else(|| IncryptError::UnexpectedType(ObjectType::Any))?;
        out.push((entry.id(), kind));
    }
    Ok(out)
}

struct TreeFrame {
    tree_id: Oid,
    children: Vec<(Oid, ObjectType)>,
    next: usize,
}

/// Iteratively wraps a tree and every sub-tree/blob beneath it,
/// post-order, appending each wrapped blob to `builder` under a
/// zero-padded sequential name. `cache` deduplicates objects reused
/// more than once within the same push (or the same tree).
fn wrap_tree_postorder(
    cr: &Repository,
    er: &Repository,
    key: &[u8; KEY_LEN],
    cache: &mut HashMap<Oid, Oid>,
    builder: &mut git2::TreeBuilder<'_>,
    next_index: &mut u64,
    root: Oid,
) -> Result<()> {
    let mut stack = vec![TreeFrame {
        tree_id: root,
        children: tree_entries(cr, root)?,
        next: 0,
    }];

    while let Some(frame) = stack.last_mut() {
        if frame.next < frame.children.len() {
            let (child_id, child_kind) = frame.children[frame.next];
            frame.next += 1;

            if cache.contains_key(&child_id) {
                continue;
            }

            match child_kind {
                ObjectType::Tree => stack.push(TreeFrame {
                    tree_id: child_id,
                    children: tree_entries(cr, child_id)?,
                    next: 0,
                }),
                ObjectType::Blob => {
                    append_wrapped(cr, er, key, cache, builder, next_index, child_id, ObjectType::Blob)?;
                }
                other => return Err(IncryptError::UnexpectedType(other).into()),
            }
        } else {
            let id = frame.tree_id;
            stack.pop();
            if !cache.contains_key(&id) {
                append_wrapped(cr, er, key, cache, builder, next_index, id, ObjectType::Tree)?;
            }
        }
    }

    Ok(())
}

fn append_wrapped(
    cr: &Repository,
    er: &Repository,
    key: &[u8; KEY_LEN],
    cache: &mut HashMap<Oid, Oid>,
    builder: &mut git2::TreeBuilder<'_>,
    next_index: &mut u64,
    id: Oid,
    kind: ObjectType,
) -> Result<()> {
    let wrapped_id = wrapped::wrap_object(cr, er, key, id, kind)?;
    let name = format!("{:08}", *next_index);
    *next_index += 1;
    builder.insert(&name, wrapped_id, FileMode::Blob.into())?;
    cache.insert(id, wrapped_id);
    Ok(())
}

fn build_wrapper_commit(er: &Repository, template: &[u8], tree_id: Oid, parents: &[Oid]) -> Result<Oid> {
    let mut buf = format!("tree {tree_id}\n").into_bytes();
    for parent in parents {
        buf.extend_from_slice(format!("parent {parent}\n").as_bytes());
    }
    buf.extend_from_slice(template);
    Ok(er.odb()?.write(ObjectType::Commit, &buf)?)
}

/// Encrypts every commit/tag between `tips` and the object map,
/// inserting new entries into `map` and returning the wrapper id for
/// each requested tip, in the same order.
pub fn encrypt_tips(
    cr: &Repository,
    er: &Repository,
    key: &[u8; KEY_LEN],
    template: &[u8],
    map: &mut ObjectMap,
    tips: &[Oid],
) -> Result<Vec<Oid>> {
    let (mut state, mut children) = discover(cr, map, tips)?;
    let mut cache: HashMap<Oid, Oid> = HashMap::new();

    // `state` is a HashMap, so its iteration order is arbitrary; since
    // `cache` suppresses re-emitting a sub-tree/blob shared by two
    // roots, the order wrappers are processed in can change which
    // payload tree -- and so which wrapper id -- ends up holding the
    // shared entry. Sorting by id makes that order (and therefore every
    // wrapper id produced) a pure function of the graph and the key.
    let mut initial_ready: Vec<Oid> = state
        .iter()
        .filter(|&(_, readiness)| *readiness == Readiness::Ready)
        .map(|(&id, _)| id)
        .collect();
    initial_ready.sort();
    let mut ready: VecDeque<Oid> = initial_ready.into();

    while let Some(id) = ready.pop_front() {
        state.remove(&id);
        let (kind, parents) = parents_of(cr, id)?;
        let parent_wrappers: Vec<Oid> = parents
            .iter()
            .map(|p| map.get(p).expect("parent must already be mapped by this point"))
            .collect();

        let mut builder = er.treebuilder(None)?;
        let mut index = 0u64;

        let wrapper_id = match kind {
            ObjectType::Commit => {
                let commit = cr.find_commit(id)?;
                wrap_tree_postorder(cr, er, key, &mut cache, &mut builder, &mut index, commit.tree_id())?;
                append_wrapped(cr, er, key, &mut cache, &mut builder, &mut index, id, ObjectType::Commit)?;
                let payload_tree = builder.write()?;
                build_wrapper_commit(er, template, payload_tree, &parent_wrappers)?
            }
            ObjectType::Tag => {
                append_wrapped(cr, er, key, &mut cache, &mut builder, &mut index, id, ObjectType::Tag)?;
                let payload_tree = builder.write()?;
                build_wrapper_commit(er, template, payload_tree, &parent_wrappers)?
            }
            other => return Err(IncryptError::UnexpectedType(other).into()),
        };

        debug!("encrypted {id} -> {wrapper_id}");
        map.insert(id, wrapper_id);

        for child in children.remove(&id).unwrap_or_default() {
            if state.get(&child) != Some(&Readiness::Pending) {
                continue;
            }
            let (_child_kind, child_parents) = parents_of(cr, child)?;
            if child_parents.iter().all(|p| map.get(p).is_some()) {
                state.insert(child, Readiness::Ready);
                ready.push_back(child);
            }
        }
    }

    if !state.is_empty() {
        return Err(IncryptError::IncompleteGraph(state.len()).into());
    }

    tips.iter()
        .map(|tip| map.get(tip).context("tip was not encrypted"))
        .collect()
}
