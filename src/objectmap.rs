//! Object mapper (C4): a thin, direction-aware view over the object
//! map persisted in the metadata record. Read-only during fetch;
//! mutable during push, where newly encrypted objects are appended
//! without ever discarding the stale entries already on disk.

use std::collections::HashMap;

use git2::{Oid, Repository};

use crate::metadata;

pub struct ObjectMap {
    /// Every record as persisted before this push began. Never
    /// mutated; stale entries ride along so a later fetch against an
    /// older remote state can still find them.
    base: Vec<(Oid, Oid)>,
    /// Records added so far during this push.
    added: Vec<(Oid, Oid)>,
    /// clear_id -> crypt_id, filtered to entries whose crypt_id
    /// currently exists on the encrypted remote, plus everything
    /// added this push.
    active: HashMap<Oid, Oid>,
}

impl ObjectMap {
    /// Loads the forward (clear -> crypt) view used while pushing,
    /// filtered against the encrypted remote so a dangling entry from
    /// a rewritten history can never be reused.
    pub fn load_for_push(er: &Repository, meta: &metadata::MetaData) -> ObjectMap {
        let active = metadata::read_map(er, &meta.records, false);
        ObjectMap {
            base: meta.records.clone(),
            added: Vec::new(),
            active,
        }
    }

    /// Loads the reverse (crypt -> clear) view used while fetching,
    /// filtered against the cleartext repository.
    pub fn load_for_fetch(cr: &Repository, meta: &metadata::MetaData) -> HashMap<Oid, Oid> {
        metadata::read_map(cr, &meta.records, true)
    }

    pub fn get(&self, clear_id: &Oid) -> Option<Oid> {
        self.active.get(clear_id).copied()
    }

    pub fn insert(&mut self, clear_id: Oid, crypt_id: Oid) {
        self.active.insert(clear_id, crypt_id);
        self.added.push((clear_id, crypt_id));
    }

    /// The full record set to persist back to the metadata record:
    /// every record that existed before this push, plus everything
    /// added during it.
    pub fn into_records(self) -> Vec<(Oid, Oid)> {
        let mut records = self.base;
        records.extend(self.added);
        records
    }
}
