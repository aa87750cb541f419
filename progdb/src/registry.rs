//! Append-only identity registries.
//!
//! Each registry hands out dense ids in first-registration order. Nothing is
//! ever removed or renumbered, so an id stays valid for the life of the unit.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::ast::{DeclId, Qualifiers, TyId};
use crate::error::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Universe {
    Type,
    Function,
    FunctionDecl,
    Global,
    Unresolved,
}

/// Identity of a canonical type: a non-sugar node plus accumulated qualifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey {
    pub node: TyId,
    pub quals: Qualifiers,
}

#[derive(Debug, Clone)]
pub struct Registry<K> {
    universe: Universe,
    ids: HashMap<K, u64>,
    keys: Vec<K>,
}

impl<K: Hash + Eq + Clone + Debug> Registry<K> {
    pub fn new(universe: Universe) -> Self {
        Registry {
            universe,
            ids: HashMap::new(),
            keys: Vec::new(),
        }
    }

    /// Returns the id of `key`, allocating the next one on first sight.
    /// The flag tells whether the id is new.
    pub fn register(&mut self, key: K) -> (u64, bool) {
        if let Some(id) = self.ids.get(&key) {
            return (*id, false);
        }
        let id = self.keys.len() as u64;
        self.ids.insert(key.clone(), id);
        self.keys.push(key);
        (id, true)
    }

    pub fn get(&self, key: &K) -> Option<u64> {
        self.ids.get(key).copied()
    }

    pub fn lookup(&self, key: &K) -> Result<u64, DbError> {
        self.get(key).ok_or_else(|| DbError::NotRegistered {
            universe: self.universe,
            what: format!("{key:?}"),
        })
    }

    pub fn key(&self, id: u64) -> Option<&K> {
        self.keys.get(id as usize)
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn universe(&self) -> Universe {
        self.universe
    }
}

/// Function, declaration, global and unresolved-name universes of one unit.
/// Types live in the canonicalizer's own table.
#[derive(Debug, Clone)]
pub struct Registries {
    pub funcs: Registry<DeclId>,
    pub funcdecls: Registry<DeclId>,
    pub globals: Registry<DeclId>,
    pub unresolved: Registry<String>,
}

impl Default for Registries {
    fn default() -> Self {
        Registries {
            funcs: Registry::new(Universe::Function),
            funcdecls: Registry::new(Universe::FunctionDecl),
            globals: Registry::new(Universe::Global),
            unresolved: Registry::new(Universe::Unresolved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_and_dense() {
        let mut r: Registry<String> = Registry::new(Universe::Unresolved);
        assert_eq!(r.register("memcpy".into()), (0, true));
        assert_eq!(r.register("strlen".into()), (1, true));
        assert_eq!(r.register("memcpy".into()), (0, false));
        assert_eq!(r.len(), 2);
        assert_eq!(r.key(1).map(String::as_str), Some("strlen"));
    }

    #[test]
    fn lookup_of_unknown_key_fails() {
        let r: Registry<DeclId> = Registry::new(Universe::Global);
        match r.lookup(&DeclId(7)) {
            Err(DbError::NotRegistered { universe, .. }) => assert_eq!(universe, Universe::Global),
            other => panic!("expected NotRegistered, got {other:?}"),
        }
    }
}
