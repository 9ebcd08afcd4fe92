//! Process-wide map from Env id to Env.
//!
//! Generated code only carries the id (in `Context::id`); host callbacks use
//! it to find the Env they are serving. Lookups happen on every callback and
//! take the read lock. Insertion and removal happen once per Env.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::env::Shared;
use crate::host::fatal;

#[derive(Debug, Default)]
struct Entries {
    next_id: u32,
    envs: HashMap<u32, Arc<Shared>>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: RwLock<Entries>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub(crate) fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::default)
}

impl Entries {
    /// Ids are never reused, so the last one is `u32::MAX - 1`.
    fn reserve(&mut self) -> Option<u32> {
        let id = self.next_id;
        self.next_id = id.checked_add(1)?;
        Some(id)
    }
}

impl Registry {
    /// Reserves the next id and registers the Env built for it. Running out
    /// of ids is fatal.
    pub fn register(&self, make: impl FnOnce(u32) -> Shared) -> Arc<Shared> {
        let mut entries = self.entries.write();
        let Some(id) = entries.reserve() else {
            drop(entries);
            fatal(None, "Env ids exhausted");
        };
        let shared = Arc::new(make(id));
        entries.envs.insert(id, Arc::clone(&shared));
        shared
    }

    pub fn get(&self, id: u32) -> Option<Arc<Shared>> {
        self.entries.read().envs.get(&id).cloned()
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Shared>> {
        self.entries.write().envs.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().envs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_handed_out_once() {
        let mut entries = Entries::default();
        assert_eq!(entries.reserve(), Some(0));
        assert_eq!(entries.reserve(), Some(1));

        entries.next_id = u32::MAX - 1;
        assert_eq!(entries.reserve(), Some(u32::MAX - 1));
        assert_eq!(entries.reserve(), None);
        assert_eq!(entries.reserve(), None);
    }
}
