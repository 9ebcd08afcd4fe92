//! Content-addressed store for blobs produced by commands.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gfxil_semantic::CONTENT_ID_SIZE;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

const ID_SIZE: usize = CONTENT_ID_SIZE as usize;

/// Identifier of a blob: the leading bytes of its SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub [u8; ID_SIZE]);

impl ContentId {
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut id = [0; ID_SIZE];
        id.copy_from_slice(&digest[..ID_SIZE]);
        Self(id)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({self})")
    }
}

/// Shared by every Env of an executor.
#[derive(Debug, Default)]
pub struct Database {
    blobs: RwLock<HashMap<ContentId, Arc<[u8]>>>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, data: &[u8]) -> ContentId {
        let id = ContentId::of(data);
        if !self.blobs.read().contains_key(&id) {
            self.blobs.write().entry(id).or_insert_with(|| data.into());
        }
        id
    }

    pub fn get(&self, id: &ContentId) -> Option<Arc<[u8]>> {
        self.blobs.read().get(id).cloned()
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.blobs.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}
