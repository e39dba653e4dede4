use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry;
use dashmap::DashMap;
use fnv::FnvBuildHasher;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Resource not found in the table")]
    NotFound,
    #[error("Resource exists in the table")]
    Exists,
}

/// A concurrent table of shared resources, used to cache per-device objects and to route events
/// to their owners.
#[derive(Debug)]
pub struct ResourceTable<K: Eq + Hash, R> {
    table: DashMap<K, Arc<R>, FnvBuildHasher>,
}

impl<K: Eq + Hash, R> Default for ResourceTable<K, R> {
    fn default() -> Self {
        ResourceTable {
            table: DashMap::default(),
        }
    }
}

impl<K: Eq + Hash + Clone, R> ResourceTable<K, R> {
    pub fn insert(&self, k: K, r: Arc<R>) -> Result<(), Error> {
        match self.table.entry(k) {
            entry::Entry::Occupied(_) => Err(Error::Exists),
            entry::Entry::Vacant(e) => {
                e.insert(r);
                Ok(())
            }
        }
    }

    pub fn get(&self, k: &K) -> Result<Arc<R>, Error> {
        self.table
            .get(k)
            .map(|r| Arc::clone(r.value()))
            .ok_or(Error::NotFound)
    }

    #[inline]
    pub fn contains(&self, k: &K) -> bool {
        self.table.contains_key(k)
    }

    /// Return the resource under `k`, creating it with `create` if absent. The shard stays locked
    /// while `create` runs, so concurrent callers for the same key create it exactly once.
    /// The flag reports whether this call created it.
    pub fn get_or_try_create<E, F>(&self, k: K, create: F) -> Result<(Arc<R>, bool), E>
    where
        F: FnOnce() -> Result<R, E>,
    {
        match self.table.entry(k) {
            entry::Entry::Occupied(e) => Ok((Arc::clone(e.get()), false)),
            entry::Entry::Vacant(e) => {
                let r = Arc::new(create()?);
                e.insert(Arc::clone(&r));
                Ok((r, true))
            }
        }
    }

    pub fn remove(&self, k: &K) -> Result<Arc<R>, Error> {
        self.table.remove(k).map(|(_, r)| r).ok_or(Error::NotFound)
    }

    /// Remove every entry. The shard locks are released before the entries are returned, so the
    /// caller may tear them down while others touch the table.
    pub fn drain(&self) -> Vec<(K, Arc<R>)> {
        let keys: Vec<K> = self.table.iter().map(|e| e.key().clone()).collect();
        keys.into_iter().filter_map(|k| self.table.remove(&k)).collect()
    }

    /// Snapshot of the current values.
    pub fn values(&self) -> Vec<Arc<R>> {
        self.table.iter().map(|e| Arc::clone(e.value())).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
