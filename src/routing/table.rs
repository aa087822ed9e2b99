//! Lock-free route lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::error::{RouterError, RouterResult};
use crate::routing::entry::RouteEntry;

type Entries = HashMap<String, Arc<RouteEntry>>;

/// Route entries keyed by a protocol-specific lookup key.
///
/// Reads take a snapshot without locking; loads copy the map, add to the
/// copy and swap it in.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: ArcSwap<Entries>,
    write: Mutex<()>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<RouteEntry>> {
        self.entries.load().get(key).cloned()
    }

    /// Add entries under `key_of(entry)`.
    ///
    /// Reloading the same controller method replaces its entry; a key
    /// already taken by a different method is a configuration error and
    /// leaves the table untouched.
    pub fn insert_all<F>(&self, entries: Vec<RouteEntry>, key_of: F) -> RouterResult<usize>
    where
        F: Fn(&RouteEntry) -> String,
    {
        let _guard = self.write.lock().expect("route table mutex poisoned");
        let mut next: Entries = (**self.entries.load()).clone();
        let added = entries.len();
        for entry in entries {
            let key = key_of(&entry);
            if let Some(existing) = next.get(&key) {
                if existing.controller != entry.controller || existing.method != entry.method {
                    return Err(RouterError::config(format!(
                        "route {key} is declared by both {}.{} and {}.{}",
                        existing.controller, existing.method, entry.controller, entry.method
                    )));
                }
            }
            next.insert(key, Arc::new(entry));
        }
        self.entries.store(Arc::new(next));
        Ok(added)
    }

    /// Every entry, ordered by key.
    pub fn entries(&self) -> Vec<Arc<RouteEntry>> {
        let snapshot = self.entries.load();
        let mut keys: Vec<&String> = snapshot.keys().collect();
        keys.sort();
        keys.into_iter().map(|k| Arc::clone(&snapshot[k])).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let _guard = self.write.lock().expect("route table mutex poisoned");
        self.entries.store(Arc::new(HashMap::new()));
    }
}
