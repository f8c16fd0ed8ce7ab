// SPDX-License-Identifier: GPL-2.0
//
// Concurrent keyed memoization with per-key at-most-once construction.
//
// Both success and failure are sticky: the first caller for a key runs the
// constructor, every later caller (including racers that arrive while the
// constructor is still running) blocks and then observes the same outcome.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;

/// Errors are shared between all callers of a key, so they are reference
/// counted rather than owned.
pub type SharedError = Arc<anyhow::Error>;

pub struct OnceMap<K, V> {
    init: fn(&K) -> Result<V>,
    cells: Mutex<HashMap<K, Arc<OnceLock<Result<V, SharedError>>>>>,
}

impl<K, V> OnceMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(init: fn(&K) -> Result<V>) -> Self {
        OnceMap {
            init,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the memoized value for `key`, constructing it on first use.
    ///
    /// The map lock is only held while fetching the per-key cell, so
    /// constructions for distinct keys run in parallel.
    pub fn get(&self, key: &K) -> Result<V, SharedError> {
        let cell = {
            let mut cells = self.cells.lock().unwrap();
            cells.entry(key.clone()).or_default().clone()
        };
        cell.get_or_init(|| (self.init)(key).map_err(Arc::new))
            .clone()
    }

    /// Drops all memoized entries. Test harness re-initialization only.
    #[cfg(test)]
    pub fn clear(&self) {
        self.cells.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    // Tests share the process, so count constructor calls per key.
    static CALLS: Mutex<Option<HashMap<u32, usize>>> = Mutex::new(None);

    fn calls_for(key: u32) -> usize {
        *CALLS
            .lock()
            .unwrap()
            .get_or_insert_with(HashMap::new)
            .entry(key)
            .or_insert(0)
    }

    fn build(key: &u32) -> Result<u32> {
        *CALLS
            .lock()
            .unwrap()
            .get_or_insert_with(HashMap::new)
            .entry(*key)
            .or_insert(0) += 1;
        if *key == 13 {
            bail!("unlucky key {}", key);
        }
        Ok(key * 2)
    }

    #[test]
    fn test_once_per_key() {
        let m = Arc::new(OnceMap::new(build));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || m.get(&21).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
        assert_eq!(calls_for(21), 1);

        // A second key constructs independently.
        assert_eq!(m.get(&5).unwrap(), 10);
        assert_eq!(calls_for(5), 1);
    }

    #[test]
    fn test_sticky_error() {
        let m = OnceMap::new(build);

        let e1 = m.get(&13).unwrap_err();
        let e2 = m.get(&13).unwrap_err();
        assert_eq!(e1.to_string(), "unlucky key 13");
        assert!(Arc::ptr_eq(&e1, &e2));
        // The failing constructor ran exactly once.
        assert_eq!(calls_for(13), 1);
    }
}
