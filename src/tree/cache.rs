use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::{Chain, ChainTreeNode};

use super::build_tree;

const ENABLE_LOGS: bool = false;

use crate::log_debug;

/// What changed between the cached input and a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Unchanged,
    /// Same (id, parent, sort order, type) tuples, different record content.
    MetadataOnly,
    Structural,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeCacheStats {
    pub hits: u64,
    pub metadata_rebuilds: u64,
    pub structural_rebuilds: u64,
    pub invalidations: u64,
}

/// Hash over the tuples that decide tree shape.
pub fn structural_hash(chains: &[Chain]) -> String {
    let mut hasher = Sha256::new();
    for chain in chains {
        hasher.update(chain.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(chain.parent_id.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(chain.sort_order.to_le_bytes());
        hasher.update(chain.chain_type.as_str().as_bytes());
        hasher.update([0xffu8]);
    }
    hex::encode(hasher.finalize())
}

/// Hash over complete record content, counters included.
pub fn metadata_hash(chains: &[Chain]) -> String {
    let mut hasher = Sha256::new();
    for chain in chains {
        match serde_json::to_vec(chain) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(chain.id.as_bytes()),
        }
        hasher.update([0xffu8]);
    }
    hex::encode(hasher.finalize())
}

struct CachedTree {
    structural: String,
    metadata: String,
    roots: Arc<Vec<ChainTreeNode>>,
}

/// Memoised `build_tree`. Serves the cached forest only when the record
/// content is byte-identical; any mutation must call `invalidate`.
#[derive(Default)]
pub struct TreeCache {
    entry: Mutex<Option<CachedTree>>,
    stats: Mutex<TreeCacheStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, chains: &[Chain]) -> ChangeKind {
        let entry = lock(&self.entry);
        match entry.as_ref() {
            None => ChangeKind::Structural,
            Some(cached) => {
                if cached.structural != structural_hash(chains) {
                    ChangeKind::Structural
                } else if cached.metadata != metadata_hash(chains) {
                    ChangeKind::MetadataOnly
                } else {
                    ChangeKind::Unchanged
                }
            }
        }
    }

    pub fn get_or_build(&self, chains: &[Chain]) -> Arc<Vec<ChainTreeNode>> {
        let structural = structural_hash(chains);
        let metadata = metadata_hash(chains);

        let mut entry = lock(&self.entry);
        let change = match entry.as_ref() {
            Some(cached) if cached.structural == structural && cached.metadata == metadata => {
                lock(&self.stats).hits += 1;
                return Arc::clone(&cached.roots);
            }
            Some(cached) if cached.structural == structural => ChangeKind::MetadataOnly,
            _ => ChangeKind::Structural,
        };

        // A full rebuild covers both kinds of change.
        let roots = Arc::new(build_tree(chains));
        {
            let mut stats = lock(&self.stats);
            match change {
                ChangeKind::MetadataOnly => stats.metadata_rebuilds += 1,
                _ => stats.structural_rebuilds += 1,
            }
        }
        log_debug!("tree cache rebuilt ({change:?}) for {} chain(s)", chains.len());

        *entry = Some(CachedTree {
            structural,
            metadata,
            roots: Arc::clone(&roots),
        });
        roots
    }

    pub fn invalidate(&self) {
        *lock(&self.entry) = None;
        lock(&self.stats).invalidations += 1;
    }

    pub fn stats(&self) -> TreeCacheStats {
        *lock(&self.stats)
    }
}
