//! Duplicate suppression for forwarding loops
//!
//! Bounded registry of recently processed message IDs. On overflow the whole
//! set is purged rather than evicting entry by entry; after a purge an old ID
//! may be accepted again, which is safe because the store's insert is
//! idempotent and integrity/TTL checks still apply.

use std::collections::HashSet;

use crate::types::MessageId;

/// Registry of already-processed message IDs.
#[derive(Debug)]
pub struct SeenSet {
    ids: HashSet<MessageId>,
    limit: usize,
}

impl SeenSet {
    pub fn new(limit: usize) -> Self {
        Self {
            ids: HashSet::new(),
            limit,
        }
    }

    /// Record an ID. Returns `true` if it was not present before.
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.ids.insert(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Coarse purge: drop everything once the set has grown past its limit.
    /// Returns the number of entries cleared.
    pub fn maintain(&mut self) -> usize {
        if self.ids.len() > self.limit {
            let cleared = self.ids.len();
            tracing::debug!(cleared, "purging seen set");
            self.ids.clear();
            cleared
        } else {
            0
        }
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
