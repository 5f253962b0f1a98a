//! Routing table from partition key to its consensus group.
//!
//! Read-mostly: every inbound RPC does a lookup, add/remove only happens on
//! partition placement changes, so lookups take the shared side of the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use crate::error::{RaftError, Result};
use crate::raft::part::Part;
use crate::raft::PartitionKey;

#[derive(Default)]
pub struct PartManager {
    parts: RwLock<HashMap<PartitionKey, Arc<Part>>>,
}

impl PartManager {
    pub fn new() -> Self {
        PartManager {
            parts: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_part(&self, key: PartitionKey, part: Arc<Part>) -> Result<()> {
        let mut parts = self.parts.write().unwrap();
        if parts.contains_key(&key) {
            return Err(RaftError::AlreadyExists(key));
        }
        parts.insert(key, part);
        log::info!("part {} registered", key);
        Ok(())
    }

    /// Unregisters a part and stops its timers. No new dispatch reaches the
    /// part after this returns; callers already holding the handle finish
    /// with their original result.
    pub fn remove_part(&self, key: PartitionKey) -> Result<Arc<Part>> {
        let part = {
            let mut parts = self.parts.write().unwrap();
            parts.remove(&key).ok_or(RaftError::UnknownPartition(key))?
        };
        part.stop();
        log::info!("part {} removed", key);
        Ok(part)
    }

    pub fn find_part(&self, key: PartitionKey) -> Option<Arc<Part>> {
        self.parts.read().unwrap().get(&key).cloned()
    }

    pub fn part_count(&self) -> usize {
        self.parts.read().unwrap().len()
    }

    /// Removes and stops every part; used at service shutdown.
    pub fn drain(&self) {
        let parts: Vec<Arc<Part>> = {
            let mut map = self.parts.write().unwrap();
            map.drain().map(|(_, p)| p).collect()
        };
        for part in parts {
            part.stop();
        }
    }
}
