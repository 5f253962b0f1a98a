//! Default state machine plugged into each part by the server.
//!
//! The replication engine treats the applied state as opaque; this
//! implementation keeps the applied payloads in order so the storage layer
//! above can consume them, and round-trips through snapshots with bincode.

use serde_derive::{Deserialize, Serialize};

use crate::raft::StateMachine;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct AppliedState {
    last_applied: u64,
    entries: Vec<(u64, Vec<u8>)>,
}

#[derive(Debug, Default)]
pub struct StateLog {
    state: AppliedState,
}

impl StateLog {
    pub fn new() -> StateLog {
        StateLog {
            state: AppliedState::default(),
        }
    }

    #[allow(dead_code)]
    pub fn last_applied(&self) -> u64 {
        self.state.last_applied
    }
}

impl StateMachine for StateLog {
    fn apply(&mut self, index: u64, data: &[u8]) {
        self.state.last_applied = index;
        self.state.entries.push((index, data.to_vec()));
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.state).unwrap_or_default()
    }

    fn on_snapshot(&mut self, last_index: u64, _last_term: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match bincode::deserialize(data) {
            Ok(state) => {
                self.state = state;
                self.state.last_applied = last_index;
            }
            Err(e) => {
                log::error!("failed to decode state snapshot: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let mut a = StateLog::new();
        a.apply(1, b"one");
        a.apply(2, b"two");

        let image = a.snapshot();
        let mut b = StateLog::new();
        b.on_snapshot(2, 1, &image);

        assert_eq!(b.last_applied(), 2);
        b.apply(3, b"three");
        assert_eq!(b.state.entries.len(), 3);
    }
}
