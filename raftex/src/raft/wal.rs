//! Per-part durable log store.
//!
//! Layout of a part's directory:
//!   hardstate        bincode (current_term, voted_for), replaced atomically
//!   snapshot         bincode state-machine image + (index, term)
//!   segment_N.log    length-prefixed entries, N = first index of the segment
//!
//! Responses that depend on a term, vote, or appended entry are only sent
//! after the corresponding write here has returned.

use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::raft::segment::Segment;
use crate::raft::{codec_err, HostId, LogEntry, LogIndex, TermId};

const SEGMENT_SPAN: u64 = 1024; // entries per segment file

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardState {
    pub term: TermId,
    pub voted_for: Option<HostId>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    index: LogIndex,
    term: TermId,
    data: Vec<u8>,
}

pub struct Wal {
    dir: PathBuf,
    hard_state: HardState,
    segments: BTreeMap<u64, Segment>,
    // In-memory mirror of every entry after the snapshot point.
    entries: BTreeMap<LogIndex, LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: TermId,
}

impl Wal {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let hard_state = match fs::read(dir.join("hardstate")) {
            Ok(bytes) => bincode::deserialize(&bytes).map_err(codec_err)?,
            Err(_) => HardState::default(),
        };

        let (snapshot_index, snapshot_term) = match fs::read(dir.join("snapshot")) {
            Ok(bytes) => {
                let snap: SnapshotFile = bincode::deserialize(&bytes).map_err(codec_err)?;
                (snap.index, snap.term)
            }
            Err(_) => (0, 0),
        };

        // Find and sort all segment files by start index
        let mut starts: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let name = entry.ok()?.file_name();
                let name = name.to_string_lossy().into_owned();
                name.strip_prefix("segment_")?
                    .strip_suffix(".log")?
                    .parse::<u64>()
                    .ok()
            })
            .collect();
        starts.sort_unstable();

        let mut segments = BTreeMap::new();
        let mut entries = BTreeMap::new();
        for start in starts {
            let mut segment = Segment::open(dir.join(format!("segment_{}.log", start)), start)?;
            for index in segment.get_start_index()..=segment.get_end_index() {
                if index <= snapshot_index {
                    continue;
                }
                let bytes = segment.read_entry(index)?;
                let entry: LogEntry = bincode::deserialize(&bytes).map_err(codec_err)?;
                entries.insert(index, entry);
            }
            segments.insert(start, segment);
        }

        Ok(Wal {
            dir,
            hard_state,
            segments,
            entries,
            snapshot_index,
            snapshot_term,
        })
    }

    pub fn current_term(&self) -> TermId {
        self.hard_state.term
    }

    pub fn voted_for(&self) -> Option<HostId> {
        self.hard_state.voted_for
    }

    /// Durably records (term, voted_for). Must return before any vote or
    /// term adoption is acknowledged to a peer.
    pub fn save_hard_state(&mut self, term: TermId, voted_for: Option<HostId>) -> Result<()> {
        let state = HardState { term, voted_for };
        let bytes = bincode::serialize(&state).map_err(codec_err)?;
        write_atomic(&self.dir, "hardstate", &bytes)?;
        self.hard_state = state;
        Ok(())
    }

    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> TermId {
        self.entries
            .values()
            .next_back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn snapshot_point(&self) -> (LogIndex, TermId) {
        (self.snapshot_index, self.snapshot_term)
    }

    /// Term of the entry at `index`, if the index is still covered by the
    /// log or the snapshot point. Index 0 is the empty-log sentinel.
    pub fn term_of(&self, index: LogIndex) -> Option<TermId> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entries.get(&index).map(|e| e.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        self.entries.get(&index)
    }

    /// Entries in [low, high], at most `max` of them.
    pub fn read_entries(&self, low: LogIndex, high: LogIndex, max: usize) -> Vec<LogEntry> {
        self.entries
            .range(low..=high)
            .take(max)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Appends a contiguous batch starting at last_index + 1.
    pub fn append(&mut self, batch: &[LogEntry]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if batch[0].index != self.last_index() + 1 {
            return Err(crate::error::RaftError::Codec(format!(
                "non-contiguous append: {} after {}",
                batch[0].index,
                self.last_index()
            )));
        }

        // Fill the current segment up to SEGMENT_SPAN entries, then roll
        // over to a new file starting at the next index
        let mut i = 0;
        while i < batch.len() {
            let index = batch[i].index;
            let (start, room) = match self.segments.iter().next_back() {
                Some((&start, seg))
                    if seg.get_end_index() + 1 == index && index - start < SEGMENT_SPAN =>
                {
                    (start, SEGMENT_SPAN - (index - start))
                }
                _ => (index, SEGMENT_SPAN),
            };
            let take = (batch.len() - i).min(room as usize);
            let mut serialized = Vec::with_capacity(take);
            for entry in &batch[i..i + take] {
                serialized.push(bincode::serialize(entry).map_err(codec_err)?);
            }
            let segment = self.get_or_create_segment(start)?;
            segment.append(&serialized)?;
            i += take;
        }

        for entry in batch {
            self.entries.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    /// Drops the uncommitted tail at `index` and beyond, on disk and in
    /// memory.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index > self.last_index() {
            return Ok(());
        }

        let mut to_remove = Vec::new();
        for (&start, segment) in self.segments.iter_mut() {
            if start >= index {
                to_remove.push(start);
            } else if segment.get_end_index() >= index {
                segment.truncate_from(index)?;
            }
        }
        for start in to_remove {
            self.segments.remove(&start);
            let _ = fs::remove_file(self.dir.join(format!("segment_{}.log", start)));
        }

        while let Some((&idx, _)) = self.entries.range(index..).next() {
            self.entries.remove(&idx);
        }
        Ok(())
    }

    /// Saves a local snapshot of the applied state and compacts every
    /// segment fully covered by it. The log tail past `index` is kept.
    pub fn save_snapshot(&mut self, data: Vec<u8>, index: LogIndex, term: TermId) -> Result<()> {
        self.write_snapshot_file(data, index, term)?;

        self.snapshot_index = index;
        self.snapshot_term = term;

        while let Some((&idx, _)) = self.entries.range(..=index).next() {
            self.entries.remove(&idx);
        }
        let mut to_remove = Vec::new();
        for (&start, segment) in self.segments.iter() {
            if segment.get_end_index() <= index {
                to_remove.push(start);
            }
        }
        for start in to_remove {
            self.segments.remove(&start);
            let _ = fs::remove_file(self.dir.join(format!("segment_{}.log", start)));
        }
        Ok(())
    }

    /// Installs a leader-sent snapshot, discarding the entire local log.
    /// The snapshot file lands atomically, so a crash mid-install leaves
    /// the previous state intact.
    pub fn install_snapshot(&mut self, data: Vec<u8>, index: LogIndex, term: TermId) -> Result<()> {
        self.write_snapshot_file(data, index, term)?;

        self.snapshot_index = index;
        self.snapshot_term = term;
        self.entries.clear();

        let starts: Vec<u64> = self.segments.keys().copied().collect();
        for start in starts {
            self.segments.remove(&start);
            let _ = fs::remove_file(self.dir.join(format!("segment_{}.log", start)));
        }
        Ok(())
    }

    pub fn read_snapshot(&self) -> Result<Option<(LogIndex, TermId, Vec<u8>)>> {
        match fs::read(self.dir.join("snapshot")) {
            Ok(bytes) => {
                let snap: SnapshotFile = bincode::deserialize(&bytes).map_err(codec_err)?;
                Ok(Some((snap.index, snap.term, snap.data)))
            }
            Err(_) => Ok(None),
        }
    }

    fn write_snapshot_file(&self, data: Vec<u8>, index: LogIndex, term: TermId) -> Result<()> {
        let snap = SnapshotFile { index, term, data };
        let bytes = bincode::serialize(&snap).map_err(codec_err)?;
        write_atomic(&self.dir, "snapshot", &bytes)
    }

    fn get_or_create_segment(&mut self, start: u64) -> Result<&mut Segment> {
        if !self.segments.contains_key(&start) {
            let segment = Segment::open(self.dir.join(format!("segment_{}.log", start)), start)?;
            self.segments.insert(start, segment);
        }
        Ok(self.segments.get_mut(&start).unwrap())
    }
}

/// Write to a temp file, sync, then rename over the target.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let temp_path = dir.join(format!("{}.tmp", name));
    let path = dir.join(name);
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, &path)?;
    Ok(())
}
