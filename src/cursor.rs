use crate::error::IndexError;
use crate::index::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

pub const CURSOR_FILE: &str = "cursor.json";
pub const DEFAULT_SEEN_CAPACITY: usize = 50_000;

#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    last_height: Option<u64>,
    #[serde(default)]
    seen_mempool: Vec<String>,
}

/// Scan progress: the last block whose payloads are all committed, plus a
/// bounded memory of mempool transactions already dispatched.
#[derive(Debug, Clone)]
pub struct ScanCursor {
    path: PathBuf,
    last_height: Option<u64>,
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
    listed: usize,
}

impl ScanCursor {
    pub fn load(dir: &Path, capacity: usize) -> Result<Self, IndexError> {
        let path = dir.join(CURSOR_FILE);
        let file = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<CursorFile>(&bytes).map_err(|source| {
                IndexError::Corrupt {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CursorFile {
                last_height: None,
                seen_mempool: Vec::new(),
            },
            Err(e) => return Err(IndexError::io(&path, e)),
        };

        let mut cursor = Self {
            path,
            last_height: file.last_height,
            seen_order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
            listed: 0,
        };
        for txid in file.seen_mempool {
            cursor.mark_seen(&txid);
        }
        Ok(cursor)
    }

    pub fn save(&self) -> Result<(), IndexError> {
        let file = CursorFile {
            last_height: self.last_height,
            seen_mempool: self.seen_order.iter().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        let dir = self.path.parent().unwrap_or(Path::new("."));
        write_atomic(dir, &self.path, &bytes)
    }

    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    /// Moves the cursor forward. Returns `false`, leaving it untouched, when
    /// `height` is not past the current position.
    pub fn advance(&mut self, height: u64) -> bool {
        if self.last_height.is_some_and(|last| height <= last) {
            return false;
        }
        self.last_height = Some(height);
        true
    }

    pub fn next_height(&self, start: Option<u64>, tip: u64) -> u64 {
        match self.last_height {
            Some(last) => last + 1,
            None => start.unwrap_or(tip),
        }
    }

    pub fn is_seen(&self, txid: &str) -> bool {
        self.seen.contains(txid)
    }

    /// Forgets seen txids that are no longer in `listed` and returns the
    /// listed txids not yet seen, in listing order. Until the next call,
    /// the capacity bound never evicts an id from this listing.
    pub fn reconcile_mempool(&mut self, listed: &[String]) -> Vec<String> {
        let live: HashSet<&str> = listed.iter().map(String::as_str).collect();
        self.seen_order.retain(|txid| live.contains(txid.as_str()));
        self.seen.retain(|txid| live.contains(txid.as_str()));
        self.listed = live.len();

        let mut queued = HashSet::new();
        listed
            .iter()
            .filter(|txid| !self.seen.contains(*txid) && queued.insert(txid.as_str()))
            .cloned()
            .collect()
    }

    /// Returns `true` when the txid was not already remembered.
    pub fn mark_seen(&mut self, txid: &str) -> bool {
        if !self.seen.insert(txid.to_string()) {
            return false;
        }
        self.seen_order.push_back(txid.to_string());
        while self.seen_order.len() > self.capacity.max(self.listed) {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn seen_len(&self) -> usize {
        self.seen_order.len()
    }
}
