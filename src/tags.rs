//! Tag bookkeeping for inventory runs.
//!
//! All views are keyed by the EPC hex string:
//!
//! - `snapshot`: tags present at the end of the last completed poll cycle
//! - `in_progress`: tags seen during the poll cycle in progress
//! - `pending`: tags streamed for the buffer read in flight
//! - `accumulated`: every tag seen during the current inventory run
//! - `probability`: every tag seen since the last reset, with seen counts

use std::collections::BTreeMap;

use log::{info, trace};

use crate::types::TagRead;

/// Tags added and removed between two poll cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TagStore {
    snapshot: BTreeMap<String, TagRead>,
    in_progress: BTreeMap<String, TagRead>,
    pending: BTreeMap<String, TagRead>,
    accumulated: BTreeMap<String, TagRead>,
    probability: BTreeMap<String, TagRead>,
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an inventory run; diagnostic runs also restart occurrence counting
    pub fn begin_run(&mut self, count_occurrences: bool) {
        trace!("Clear accumulated buf: {}", self.accumulated.len());
        self.accumulated.clear();
        if count_occurrences {
            trace!("Clear probability buf: {}", self.probability.len());
            self.probability.clear();
        }
    }

    pub fn begin_cycle(&mut self) {
        self.in_progress.clear();
    }

    pub fn begin_buffer_read(&mut self) {
        self.pending.clear();
    }

    /// Record one streamed tag. Returns the number of distinct tags received
    /// for the buffer read in flight.
    pub fn record(&mut self, read: TagRead) -> usize {
        let epc = read.epc_hex();
        let tag = match self.probability.get_mut(&epc) {
            Some(known) => {
                known.seen += 1;
                known.clone()
            }
            None => {
                let tag = TagRead { seen: 1, ..read };
                self.probability.insert(epc.clone(), tag.clone());
                tag
            }
        };
        trace!("[{}]: read: {}: {}", self.pending.len() + 1, epc, tag.seen);

        self.accumulated.insert(epc.clone(), tag.clone());
        self.pending.insert(epc, tag);
        self.pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Merge the completed buffer read into the cycle in progress
    pub fn absorb_pending(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        self.in_progress.extend(pending);
        self.in_progress.len()
    }

    /// Compare the cycle in progress with the last snapshot
    pub fn diff(&self) -> TagDiff {
        let added: Vec<String> = self
            .in_progress
            .keys()
            .filter(|epc| !self.snapshot.contains_key(*epc))
            .cloned()
            .collect();
        let removed: Vec<String> = self
            .snapshot
            .keys()
            .filter(|epc| !self.in_progress.contains_key(*epc))
            .cloned()
            .collect();

        trace!("old={}; cur={}", self.snapshot.len(), self.in_progress.len());
        if !added.is_empty() {
            info!("ADD: {:?} add={}", added, added.len());
        }
        if !removed.is_empty() {
            info!("REM: {:?} rem={}", removed, removed.len());
        }
        TagDiff { added, removed }
    }

    /// The cycle in progress becomes the snapshot
    pub fn commit_cycle(&mut self) {
        self.snapshot = self.in_progress.clone();
        trace!("Save cur buf: {}", self.snapshot.len());
    }

    pub fn snapshot_epcs(&self) -> Vec<String> {
        self.snapshot.keys().cloned().collect()
    }

    pub fn accumulated_counts(&self) -> Vec<(String, u32)> {
        counts(&self.accumulated)
    }

    pub fn probability_counts(&self) -> Vec<(String, u32)> {
        counts(&self.probability)
    }
}

fn counts(view: &BTreeMap<String, TagRead>) -> Vec<(String, u32)> {
    view.iter().map(|(epc, tag)| (epc.clone(), tag.seen)).collect()
}
