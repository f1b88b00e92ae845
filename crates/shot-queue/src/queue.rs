//! FIFO of admitted shots.

use chrono::{DateTime, Utc};
use shot_core::{ShotError, ShotId, ShotResult};
use std::collections::VecDeque;

/// A shot waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Identity of the queued artifact
    pub shot: ShotId,
    /// Admission time
    pub enqueued_at: DateTime<Utc>,
    /// Original artifact when this entry is a stripped copy
    pub cloned_from: Option<ShotId>,
}

impl QueueEntry {
    /// Entry stamped with the current time.
    pub fn new(shot: ShotId, cloned_from: Option<ShotId>) -> Self {
        Self {
            shot,
            enqueued_at: Utc::now(),
            cloned_from,
        }
    }
}

/// Insertion at the tail, removal from the head; each identity at most once.
#[derive(Debug, Default)]
pub struct ShotQueue {
    entries: VecDeque<QueueEntry>,
}

impl ShotQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its 1-based position.
    ///
    /// # Errors
    /// Rejects an identity that is already queued.
    pub fn push_back(&mut self, entry: QueueEntry) -> ShotResult<usize> {
        if self.contains(&entry.shot) {
            return Err(ShotError::Artifact(format!("{} is already queued", entry.shot)));
        }
        self.entries.push_back(entry);
        Ok(self.entries.len())
    }

    /// Take the head entry.
    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// True if `id` is queued.
    pub fn contains(&self, id: &ShotId) -> bool {
        self.entries.iter().any(|e| &e.shot == id)
    }

    /// 1-based position of `id`.
    pub fn position(&self, id: &ShotId) -> Option<usize> {
        self.entries.iter().position(|e| &e.shot == id).map(|i| i + 1)
    }

    /// Remove a pending entry.
    pub fn remove(&mut self, id: &ShotId) -> Option<QueueEntry> {
        let index = self.entries.iter().position(|e| &e.shot == id)?;
        self.entries.remove(index)
    }

    /// Drop every pending entry; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    /// Copy of the pending entries, head first.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Numbered copies of `id` that are not queued, in ascending order.
    ///
    /// The caller still has to skip names taken in the artifact store.
    pub fn clone_candidates<'a>(&'a self, id: &'a ShotId) -> impl Iterator<Item = ShotId> + 'a {
        (1..=u32::MAX)
            .map(move |n| id.repeat(n))
            .filter(move |candidate| !self.contains(candidate))
    }
}
