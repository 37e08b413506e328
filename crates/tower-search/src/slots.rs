use std::collections::HashMap;

use crate::store::ContentHash;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Empty,
    Filled(ContentHash),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(usize),
    Duplicate(usize),
    NoCapacity,
}

/// Slots are never emptied again, so `empty_count` only decreases.
#[derive(Debug)]
pub struct SlotTracker {
    slots: Vec<Slot>,
    index: HashMap<ContentHash, usize>,
}

impl SlotTracker {
    pub fn new(total: usize) -> Self {
        Self {
            slots: vec![Slot::Empty; total],
            index: HashMap::new(),
        }
    }

    /// Fills slots from hashes found on disk. Returns how many were used;
    /// hashes beyond capacity and repeats are ignored.
    pub fn seed<I>(&mut self, existing: I) -> usize
    where
        I: IntoIterator<Item = ContentHash>,
    {
        let mut seeded = 0;
        for hash in existing {
            if self.is_full() {
                break;
            }
            if let ClaimOutcome::Claimed(_) = self.claim(hash) {
                seeded += 1;
            }
        }
        seeded
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn filled_count(&self) -> usize {
        self.index.len()
    }

    pub fn empty_count(&self) -> usize {
        self.slots.len() - self.index.len()
    }

    pub fn is_full(&self) -> bool {
        self.empty_count() == 0
    }

    pub fn position(&self, hash: &ContentHash) -> Option<usize> {
        self.index.get(hash).copied()
    }

    pub fn claim(&mut self, hash: ContentHash) -> ClaimOutcome {
        if let Some(existing) = self.position(&hash) {
            return ClaimOutcome::Duplicate(existing);
        }
        let Some(free) = self.slots.iter().position(|s| *s == Slot::Empty) else {
            return ClaimOutcome::NoCapacity;
        };
        self.slots[free] = Slot::Filled(hash.clone());
        self.index.insert(hash, free);
        ClaimOutcome::Claimed(free)
    }

    pub fn try_claim(&mut self, hash: ContentHash) -> bool {
        matches!(self.claim(hash), ClaimOutcome::Claimed(_))
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn filled(&self) -> impl Iterator<Item = &ContentHash> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Filled(hash) => Some(hash),
            Slot::Empty => None,
        })
    }
}
