//! Bounded per-request handle caches (compiled regexes, resolved
//! directors). Handles are plain indices, stable for the life of one
//! request and never leaked across requests. Entries loaned from the
//! template are marked non-owned: a script may vacate their slot but the
//! underlying object belongs to the template.

#[derive(Debug, Clone)]
struct Entry<T> {
    item: T,
    hash: u32,
    non_owned: bool,
}

#[derive(Debug)]
pub struct HandleCache<T> {
    entries: Vec<Option<Entry<T>>>,
    max: usize,
}

impl<T: Clone> HandleCache<T> {
    pub fn new(max: usize, hard_cap: usize) -> Self {
        HandleCache {
            entries: Vec::new(),
            max: max.min(hard_cap),
        }
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.entries.get(idx)?.as_ref().map(|e| &e.item)
    }

    /// Look an entry up by content hash, for dedup on compile.
    pub fn find(&self, hash: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| matches!(e, Some(e) if e.hash == hash))
    }

    /// Insert an owned entry, returning its handle, or `None` when the
    /// cache is full. Vacated slots are reused before the cache grows.
    pub fn manage(&mut self, item: T, hash: u32) -> Option<usize> {
        let entry = Entry {
            item,
            hash,
            non_owned: false,
        };
        if let Some(idx) = self.entries.iter().position(|e| e.is_none()) {
            self.entries[idx] = Some(entry);
            return Some(idx);
        }
        if self.entries.len() >= self.max {
            return None;
        }
        self.entries.push(Some(entry));
        Some(self.entries.len() - 1)
    }

    /// Vacate a slot. Returns (existed, was_owned); callers that must
    /// not free loaned objects check the second flag.
    pub fn free(&mut self, idx: usize) -> (bool, bool) {
        match self.entries.get_mut(idx) {
            Some(slot @ Some(_)) => {
                let owned = !slot.as_ref().map(|e| e.non_owned).unwrap_or(false);
                *slot = None;
                (true, owned)
            }
            _ => (false, false),
        }
    }

    /// Take over another cache's entries as non-owned loans, preserving
    /// their handle order so template-issued handles stay valid in the
    /// fork.
    pub fn loan_from(&mut self, items: &[(u32, T)]) {
        for (hash, item) in items {
            if self.entries.len() >= self.max {
                break;
            }
            self.entries.push(Some(Entry {
                item: item.clone(),
                hash: *hash,
                non_owned: true,
            }));
        }
    }

    pub fn is_owned(&self, idx: usize) -> bool {
        matches!(self.entries.get(idx), Some(Some(e)) if !e.non_owned)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max
    }
}
