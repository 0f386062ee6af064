/// Fixed-count circular collection of same-shaped entries.
///
/// The slot under the write cursor is the one being filled; `write` commits it and
/// moves on. Once every slot has been committed the oldest entry is overwritten, so no
/// operation can run out of space.
pub struct RingBuffer<T> {
    entries: Vec<T>,
    write_index: usize,
    total_writes: u64,
}

impl<T> RingBuffer<T> {
    /// Creates a ring of `capacity` entries produced by `factory`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; callers validate capacities beforehand.
    pub fn new(capacity: usize, mut factory: impl FnMut() -> T) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            entries: (0..capacity).map(|_| factory()).collect(),
            write_index: 0,
            total_writes: 0,
        }
    }

    /// Creates a ring over pre-built `entries`; the first slot is the write cursor.
    ///
    /// # Panics
    ///
    /// Panics if `entries` is empty.
    pub fn from_entries(entries: Vec<T>) -> Self {
        assert!(!entries.is_empty(), "ring buffer capacity must be positive");
        Self {
            entries,
            write_index: 0,
            total_writes: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Index of the slot the next `write` commits.
    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// Total number of commits since creation or the last reset.
    pub fn total_writes(&self) -> u64 {
        self.total_writes
    }

    /// Number of committed entries still held (saturates at capacity).
    pub fn len(&self) -> usize {
        (self.total_writes as usize).min(self.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.total_writes == 0
    }

    /// Commits the slot under the cursor and advances; returns the committed index.
    pub fn write(&mut self) -> usize {
        let index = self.write_index;
        self.write_index = (self.write_index + 1) % self.entries.len();
        self.total_writes += 1;
        index
    }

    /// Stores `value` in the slot under the cursor and commits it.
    pub fn push(&mut self, value: T) -> usize {
        *self.slot_mut() = value;
        self.write()
    }

    /// The slot under the write cursor.
    pub fn slot_mut(&mut self) -> &mut T {
        &mut self.entries[self.write_index]
    }

    pub fn get(&self, index: usize) -> &T {
        &self.entries[index % self.entries.len()]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut T {
        let len = self.entries.len();
        &mut self.entries[index % len]
    }

    /// Index of the most recently committed entry.
    pub fn current_index(&self) -> Option<usize> {
        if self.total_writes == 0 {
            None
        } else {
            Some((self.write_index + self.entries.len() - 1) % self.entries.len())
        }
    }

    /// The most recently committed entry.
    pub fn current(&self) -> Option<&T> {
        self.current_index().map(|index| &self.entries[index])
    }

    /// Index of the entry committed `back` writes before the current one.
    pub fn index_back(&self, back: usize) -> Option<usize> {
        if back >= self.len() {
            return None;
        }
        let len = self.entries.len();
        Some((self.write_index + len - 1 - back) % len)
    }

    /// The `count` most recent committed entries, oldest first.
    pub fn latest(&self, count: usize) -> impl Iterator<Item = &T> + '_ {
        let count = count.min(self.len());
        (0..count)
            .rev()
            .filter_map(move |back| self.index_back(back))
            .map(move |index| &self.entries[index])
    }

    /// Refills every slot and zeroes the cursor and counters.
    pub fn reset(&mut self, mut factory: impl FnMut() -> T) {
        for entry in self.entries.iter_mut() {
            *entry = factory();
        }
        self.write_index = 0;
        self.total_writes = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_overwrites_oldest() {
        let capacity = 4;
        let mut ring = RingBuffer::new(capacity, || 0u32);
        for value in 1..=(capacity as u32 + 1) {
            ring.push(value);
        }

        assert_eq!(ring.total_writes(), capacity as u64 + 1);
        assert_eq!(*ring.get(0), capacity as u32 + 1);
        assert_eq!(*ring.get(1), 2);
        assert_eq!(ring.current(), Some(&5));
        assert_eq!(ring.len(), capacity);
    }

    #[test]
    fn test_write_returns_committed_slot() {
        let mut ring = RingBuffer::new(3, || 0u32);
        assert_eq!(ring.current_index(), None);
        *ring.slot_mut() = 7;
        assert_eq!(ring.write(), 0);
        assert_eq!(ring.write(), 1);
        assert_eq!(ring.write(), 2);
        assert_eq!(ring.write(), 0);
        assert_eq!(ring.write_index(), 1);
    }

    #[test]
    fn test_latest_is_oldest_first() {
        let mut ring = RingBuffer::new(3, || 0u32);
        for value in 1..=5 {
            ring.push(value);
        }
        let latest: Vec<u32> = ring.latest(2).copied().collect();
        assert_eq!(latest, vec![4, 5]);
        let all: Vec<u32> = ring.latest(10).copied().collect();
        assert_eq!(all, vec![3, 4, 5]);
    }

    #[test]
    fn test_from_entries_keeps_order() {
        let mut ring = RingBuffer::from_entries(vec![10u32, 20, 30]);
        assert_eq!(ring.capacity(), 3);
        assert_eq!(*ring.get(ring.write_index()), 10);
        ring.write();
        assert_eq!(*ring.get(ring.write_index()), 20);
        assert_eq!(ring.current(), Some(&10));
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut ring = RingBuffer::new(2, || 1u32);
        ring.push(9);
        ring.reset(|| 0);
        assert_eq!(ring.total_writes(), 0);
        assert!(ring.is_empty());
        assert!(ring.iter().all(|&v| v == 0));
    }
}
