// Map from host object/resource id to instrumentation state
//
// The host does not report object destruction, so the map is bounded: once
// it reaches the high water mark, only the most recently inserted
// low-water-mark entries are kept.

use std::collections::HashMap;

pub const HANDLE_MAP_HIGH_WATER_MARK: usize = 2000;
pub const HANDLE_MAP_LOW_WATER_MARK: usize = 1000;

#[derive(Debug, Clone)]
pub struct HandleMap<V> {
    entries: HashMap<u64, (u64, V)>,
    next_sequence: u64,
    high_water_mark: usize,
    low_water_mark: usize,
}

impl<V> Default for HandleMap<V> {
    fn default() -> Self {
        Self::with_water_marks(HANDLE_MAP_HIGH_WATER_MARK, HANDLE_MAP_LOW_WATER_MARK)
    }
}

impl<V> HandleMap<V> {
    /// `low_water_mark` is clamped below `high_water_mark`
    pub fn with_water_marks(high_water_mark: usize, low_water_mark: usize) -> Self {
        let high_water_mark = high_water_mark.max(1);
        if low_water_mark >= high_water_mark {
            tracing::warn!(
                high_water_mark,
                low_water_mark,
                "Handle map low water mark must be below the high water mark - clamping it"
            );
        }
        Self {
            entries: HashMap::new(),
            next_sequence: 0,
            high_water_mark,
            low_water_mark: low_water_mark.min(high_water_mark - 1),
        }
    }

    pub fn insert(&mut self, handle_id: u64, value: V) {
        if self.entries.len() >= self.high_water_mark && !self.entries.contains_key(&handle_id) {
            self.purge();
        }
        self.entries.insert(handle_id, (self.next_sequence, value));
        self.next_sequence += 1;
    }

    fn purge(&mut self) {
        tracing::debug!(
            count = self.entries.len(),
            keep = self.low_water_mark,
            "Handle map reached its max capacity - purging it"
        );
        if self.low_water_mark == 0 {
            self.entries.clear();
            return;
        }
        let mut sequences: Vec<u64> =
            self.entries.values().map(|(sequence, _)| *sequence).collect();
        sequences.sort_unstable();
        let cutoff = sequences[sequences.len() - self.low_water_mark];
        self.entries.retain(|_, (sequence, _)| *sequence >= cutoff);
    }

    pub fn get(&self, handle_id: u64) -> Option<&V> {
        self.entries.get(&handle_id).map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, handle_id: u64) -> Option<&mut V> {
        self.entries.get_mut(&handle_id).map(|(_, value)| value)
    }

    pub fn remove(&mut self, handle_id: u64) -> Option<V> {
        self.entries.remove(&handle_id).map(|(_, value)| value)
    }

    pub fn contains(&self, handle_id: u64) -> bool {
        self.entries.contains_key(&handle_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_keeps_most_recent_entries() {
        let mut map = HandleMap::with_water_marks(4, 2);
        for handle_id in 1..=4 {
            map.insert(handle_id, handle_id * 10);
        }
        // updating a tracked handle at capacity does not purge
        map.insert(1, 11);
        assert_eq!(map.len(), 4);

        map.insert(5, 50);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(1), Some(&11));
        assert_eq!(map.get(4), Some(&40));
        assert_eq!(map.get(5), Some(&50));
        assert!(!map.contains(2));
    }

    #[test]
    fn test_low_water_mark_is_clamped() {
        let mut map = HandleMap::with_water_marks(3, 5);
        for handle_id in 1..=4 {
            map.insert(handle_id, ());
        }
        assert_eq!(map.len(), 3);
        assert!(map.contains(4));
        assert!(!map.contains(1));

        let mut map = HandleMap::with_water_marks(0, 0);
        map.insert(1, "a");
        map.insert(2, "b");
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove(2), Some("b"));
        assert!(map.is_empty());
    }
}
