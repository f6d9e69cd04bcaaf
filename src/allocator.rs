//! Chamber allocation over the dispenser's fixed slot pool.
//!
//! The allocator is pure: it only sees the chambers a caller passes in. Two
//! callers working from the same snapshot pick the same chamber, so writes go
//! through [`crate::store::Store::claim_medications`], which re-runs the
//! allocation inside a transaction guarded by the unique chamber index.

use std::collections::BTreeSet;

use crate::error::DoseError;

pub const DEFAULT_CHAMBER_COUNT: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChamberPool {
    size: u8,
}

impl Default for ChamberPool {
    fn default() -> Self {
        Self::new(DEFAULT_CHAMBER_COUNT)
    }
}

impl ChamberPool {
    pub fn new(size: u8) -> Self {
        Self { size }
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn contains(&self, chamber: u8) -> bool {
        (1..=self.size).contains(&chamber)
    }

    /// Chambers in `1..=size` not present in `used`.
    pub fn available<I>(&self, used: I) -> BTreeSet<u8>
    where
        I: IntoIterator<Item = u8>,
    {
        let used: BTreeSet<u8> = used.into_iter().collect();
        (1..=self.size).filter(|c| !used.contains(c)).collect()
    }

    /// Lowest free chamber, or [`DoseError::NoCapacity`] when every chamber is
    /// taken.
    pub fn next_chamber<I>(&self, used: I) -> Result<u8, DoseError>
    where
        I: IntoIterator<Item = u8>,
    {
        self.available(used)
            .into_iter()
            .next()
            .ok_or(DoseError::NoCapacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_excludes_used_chambers() {
        let pool = ChamberPool::default();
        let available = pool.available([1, 3]);
        assert_eq!(available.into_iter().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(pool.next_chamber([1, 3]).unwrap(), 2);
    }

    #[test]
    fn available_has_n_minus_k_elements() {
        let pool = ChamberPool::default();
        let used_sets: [&[u8]; 5] = [&[], &[4], &[2, 1], &[3, 1, 4], &[1, 2, 3, 4]];
        for used in used_sets {
            let available = pool.available(used.iter().copied());
            assert_eq!(available.len(), 4 - used.len());
            let expected = (1..=4).find(|c| !used.contains(c));
            assert_eq!(pool.next_chamber(used.iter().copied()).ok(), expected);
        }
    }

    #[test]
    fn next_chamber_fails_only_when_full() {
        let pool = ChamberPool::default();
        assert!(matches!(
            pool.next_chamber([1, 2, 3, 4]),
            Err(DoseError::NoCapacity)
        ));
        assert_eq!(pool.next_chamber([1, 2, 3]).unwrap(), 4);
    }

    #[test]
    fn out_of_pool_values_are_ignored() {
        let pool = ChamberPool::new(2);
        assert_eq!(pool.next_chamber([7, 1]).unwrap(), 2);
        assert!(!pool.contains(0));
        assert!(!pool.contains(3));
    }

    #[test]
    fn same_snapshot_yields_same_choice() {
        // Two clients allocating from one snapshot collide; the store's claim
        // is what keeps chambers unique.
        let pool = ChamberPool::default();
        let snapshot = vec![1u8];
        let first = pool.next_chamber(snapshot.clone()).unwrap();
        let second = pool.next_chamber(snapshot).unwrap();
        assert_eq!(first, second);
    }
}
