//! Lock-free accumulation into shared arrays of doubles.

use std::sync::atomic::{AtomicU64, Ordering};

/// A fixed-length array of f64 accumulators supporting concurrent add
/// without locks, via compare-and-swap on the 64-bit representation.
///
/// Ordering is relaxed: the accumulators form a commutative monoid and no
/// cross-cell ordering is promised to readers until the writers are done.
pub struct AtomicArray {
    bits: Vec<AtomicU64>,
}

impl AtomicArray {
    pub fn new(len: usize) -> Self {
        let zero = 0.0_f64.to_bits();
        Self {
            bits: (0..len).map(|_| AtomicU64::new(zero)).collect(),
        }
    }

    /// A zero-length array, used for channels that are not allocated.
    pub fn empty() -> Self {
        Self { bits: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Atomically adds `delta` to element `i`.
    pub fn add(&self, i: usize, delta: f64) {
        let cell = &self.bits[i];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let updated = (f64::from_bits(current) + delta).to_bits();
            match cell.compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn get(&self, i: usize) -> f64 {
        f64::from_bits(self.bits[i].load(Ordering::Relaxed))
    }

    /// Snapshot of the current values.
    pub fn to_vec(&self) -> Vec<f64> {
        self.bits
            .iter()
            .map(|b| f64::from_bits(b.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_add_and_get() {
        let a = AtomicArray::new(3);
        a.add(0, 1.5);
        a.add(0, 2.5);
        a.add(2, -1.0);
        assert_eq!(a.get(0), 4.0);
        assert_eq!(a.get(1), 0.0);
        assert_eq!(a.get(2), -1.0);
        assert_eq!(a.to_vec(), vec![4.0, 0.0, -1.0]);
    }

    #[test]
    fn test_concurrent_adds_do_not_lose_updates() {
        let a = Arc::new(AtomicArray::new(4));
        let mut handles = Vec::new();
        for t in 0..8 {
            let a = Arc::clone(&a);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    a.add(t % 4, 0.5);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let total: f64 = a.to_vec().iter().sum();
        assert_eq!(total, 8.0 * 10_000.0 * 0.5);
    }

    #[test]
    fn test_empty_array() {
        let a = AtomicArray::empty();
        assert!(a.is_empty());
        assert_eq!(a.len(), 0);
    }
}
