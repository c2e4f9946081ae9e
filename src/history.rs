use std::collections::VecDeque;

/// Fixed-capacity window of the most recent samples. Pushing past
/// capacity evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    data: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, value: T) {
        if self.data.len() >= self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn last(&self) -> Option<&T> {
        self.data.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }

    pub fn as_vec(&self) -> Vec<T> {
        self.data.iter().cloned().collect()
    }
}

/// Window statistics over a slice of ratio-like values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub min: f64,
    pub mean: f64,
    pub p95: f64,
}

/// Computes min/mean/p95 over the values. Returns `None` for an empty
/// window. p95 uses the nearest-rank method.
pub fn window_stats(values: &[f64]) -> Option<WindowStats> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let min = sorted[0];
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    let rank = ((0.95 * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    let p95 = sorted[rank - 1];
    Some(WindowStats { min, mean, p95 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_evicts_oldest_at_capacity() {
        let mut buf = RingBuffer::new(3);
        for i in 0..5 {
            buf.push(i);
        }
        assert_eq!(buf.as_vec(), vec![2, 3, 4]);
        assert_eq!(buf.last(), Some(&4));
    }

    #[test]
    fn capacity_one_keeps_only_latest() {
        let mut buf = RingBuffer::new(1);
        buf.push(1.0);
        buf.push(2.0);
        assert_eq!(buf.as_vec(), vec![2.0]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut buf = RingBuffer::new(0);
        buf.push(7);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn window_stats_empty() {
        assert_eq!(window_stats(&[]), None);
    }

    #[test]
    fn window_stats_single_value_is_degenerate() {
        let stats = window_stats(&[0.9]).unwrap();
        assert_eq!(stats.min, 0.9);
        assert_eq!(stats.mean, 0.9);
        assert_eq!(stats.p95, 0.9);
    }

    #[test]
    fn window_stats_known_values() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let stats = window_stats(&values).unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.mean, 50.5);
        assert_eq!(stats.p95, 95.0);
    }

    proptest! {
        #[test]
        fn buffer_never_exceeds_capacity(cap in 1usize..64, n in 0usize..256) {
            let mut buf = RingBuffer::new(cap);
            for i in 0..n {
                buf.push(i);
            }
            prop_assert!(buf.len() <= cap);
            prop_assert_eq!(buf.len(), n.min(cap));
        }

        #[test]
        fn stats_min_is_lower_bound(values in proptest::collection::vec(0.0f64..1.0, 1..50)) {
            let stats = window_stats(&values).unwrap();
            prop_assert!(stats.min <= stats.mean + 1e-9);
            prop_assert!(stats.min <= stats.p95 + 1e-9);
            prop_assert!(stats.p95 <= 1.0);
        }
    }
}
