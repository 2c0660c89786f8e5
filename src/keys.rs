//! Per-provider API key selection.
//!
//! Each provider owns one [`KeySelector`]: a small state machine that decides
//! which credential the next outbound call should use. Callers report a failed
//! call by passing the failed key's index back via `exclude`, which is normal
//! selection input, not an error path.

use std::sync::{Mutex, PoisonError};

use rand::Rng;
use tracing::debug;

use crate::config::KeyStrategy;
use crate::error::GatewayError;

/// A selected credential and its position in the pool.
///
/// The index is what callers feed back as `exclude` when the call made with
/// this key fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedKey {
    pub key: String,
    pub index: usize,
}

/// Rotation state machine over a provider's ordered credential pool.
///
/// The cursor sits behind its own mutex so that concurrent selections on the
/// same provider serialize: two round-robin calls always produce two distinct,
/// correctly-incrementing indices. Selection is O(1) and never suspends.
pub struct KeySelector {
    provider: String,
    keys: Vec<String>,
    strategy: KeyStrategy,
    cursor: Mutex<usize>,
}

impl KeySelector {
    pub fn new(provider: impl Into<String>, keys: Vec<String>, strategy: KeyStrategy) -> Self {
        Self {
            provider: provider.into(),
            keys,
            strategy,
            cursor: Mutex::new(0),
        }
    }

    /// Number of keys in the pool. Callers use this to decide whether a retry
    /// with a different key is even possible.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Credential pool in rotation order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Choose the key for the next outbound call.
    ///
    /// `exclude = None` means "normal next key"; `exclude = Some(i)` means
    /// "the key at index `i` just failed this call, give me a different one".
    /// With a single key there is nothing to rotate to, so it is always
    /// returned regardless of `exclude`.
    pub fn select_key(&self, exclude: Option<usize>) -> Result<SelectedKey, GatewayError> {
        let len = self.keys.len();
        if len == 0 {
            return Err(GatewayError::NoKeysAvailable(self.provider.clone()));
        }
        if len == 1 {
            return Ok(self.at(0));
        }

        let selected = match self.strategy {
            KeyStrategy::RoundRobin => self.select_round_robin(exclude),
            KeyStrategy::Random => self.select_random(exclude),
            KeyStrategy::Failover => self.select_failover(exclude),
        };

        debug!(
            provider = %self.provider,
            strategy = ?self.strategy,
            index = selected.index,
            excluded = ?exclude,
            "Selected API key"
        );
        Ok(selected)
    }

    fn at(&self, index: usize) -> SelectedKey {
        SelectedKey {
            key: self.keys[index].clone(),
            index,
        }
    }

    /// Round-robin: the stored cursor cycles on non-failure calls only. A
    /// failure call answers relative to the failed index and leaves the
    /// cursor's own cycle untouched.
    fn select_round_robin(&self, exclude: Option<usize>) -> SelectedKey {
        match exclude {
            Some(failed) => self.at((failed + 1) % self.keys.len()),
            None => {
                let mut cursor = self.lock_cursor();
                let index = *cursor;
                *cursor = (index + 1) % self.keys.len();
                self.at(index)
            }
        }
    }

    /// Random: uniform over the pool; a failure call draws uniformly from the
    /// pool minus the failed index.
    fn select_random(&self, exclude: Option<usize>) -> SelectedKey {
        let len = self.keys.len();
        let mut rng = rand::rng();
        let index = match exclude {
            Some(failed) if failed < len => {
                let drawn = rng.random_range(0..len - 1);
                if drawn >= failed { drawn + 1 } else { drawn }
            }
            _ => rng.random_range(0..len),
        };
        self.at(index)
    }

    /// Failover: sticky. Repeats the current key until a failure is reported,
    /// then advances past the failed index and persists the new position.
    fn select_failover(&self, exclude: Option<usize>) -> SelectedKey {
        let mut cursor = self.lock_cursor();
        if let Some(failed) = exclude {
            *cursor = (failed + 1) % self.keys.len();
        }
        self.at(*cursor)
    }

    fn lock_cursor(&self) -> std::sync::MutexGuard<'_, usize> {
        // A poisoned cursor is still a valid index; keep rotating.
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySelector")
            .field("provider", &self.provider)
            .field("key_count", &self.keys.len())
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn selector(strategy: KeyStrategy, keys: &[&str]) -> KeySelector {
        KeySelector::new(
            "test",
            keys.iter().map(|k| k.to_string()).collect(),
            strategy,
        )
    }

    fn indices(selector: &KeySelector, n: usize) -> Vec<usize> {
        (0..n)
            .map(|_| selector.select_key(None).expect("select").index)
            .collect()
    }

    #[test]
    fn test_zero_keys_fails() {
        let s = selector(KeyStrategy::RoundRobin, &[]);
        assert!(matches!(
            s.select_key(None),
            Err(GatewayError::NoKeysAvailable(_))
        ));
    }

    #[test]
    fn test_single_key_ignores_exclude() {
        let s = selector(KeyStrategy::Failover, &["only"]);
        let picked = s.select_key(Some(0)).expect("select");
        assert_eq!(picked.index, 0);
        assert_eq!(picked.key, "only");
    }

    #[test]
    fn test_round_robin_cycles() {
        let s = selector(KeyStrategy::RoundRobin, &["k1", "k2", "k3"]);
        assert_eq!(indices(&s, 7), vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_round_robin_concurrent_selection_covers_full_cycles() {
        use std::sync::Arc;
        use std::thread;

        let selector = Arc::new(KeySelector::new(
            "concurrent",
            vec!["k1".to_string(), "k2".to_string(), "k3".to_string()],
            KeyStrategy::RoundRobin,
        ));

        // 12 selections across 3 keys: the serialized cursor must hand out
        // each index exactly 4 times, whatever the thread interleaving.
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let selector = Arc::clone(&selector);
                thread::spawn(move || selector.select_key(None).expect("select").index)
            })
            .collect();

        let mut counts = [0usize; 3];
        for handle in handles {
            counts[handle.join().expect("thread")] += 1;
        }
        assert_eq!(counts, [4, 4, 4]);
    }

    #[test]
    fn test_round_robin_failure_does_not_advance_cursor() {
        let s = selector(KeyStrategy::RoundRobin, &["k1", "k2", "k3"]);
        // Normal call consumes index 0; cursor now at 1.
        assert_eq!(s.select_key(None).expect("select").index, 0);

        // Failure of index 2 answers with (2 + 1) % 3 = 0...
        assert_eq!(s.select_key(Some(2)).expect("select").index, 0);

        // ...while the stored cursor continues its own cycle.
        assert_eq!(indices(&s, 3), vec![1, 2, 0]);
    }

    #[test]
    fn test_failover_sticky_until_failure() {
        let s = selector(KeyStrategy::Failover, &["k1", "k2"]);
        assert_eq!(s.select_key(None).expect("select").index, 0);
        assert_eq!(s.select_key(None).expect("select").index, 0);

        // k1 failed: advance to k2 and persist.
        let picked = s.select_key(Some(0)).expect("select");
        assert_eq!((picked.key.as_str(), picked.index), ("k2", 1));

        // Sticky on the new key.
        assert_eq!(s.select_key(None).expect("select").index, 1);

        // k2 failed: wraps back to k1.
        assert_eq!(s.select_key(Some(1)).expect("select").index, 0);
    }

    #[test]
    fn test_random_exclude_never_returns_failed_index() {
        let s = selector(KeyStrategy::Random, &["k1", "k2", "k3"]);
        for _ in 0..200 {
            let picked = s.select_key(Some(1)).expect("select");
            assert_ne!(picked.index, 1);
        }
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let s = selector(KeyStrategy::Random, &["k1", "k2"]);
        for _ in 0..100 {
            assert!(s.select_key(None).expect("select").index < 2);
        }
    }

    proptest! {
        #[test]
        fn prop_index_always_valid(
            key_count in 1usize..8,
            strategy_pick in 0u8..3,
            calls in proptest::collection::vec(proptest::option::of(0usize..8), 1..32),
        ) {
            let strategy = match strategy_pick {
                0 => KeyStrategy::RoundRobin,
                1 => KeyStrategy::Random,
                _ => KeyStrategy::Failover,
            };
            let keys: Vec<String> = (0..key_count).map(|i| format!("k{i}")).collect();
            let selector = KeySelector::new("prop", keys, strategy);

            for exclude in calls {
                let exclude = exclude.map(|e| e % key_count);
                let picked = selector.select_key(exclude).expect("non-empty pool");
                prop_assert!(picked.index < key_count);
                let expected = format!("k{}", picked.index);
                prop_assert_eq!(picked.key.as_str(), expected.as_str());
            }
        }

        #[test]
        fn prop_exclude_honored_with_multiple_keys(
            key_count in 2usize..8,
            strategy_pick in 0u8..3,
            failed in 0usize..8,
        ) {
            let strategy = match strategy_pick {
                0 => KeyStrategy::RoundRobin,
                1 => KeyStrategy::Random,
                _ => KeyStrategy::Failover,
            };
            let failed = failed % key_count;
            let keys: Vec<String> = (0..key_count).map(|i| format!("k{i}")).collect();
            let selector = KeySelector::new("prop", keys, strategy);

            let picked = selector.select_key(Some(failed)).expect("non-empty pool");
            prop_assert_ne!(picked.index, failed);
        }
    }
}
