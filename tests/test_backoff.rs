//! Property tests for reconnect delay calculation

use fleetwire::transport::backoff::{base_delay, delay, BackoffPolicy};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;

proptest! {
    #[test]
    fn delay_stays_within_jitter_window(
        attempt in 1u32..20,
        base_ms in 1u64..5_000,
        seed in any::<u64>(),
    ) {
        let base = Duration::from_millis(base_ms);
        let mut rng = StdRng::seed_from_u64(seed);

        let lower = base_delay(attempt, base);
        let drawn = delay(attempt, base, &mut rng);

        prop_assert!(drawn >= lower, "{:?} below {:?}", drawn, lower);
        prop_assert!(drawn <= lower + lower / 2, "{:?} above window", drawn);
    }

    #[test]
    fn base_delay_never_shrinks(attempt in 1u32..200, base_ms in 0u64..10_000) {
        let base = Duration::from_millis(base_ms);
        prop_assert!(base_delay(attempt + 1, base) >= base_delay(attempt, base));
    }

    #[test]
    fn seeded_policies_agree(seed in any::<u64>(), attempt in 1u32..30) {
        let base = Duration::from_millis(250);
        let first = BackoffPolicy::with_seed(base, seed);
        let second = BackoffPolicy::with_seed(base, seed);
        prop_assert_eq!(first.delay(attempt), second.delay(attempt));
    }
}

#[test]
fn test_minimum_total_bounds_elapsed_backoff() {
    let policy = BackoffPolicy::new(Duration::from_millis(10));
    let total: Duration = (1..=4).map(|attempt| policy.delay(attempt)).sum();

    // 10 + 20 + 40 + 80
    assert_eq!(policy.minimum_total(4), Duration::from_millis(150));
    assert!(total >= policy.minimum_total(4));
    assert!(total <= Duration::from_millis(225));
}
