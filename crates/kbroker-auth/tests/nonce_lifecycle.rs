//! Nonce lifecycle and uniqueness tests

use kbroker_auth::{NONCE_LENGTH, NonceError, NonceIssuer};
use kbroker_core::ManualClock;
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

#[test]
fn test_nonce_resolvable_then_gone() {
    // GIVEN: A five second nonce lifetime
    let clock = ManualClock::at_timestamp(1_700_000_000);
    let issuer = NonceIssuer::new(Duration::from_secs(5), clock.clone());
    let nonce = issuer.new_nonce().unwrap();

    // THEN: Resolvable at +2s
    clock.advance(Duration::from_secs(2));
    assert!(issuer.get_nonce(&nonce.value).is_ok());

    // THEN: Gone at +6s, before any sweep has run
    clock.advance(Duration::from_secs(4));
    assert_eq!(issuer.get_nonce(&nonce.value), Err(NonceError::NotFound));
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_evicts_expired_nonces() {
    let clock = ManualClock::at_timestamp(1_700_000_000);
    let issuer = NonceIssuer::new(Duration::from_secs(30), clock.clone());
    issuer.start_sweeper(Duration::from_secs(15));

    for _ in 0..10 {
        issuer.new_nonce().unwrap();
    }
    clock.advance(Duration::from_secs(31));
    let live = issuer.new_nonce().unwrap();
    assert_eq!(issuer.cached_nonces(), 11);

    // Let a sweep tick fire
    tokio::time::sleep(Duration::from_secs(16)).await;

    assert_eq!(issuer.cached_nonces(), 1);
    assert!(issuer.get_nonce(&live.value).is_ok());
    issuer.shutdown().await;
    issuer.shutdown().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_nonces_never_repeat(n in 1_000usize..5_000) {
        let issuer = NonceIssuer::new(Duration::from_secs(3600), ManualClock::at_timestamp(0));
        let mut seen = HashSet::with_capacity(n);

        for _ in 0..n {
            let nonce = issuer.new_nonce().unwrap();
            prop_assert_eq!(nonce.value.len(), NONCE_LENGTH);
            prop_assert!(seen.insert(nonce.value.clone()), "duplicate nonce {}", nonce.value);
        }
    }
}
