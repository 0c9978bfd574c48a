//! Integration tests for rate limiting algorithms.

use std::time::Duration;

use admit_ratelimit::codec::{StateCodec, TokenBucketState};
use admit_ratelimit::{
    Algorithm, ClientId, FixedWindow, MemoryStorage, Quota, SlidingWindow, Storage, TokenBucket,
};

#[tokio::test]
async fn test_fixed_window_admits_rate_limit_plus_one() {
    let storage = MemoryStorage::new();
    let algorithm = FixedWindow::new();
    let quota = Quota::default();
    let client = ClientId::from("test:user");

    for i in 1..=quota.rate_limit() + 1 {
        let decision = algorithm
            .check_and_record(&storage, &client, &quota, 120_000 + i)
            .await
            .unwrap();
        assert!(decision.is_allowed(), "Request {} should be allowed", i);
    }

    let decision = algorithm
        .check_and_record(&storage, &client, &quota, 120_500)
        .await
        .unwrap();
    assert!(decision.is_denied(), "Request {} should be denied", quota.rate_limit() + 2);
    assert!(decision.info().retry_after.is_some(), "Should have retry_after");
}

#[tokio::test]
async fn test_fixed_window_rollover() {
    let storage = MemoryStorage::new();
    let algorithm = FixedWindow::new();
    let quota = Quota::default();
    let client = ClientId::from("test:user");

    for _ in 0..5 {
        algorithm.check_and_record(&storage, &client, &quota, 59_000).await.unwrap();
    }
    assert!(algorithm.check_and_record(&storage, &client, &quota, 59_999).await.unwrap().is_denied());

    // Window index 1 has its own counter
    let decision = algorithm.check_and_record(&storage, &client, &quota, 60_000).await.unwrap();
    assert!(decision.is_allowed(), "Should be allowed after the window rolls over");

    assert_eq!(storage.get("fixed-window:0:test:user").await.unwrap().as_deref(), Some("6"));
    assert_eq!(storage.get("fixed-window:1:test:user").await.unwrap().as_deref(), Some("1"));
}

#[tokio::test]
async fn test_sliding_window_denies_once_live_count_exceeds_limit() {
    let storage = MemoryStorage::new();
    let algorithm = SlidingWindow::new();
    let quota = Quota::default();
    let client = ClientId::from("test:user");

    let mut verdicts = Vec::new();
    for t in 0..8 {
        let decision = algorithm.check_and_record(&storage, &client, &quota, t).await.unwrap();
        verdicts.push(decision.is_allowed());
    }

    assert_eq!(verdicts, vec![true, true, true, true, false, false, false, false]);
    assert_eq!(storage.get("sliding-window:test:user").await.unwrap().as_deref(), Some("[0,1,2,3]"));
}

#[tokio::test]
async fn test_sliding_window_old_timestamps_never_count() {
    let storage = MemoryStorage::new();
    let algorithm = SlidingWindow::new();
    let quota = Quota::default();
    let client = ClientId::from("test:user");

    for t in [0, 10, 20, 30] {
        algorithm.check_and_record(&storage, &client, &quota, t).await.unwrap();
    }

    // t=0 and t=10 have left the window; two slots free up
    for t in [60_010, 60_011] {
        let decision = algorithm.check_and_record(&storage, &client, &quota, t).await.unwrap();
        assert!(decision.is_allowed(), "Request at t={} should be allowed", t);
    }
    assert!(algorithm.check_and_record(&storage, &client, &quota, 60_012).await.unwrap().is_denied());

    let raw = storage.get("sliding-window:test:user").await.unwrap().unwrap();
    assert_eq!(raw, "[20,30,60010,60011]");
}

#[tokio::test]
async fn test_token_bucket_refills_after_five_seconds() {
    let storage = MemoryStorage::new();
    let algorithm = TokenBucket::new();
    let quota = Quota::default();
    let client = ClientId::from("test:user");
    let start = 1_700_000_000_000;

    let decision = algorithm.check_and_record(&storage, &client, &quota, start).await.unwrap();
    assert!(decision.is_allowed());
    assert_eq!(decision.info().remaining, 2);

    let decision = algorithm
        .check_and_record(&storage, &client, &quota, start + 5_000)
        .await
        .unwrap();
    assert!(decision.is_allowed());
    assert_eq!(decision.info().remaining, 2);
}

#[tokio::test]
async fn test_token_bucket_level_stays_in_bounds() {
    let storage = MemoryStorage::new();
    let algorithm = TokenBucket::new();
    let quota = Quota::default();
    let client = ClientId::from("test:user");
    let key = "token-bucket:test:user";

    // Bursts, idle stretches and backwards clocks
    let times = [0, 0, 0, 0, 0, 1_000, 100_000, 100_000, 3_600_000, 50_000, 50_000, 50_000, 50_000];
    for now in times {
        algorithm.check_and_record(&storage, &client, &quota, now).await.unwrap();

        let raw = storage.get(key).await.unwrap().unwrap();
        let state = TokenBucketState::decode(key, &raw).unwrap();
        assert!(state.tokens <= quota.max_bucket_size(), "tokens {} over capacity", state.tokens);
    }
}

#[tokio::test]
async fn test_token_bucket_denied_has_retry_after() {
    let storage = MemoryStorage::new();
    let algorithm = TokenBucket::new();
    let quota = Quota::default().with_refill_rate(1.0);
    let client = ClientId::from("test:user");

    for _ in 0..3 {
        algorithm.check_and_record(&storage, &client, &quota, 0).await.unwrap();
    }
    let decision = algorithm.check_and_record(&storage, &client, &quota, 0).await.unwrap();
    assert!(decision.is_denied());
    assert_eq!(decision.info().retry_after, Some(Duration::from_secs(1)));
}

#[tokio::test]
async fn test_separate_clients_independent() {
    let storage = MemoryStorage::new();
    let algorithm = SlidingWindow::new();
    let quota = Quota::per_minute(2).strict();
    let first = ClientId::from("user:1");
    let second = ClientId::from("user:2");

    for _ in 0..2 {
        algorithm.check_and_record(&storage, &first, &quota, 0).await.unwrap();
    }
    let decision = algorithm.check_and_record(&storage, &first, &quota, 0).await.unwrap();
    assert!(decision.is_denied(), "user:1 should be rate limited");

    let decision = algorithm.check_and_record(&storage, &second, &quota, 0).await.unwrap();
    assert!(decision.is_allowed(), "user:2 should be allowed");
}

#[tokio::test]
async fn test_algorithm_reset() {
    let storage = MemoryStorage::new();
    let algorithm = TokenBucket::new();
    let quota = Quota::default();
    let client = ClientId::from("test:user");

    for _ in 0..4 {
        algorithm.check_and_record(&storage, &client, &quota, 0).await.unwrap();
    }
    assert!(algorithm.check(&storage, &client, &quota, 0).await.unwrap().is_denied());

    algorithm.reset(&storage, &client, &quota, 0).await.unwrap();
    assert!(algorithm.check_and_record(&storage, &client, &quota, 0).await.unwrap().is_allowed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sliding_window_admits_exactly_the_limit() {
    use std::sync::Arc;

    let storage = Arc::new(MemoryStorage::new());
    let quota = Quota::per_minute(5).strict();
    let client = ClientId::from("hot:client");

    let mut handles = Vec::new();
    for _ in 0..20 {
        let storage = Arc::clone(&storage);
        let quota = quota.clone();
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            // Only admitted requests write, so a task loses at most 5 races
            let algorithm = SlidingWindow::new().with_max_attempts(8);
            algorithm.check_and_record(&*storage, &client, &quota, 1_000).await.unwrap()
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);
}
