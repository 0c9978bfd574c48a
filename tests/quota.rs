//! Integration tests for quota configuration.

use admit_ratelimit::{Quota, QuotaBuilder};
use std::time::Duration;

#[test]
fn test_quota_default_parameters() {
    let quota = Quota::default();
    assert_eq!(quota.rate_limit(), 3);
    assert_eq!(quota.window(), Duration::from_secs(60));
    assert_eq!(quota.max_bucket_size(), 3);
    assert!((quota.refill_rate() - 0.2).abs() < f64::EPSILON);
}

#[test]
fn test_quota_per_minute() {
    let quota = Quota::per_minute(60);
    assert_eq!(quota.rate_limit(), 60);
    assert_eq!(quota.window(), Duration::from_secs(60));
    assert!((quota.refill_rate() - 1.0).abs() < f64::EPSILON);
}

#[test]
fn test_quota_custom_window() {
    let quota = Quota::new(100, Duration::from_secs(300)); // 100 per 5 minutes
    assert_eq!(quota.rate_limit(), 100);
    assert_eq!(quota.window_ms(), 300_000);
}

#[test]
fn test_quota_bucket_overrides() {
    let quota = Quota::per_second(10).with_bucket_size(20).with_refill_rate(5.0);
    assert_eq!(quota.rate_limit(), 10);
    assert_eq!(quota.max_bucket_size(), 20);
    assert_eq!(quota.bucket_refill_time(), Some(Duration::from_secs(4)));
}

#[test]
fn test_quota_try_new_rejects_zero() {
    assert!(Quota::try_new(0, Duration::from_secs(1)).is_err());
    assert!(Quota::try_new(1, Duration::ZERO).is_err());
    assert!(Quota::try_new(1, Duration::from_millis(1)).is_ok());
}

#[test]
fn test_quota_builder() {
    let quota = QuotaBuilder::new()
        .rate_limit(50)
        .window(Duration::from_secs(60))
        .max_bucket_size(100)
        .refill_rate(2.5)
        .strict()
        .build()
        .unwrap();

    assert_eq!(quota.rate_limit(), 50);
    assert_eq!(quota.window(), Duration::from_secs(60));
    assert_eq!(quota.max_bucket_size(), 100);
    assert!(quota.is_strict());
    assert_eq!(quota.admitted_per_window(), 50);
}

#[test]
fn test_quota_builder_rejects_negative_refill() {
    let result = QuotaBuilder::new()
        .rate_limit(5)
        .window(Duration::from_secs(1))
        .refill_rate(-0.5)
        .build();
    assert!(result.is_err());
}
