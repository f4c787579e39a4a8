use async_trait::async_trait;
use redis::AsyncCommands;
use redis_utils::SharedConnectionManager;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::error::{AppError, AppResult};

/// One sliding window after recording the current action: how many entries
/// the window holds and when its oldest entry happened.
#[derive(Debug, Clone, Copy)]
pub struct WindowSample {
    pub count: u64,
    pub oldest_ms: u64,
}

/// Shared counter backend for the sliding windows.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record an action at `now_ms` under `key`, drop entries older than the
    /// window, and return the resulting sample.
    async fn record_and_sample(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> AppResult<WindowSample>;
}

/// Redis sorted-set sliding window, atomic across service instances.
pub struct RedisCounterStore {
    redis: SharedConnectionManager,
}

impl RedisCounterStore {
    pub fn new(redis: SharedConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn record_and_sample(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> AppResult<WindowSample> {
        let mut conn = self.redis.lock().await;
        let member = format!("{now_ms}:{}", Uuid::new_v4());
        let floor = now_ms.saturating_sub(window_ms);

        let _: () = conn.zadd(key, member, now_ms).await?;
        let _: () = conn
            .zrembyscore(key, 0, floor as isize)
            .await?;
        let count: u64 = conn.zcard(key).await?;
        let oldest: Vec<(String, u64)> = conn.zrange_withscores(key, 0, 0).await?;
        // window entries expire on their own if the key goes quiet
        let ttl_secs = (window_ms / 1000).max(1) as i64;
        let _: () = conn.expire(key, ttl_secs).await?;

        let oldest_ms = oldest.first().map(|(_, score)| *score).unwrap_or(now_ms);
        Ok(WindowSample { count, oldest_ms })
    }
}

/// In-process sliding window for tests and single-node dev.
#[derive(Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn record_and_sample(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> AppResult<WindowSample> {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_string()).or_default();
        let floor = now_ms.saturating_sub(window_ms);
        while window.front().is_some_and(|&t| t <= floor) {
            window.pop_front();
        }
        window.push_back(now_ms);
        Ok(WindowSample {
            count: window.len() as u64,
            oldest_ms: *window.front().unwrap_or(&now_ms),
        })
    }
}

/// Two simultaneous sliding windows per action: one keyed by sender, one by
/// conversation. Both are recorded before evaluation, so a burst that trips
/// a limit still counts toward the window.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn retry_after_secs(oldest_ms: u64, now_ms: u64, window_ms: u64) -> u64 {
        // The binding window clears when its oldest entry falls out.
        let free_at = oldest_ms + window_ms;
        let wait_ms = free_at.saturating_sub(now_ms);
        (wait_ms / 1000).max(1)
    }

    /// Admit or reject one action by `user_id` in `conversation_id`.
    pub async fn check_and_record(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<()> {
        let now_ms = Self::now_ms();
        let window_ms = self.config.window_secs * 1000;

        let user = self
            .store
            .record_and_sample(&format!("rl:user:{user_id}"), now_ms, window_ms)
            .await?;
        let conversation = self
            .store
            .record_and_sample(&format!("rl:conv:{conversation_id}"), now_ms, window_ms)
            .await?;

        let mut retry_after: Option<u64> = None;
        if user.count > self.config.user_max_per_window {
            retry_after = Some(Self::retry_after_secs(user.oldest_ms, now_ms, window_ms));
        }
        if conversation.count > self.config.conversation_max_per_window {
            let conv_retry = Self::retry_after_secs(conversation.oldest_ms, now_ms, window_ms);
            retry_after = Some(retry_after.map_or(conv_retry, |r| r.max(conv_retry)));
        }

        match retry_after {
            Some(retry_after_secs) => Err(AppError::RateLimited { retry_after_secs }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(user_max: u64, conv_max: u64) -> RateLimiter {
        RateLimiter::new(
            MemoryCounterStore::new(),
            RateLimitConfig {
                user_max_per_window: user_max,
                conversation_max_per_window: conv_max,
                window_secs: 60,
            },
        )
    }

    #[tokio::test]
    async fn actions_under_the_limit_pass() {
        let limiter = limiter(30, 100);
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();
        for _ in 0..30 {
            limiter.check_and_record(user, conv).await.unwrap();
        }
    }

    #[tokio::test]
    async fn thirty_first_action_is_rate_limited_with_positive_retry_after() {
        let limiter = limiter(30, 100);
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();
        for _ in 0..30 {
            limiter.check_and_record(user, conv).await.unwrap();
        }
        match limiter.check_and_record(user, conv).await {
            Err(AppError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs >= 1);
                assert!(retry_after_secs <= 60);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conversation_window_binds_across_users() {
        let limiter = limiter(1000, 5);
        let conv = Uuid::new_v4();
        for _ in 0..5 {
            limiter
                .check_and_record(Uuid::new_v4(), conv)
                .await
                .unwrap();
        }
        let err = limiter
            .check_and_record(Uuid::new_v4(), conv)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn separate_users_have_separate_windows() {
        let limiter = limiter(2, 100);
        let conv = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        limiter.check_and_record(alice, conv).await.unwrap();
        limiter.check_and_record(alice, conv).await.unwrap();
        limiter.check_and_record(bob, conv).await.unwrap();
    }

    #[tokio::test]
    async fn memory_window_evicts_expired_entries() {
        let store = MemoryCounterStore::new();
        store.record_and_sample("k", 1_000, 60_000).await.unwrap();
        let sample = store.record_and_sample("k", 62_000, 60_000).await.unwrap();
        assert_eq!(sample.count, 1);
        assert_eq!(sample.oldest_ms, 62_000);
    }
}
