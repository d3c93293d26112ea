// src/limiter.rs

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::models::{CredentialId, DestinationId};

type WindowKey = (CredentialId, DestinationId);

/// Sliding-window request quota per (credential, destination) pair.
///
/// Each key owns its own lock, so callers on unrelated keys never wait on
/// each other. Clones share the same registry.
#[derive(Clone)]
pub struct CredentialRateLimiter {
    windows: Arc<DashMap<WindowKey, Arc<Mutex<UsageWindow>>>>,
    max_requests: usize,
    window: Duration,
}

/// Timestamps of the requests admitted for one key, oldest first.
struct UsageWindow {
    admitted: VecDeque<Instant>,
}

impl UsageWindow {
    /// Drops timestamps that fell out of the trailing window.
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.admitted.front() {
            if now.duration_since(*oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

impl CredentialRateLimiter {
    /// Creates a limiter admitting `max_requests` per `window` for every key.
    /// A quota of 0 is treated as 1.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            max_requests: max_requests.max(1),
            window,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window())
    }

    /// Process-wide registry with the default quota (20 requests per 60s).
    pub fn global() -> &'static CredentialRateLimiter {
        static GLOBAL: OnceLock<CredentialRateLimiter> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::from_config(&RateLimitConfig::default()))
    }

    /// Waits until a request for this key is allowed, then records it.
    ///
    /// Never fails, only delays.
    pub async fn acquire(&self, credential: &CredentialId, destination: &DestinationId) {
        let key = (credential.clone(), destination.clone());
        // Clone the Arc so the map shard is not held across the await below.
        let window = self
            .windows
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(UsageWindow {
                    admitted: VecDeque::with_capacity(self.max_requests),
                }))
            })
            .clone();

        loop {
            let mut usage = window.lock().await;
            let now = Instant::now();
            usage.purge(now, self.window);

            if usage.admitted.len() < self.max_requests {
                usage.admitted.push_back(now);
                return;
            }

            let wait = match usage.admitted.front() {
                Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
                None => Duration::ZERO,
            };

            // Release the key before sleeping so other callers can re-check.
            drop(usage);
            tracing::debug!(
                credential = %credential,
                destination = %destination,
                wait_ms = wait.as_millis() as u64,
                "rate limit reached, waiting"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Number of requests currently counted inside the window for a key.
    pub async fn in_window(&self, credential: &CredentialId, destination: &DestinationId) -> usize {
        let key = (credential.clone(), destination.clone());
        let Some(window) = self.windows.get(&key).map(|w| w.clone()) else {
            return 0;
        };
        let mut usage = window.lock().await;
        usage.purge(Instant::now(), self.window);
        usage.admitted.len()
    }

    /// Removes keys whose window has emptied out.
    ///
    /// A key is kept while any caller still holds its window, including one
    /// sleeping inside [`acquire`](Self::acquire). Callers only obtain the
    /// window through the map, so a strong count of 1 means nobody else has it.
    pub fn purge_idle(&self) {
        let now = Instant::now();
        let window = self.window;
        self.windows.retain(|_, usage| {
            if Arc::strong_count(usage) > 1 {
                return true;
            }
            match usage.try_lock() {
                Ok(mut usage) => {
                    usage.purge(now, window);
                    !usage.admitted.is_empty()
                }
                Err(_) => true,
            }
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(c: &str, d: &str) -> (CredentialId, DestinationId) {
        (c.into(), d.into())
    }

    #[tokio::test]
    async fn admits_up_to_quota_immediately() {
        tokio::time::pause();
        let limiter = CredentialRateLimiter::new(20, Duration::from_secs(60));
        let (c, d) = key("bot-a", "chat");

        let start = Instant::now();
        for _ in 0..20 {
            limiter.acquire(&c, &d).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_window(&c, &d).await, 20);
    }

    #[tokio::test]
    async fn twenty_first_request_waits_for_window() {
        tokio::time::pause();
        let limiter = CredentialRateLimiter::new(20, Duration::from_secs(60));
        let (c, d) = key("bot-a", "chat");

        let start = Instant::now();
        for _ in 0..20 {
            limiter.acquire(&c, &d).await;
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed <= Duration::from_secs(1));

        limiter.acquire(&c, &d).await;
        // The first admission was at `start`, so the 21st cannot pass before start + 60s.
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() >= elapsed + Duration::from_secs(59));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        tokio::time::pause();
        let limiter = CredentialRateLimiter::new(2, Duration::from_secs(60));
        let (a, chat) = key("bot-a", "chat");
        let (b, other) = key("bot-b", "other");

        limiter.acquire(&a, &chat).await;
        limiter.acquire(&a, &chat).await;

        let start = Instant::now();
        limiter.acquire(&b, &chat).await;
        limiter.acquire(&a, &other).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.tracked_keys(), 3);
    }

    #[tokio::test]
    async fn concurrent_callers_never_exceed_quota() {
        tokio::time::pause();
        let limiter = CredentialRateLimiter::new(5, Duration::from_secs(10));
        let admitted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..17 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(&"bot".into(), &"chat".into()).await;
                admitted.lock().unwrap().push(Instant::now());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut times = admitted.lock().unwrap().clone();
        times.sort();
        assert_eq!(times.len(), 17);
        for (i, t) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .take_while(|other| other.duration_since(*t) < Duration::from_secs(10))
                .count();
            assert!(in_window <= 5, "window starting at {:?} admitted {in_window}", *t - start);
        }
        assert!(times[16].duration_since(start) >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn purge_idle_drops_expired_keys() {
        tokio::time::pause();
        let limiter = CredentialRateLimiter::new(3, Duration::from_secs(60));
        let (c, d) = key("bot-a", "chat");
        limiter.acquire(&c, &d).await;
        assert_eq!(limiter.tracked_keys(), 1);

        limiter.purge_idle();
        assert_eq!(limiter.tracked_keys(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.purge_idle();
        assert_eq!(limiter.tracked_keys(), 0);
        assert_eq!(limiter.in_window(&c, &d).await, 0);
    }

    #[tokio::test]
    async fn purge_idle_keeps_window_of_sleeping_caller() {
        tokio::time::pause();
        let limiter = CredentialRateLimiter::new(1, Duration::from_secs(10));
        let (c, d) = key("bot-a", "chat");
        limiter.acquire(&c, &d).await;

        let waiter = {
            let limiter = limiter.clone();
            let (c, d) = (c.clone(), d.clone());
            tokio::spawn(async move {
                limiter.acquire(&c, &d).await;
                Instant::now()
            })
        };
        // Let the waiter reach its sleep.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        limiter.purge_idle();
        assert_eq!(limiter.tracked_keys(), 1);

        limiter.acquire(&c, &d).await;
        let mine = Instant::now();
        let theirs = waiter.await.unwrap();
        let gap = if mine > theirs {
            mine.duration_since(theirs)
        } else {
            theirs.duration_since(mine)
        };
        assert!(gap >= Duration::from_secs(10), "two admissions {gap:?} apart");
    }

    #[test]
    fn global_uses_default_quota() {
        let limiter = CredentialRateLimiter::global();
        assert_eq!(limiter.max_requests(), 20);
        assert_eq!(limiter.window(), Duration::from_secs(60));
    }
}
