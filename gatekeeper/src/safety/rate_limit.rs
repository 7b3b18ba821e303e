//! Sliding-window rate limiting per operation category.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::core::types::RateCategory;
use crate::io::config::{RateLimit, RateLimitsConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limit for {category} exhausted; retry after {}s", .retry_after.as_secs().max(1))]
pub struct RateLimitExceeded {
    pub category: RateCategory,
    pub retry_after: Duration,
}

struct Window {
    limit: RateLimit,
    entries: Mutex<VecDeque<Instant>>,
}

impl Window {
    fn prune(entries: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(front) = entries.front() {
            if now.saturating_duration_since(*front) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn exceeded(
        &self,
        category: RateCategory,
        entries: &VecDeque<Instant>,
        now: Instant,
    ) -> Option<RateLimitExceeded> {
        if entries.len() < self.limit.max_requests as usize {
            return None;
        }
        let retry_after = entries
            .front()
            .map(|oldest| (*oldest + self.limit.window()).saturating_duration_since(now))
            .unwrap_or_default();
        Some(RateLimitExceeded {
            category,
            retry_after,
        })
    }
}

/// Independent sliding windows, one per [`RateCategory`].
pub struct RateLimiter {
    windows: BTreeMap<RateCategory, Window>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitsConfig) -> Self {
        let windows = RateCategory::ALL
            .into_iter()
            .map(|category| {
                (
                    category,
                    Window {
                        limit: config.limit_for(category),
                        entries: Mutex::new(VecDeque::new()),
                    },
                )
            })
            .collect();
        Self { windows }
    }

    /// Peek: would one more request in `category` be admitted at `now`?
    pub fn check_at(&self, category: RateCategory, now: Instant) -> Result<(), RateLimitExceeded> {
        let Some(window) = self.windows.get(&category) else {
            return Ok(());
        };
        let Ok(mut entries) = window.entries.lock() else {
            return Err(poisoned(category));
        };
        Window::prune(&mut entries, window.limit.window(), now);
        match window.exceeded(category, &entries, now) {
            Some(exceeded) => Err(exceeded),
            None => Ok(()),
        }
    }

    /// Record one request, or refuse without recording anything.
    pub fn try_acquire_at(
        &self,
        category: RateCategory,
        now: Instant,
    ) -> Result<(), RateLimitExceeded> {
        let Some(window) = self.windows.get(&category) else {
            return Ok(());
        };
        let Ok(mut entries) = window.entries.lock() else {
            return Err(poisoned(category));
        };
        Window::prune(&mut entries, window.limit.window(), now);
        if let Some(exceeded) = window.exceeded(category, &entries, now) {
            debug!(category = category.as_str(), "rate window full");
            return Err(exceeded);
        }
        entries.push_back(now);
        Ok(())
    }

    /// Undo a reservation made at `at` by [`Self::try_acquire_at`].
    pub fn release_at(&self, category: RateCategory, at: Instant) {
        let Some(window) = self.windows.get(&category) else {
            return;
        };
        if let Ok(mut entries) = window.entries.lock()
            && let Some(pos) = entries.iter().rposition(|t| *t == at)
        {
            entries.remove(pos);
        }
    }

    /// `(entries in window, max_requests)` at `now`.
    pub fn usage_at(&self, category: RateCategory, now: Instant) -> (usize, u32) {
        let Some(window) = self.windows.get(&category) else {
            return (0, 0);
        };
        let used = window
            .entries
            .lock()
            .map(|mut entries| {
                Window::prune(&mut entries, window.limit.window(), now);
                entries.len()
            })
            .unwrap_or(0);
        (used, window.limit.max_requests)
    }
}

// A poisoned window fails closed.
fn poisoned(category: RateCategory) -> RateLimitExceeded {
    RateLimitExceeded {
        category,
        retry_after: Duration::ZERO,
    }
}
