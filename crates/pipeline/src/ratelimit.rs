//! Fixed-window per-business rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tably_core::domain::content::BusinessId;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit_per_minute: u32,
    windows: Mutex<HashMap<BusinessId, WindowState>>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self { limit_per_minute, windows: Mutex::new(HashMap::new()) }
    }

    /// Admits the request or returns the seconds until the window resets.
    pub fn check(&self, business_id: &BusinessId) -> Result<(), u64> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let state = windows
            .entry(business_id.clone())
            .or_insert(WindowState { window_start: now, count: 0 });

        if now.duration_since(state.window_start) >= WINDOW {
            state.window_start = now;
            state.count = 0;
        }

        if state.count >= self.limit_per_minute {
            let elapsed = now.duration_since(state.window_start);
            let remaining = WINDOW.saturating_sub(elapsed);
            return Err(remaining.as_secs().max(1));
        }

        state.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tably_core::domain::content::BusinessId;

    use super::RateLimiter;

    fn business(id: &str) -> BusinessId {
        BusinessId(id.to_string())
    }

    #[test]
    fn admits_up_to_the_limit_then_rejects_with_retry_hint() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.check(&business("biz-1")).is_ok());
        }

        let retry_after = limiter.check(&business("biz-1")).expect_err("over limit");
        assert!(retry_after >= 1 && retry_after <= 60);
    }

    #[test]
    fn businesses_have_independent_windows() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check(&business("biz-1")).is_ok());
        assert!(limiter.check(&business("biz-2")).is_ok());
        assert!(limiter.check(&business("biz-1")).is_err());
    }
}
