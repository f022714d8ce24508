//! Per-client fixed-window rate limiting.
//!
//! State is kept per `(client_ip, endpoint)` pair and updated under the
//! entry lock. Exactly `max` requests are admitted per window; every
//! decision carries the `X-RateLimit-*` header values.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone)]
struct WindowState {
    remaining: i64,
    reset_at: SystemTime,
}

/// Outcome of one rate-limit check, including the response header values.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    /// Window reset time as Unix seconds.
    pub reset_unix: u64,
}

#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<(String, String), WindowState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or reject one request from `client_ip` against `endpoint_id`.
    pub fn check(
        &self,
        client_ip: &str,
        endpoint_id: &str,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        self.check_at(client_ip, endpoint_id, config, SystemTime::now())
    }

    fn check_at(
        &self,
        client_ip: &str,
        endpoint_id: &str,
        config: &RateLimitConfig,
        now: SystemTime,
    ) -> RateLimitDecision {
        let key = (client_ip.to_string(), endpoint_id.to_string());
        let interval = Duration::from_secs(config.interval);

        let mut entry = self.windows.entry(key).or_insert_with(|| WindowState {
            remaining: config.max,
            reset_at: now + interval,
        });
        let state = entry.value_mut();

        if now >= state.reset_at {
            state.remaining = config.max;
            state.reset_at = now + interval;
        }

        let reset_unix = state
            .reset_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if state.remaining > 0 {
            state.remaining -= 1;
            RateLimitDecision {
                allowed: true,
                limit: config.max,
                remaining: state.remaining,
                reset_unix,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                limit: config.max,
                remaining: 0,
                reset_unix,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: i64, interval: u64) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            max,
            interval,
        }
    }

    #[test]
    fn test_exactly_max_requests_admitted() {
        let limiter = RateLimiter::new();
        let config = config(3, 60);

        let d1 = limiter.check("10.0.0.1", "/users", &config);
        let d2 = limiter.check("10.0.0.1", "/users", &config);
        let d3 = limiter.check("10.0.0.1", "/users", &config);
        let d4 = limiter.check("10.0.0.1", "/users", &config);

        assert!(d1.allowed && d2.allowed && d3.allowed);
        assert_eq!((d1.remaining, d2.remaining, d3.remaining), (2, 1, 0));
        assert!(!d4.allowed);
        assert_eq!(d4.remaining, 0);
        assert_eq!(d4.limit, 3);
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new();
        let config = config(1, 60);

        assert!(limiter.check("10.0.0.1", "/users", &config).allowed);
        assert!(!limiter.check("10.0.0.1", "/users", &config).allowed);
        assert!(limiter.check("10.0.0.2", "/users", &config).allowed);
    }

    #[test]
    fn test_endpoints_are_independent() {
        let limiter = RateLimiter::new();
        let config = config(1, 60);

        assert!(limiter.check("10.0.0.1", "/users", &config).allowed);
        assert!(limiter.check("10.0.0.1", "/orders", &config).allowed);
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new();
        let config = config(2, 60);
        let start = SystemTime::now();

        assert!(limiter.check_at("ip", "/x", &config, start).allowed);
        assert!(limiter.check_at("ip", "/x", &config, start).allowed);
        assert!(!limiter.check_at("ip", "/x", &config, start).allowed);

        let later = start + Duration::from_secs(61);
        let decision = limiter.check_at("ip", "/x", &config, later);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_reset_header_is_window_end() {
        let limiter = RateLimiter::new();
        let config = config(5, 60);
        let start = SystemTime::now();

        let decision = limiter.check_at("ip", "/x", &config, start);
        let expected = (start + Duration::from_secs(60))
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(decision.reset_unix, expected);
    }
}
