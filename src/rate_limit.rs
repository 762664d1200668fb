//! HTTP request rate limiting and the scheduler's agent dispatch limiter,
//! both built on `governor`, keyed per-client (IP or agent) via `governor`'s
//! keyed state store, since a single shared hub serves many distinct
//! clients and agents rather than one.

use axum::{
    extract::{ConnectInfo, Request},
    http::{Method, StatusCode},
    middleware::Next,
    response::Response,
};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

pub const HTTP_REQUESTS_PER_MINUTE: u32 = 120;
pub const TASK_SUBMIT_REQUESTS_PER_MINUTE: u32 = 20;
pub const AGENT_ASSIGNMENTS_PER_MINUTE: u32 = 30;

type KeyedLimiter = GovernorRateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Per-client-IP HTTP request limiting, applied as axum middleware.
pub struct HttpRateLimiter {
    general: KeyedLimiter,
    task_submit: KeyedLimiter,
}

impl HttpRateLimiter {
    pub fn new() -> Self {
        Self {
            general: GovernorRateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(HTTP_REQUESTS_PER_MINUTE).unwrap(),
            )),
            task_submit: GovernorRateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(TASK_SUBMIT_REQUESTS_PER_MINUTE).unwrap(),
            )),
        }
    }

    pub fn check_general(&self, key: &str) -> bool {
        self.general.check_key(&key.to_string()).is_ok()
    }

    pub fn check_task_submit(&self, key: &str) -> bool {
        self.task_submit.check_key(&key.to_string()).is_ok()
    }
}

impl Default for HttpRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::State(limiter): axum::extract::State<Arc<HttpRateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = extract_client_ip(&request).unwrap_or_else(|| addr.ip().to_string());
    let is_task_submit = request.uri().path() == "/tasks" && request.method() == Method::POST;

    let allowed = if is_task_submit {
        limiter.check_task_submit(&ip)
    } else {
        limiter.check_general(&ip)
    };

    if !allowed {
        warn!("rate limit exceeded for {} on {}", ip, request.uri().path());
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}

pub fn extract_client_ip(request: &Request) -> Option<String> {
    if let Some(forwarded_for) = request.headers().get("x-forwarded-for") {
        if let Ok(ip_str) = forwarded_for.to_str() {
            if let Some(first_ip) = ip_str.split(',').next() {
                return Some(first_ip.trim().to_string());
            }
        }
    }
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return Some(ip_str.to_string());
        }
    }
    None
}

/// Caps how often an individual agent can be dispatched a new task,
/// independent of HTTP traffic — the Scheduler consults this to filter its
/// idle-agent snapshot. A generous default quota means this only engages
/// against a misbehaving or thrashing agent, not normal operation.
pub struct AgentRateLimiter {
    limiter: KeyedLimiter,
}

impl AgentRateLimiter {
    pub fn new() -> Self {
        Self {
            limiter: GovernorRateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(AGENT_ASSIGNMENTS_PER_MINUTE).unwrap(),
            )),
        }
    }

    /// True if this agent has exceeded its assignment quota and should be
    /// excluded from the idle set for this round.
    pub fn is_limited(&self, agent_id: &str) -> bool {
        self.limiter.check_key(&agent_id.to_string()).is_err()
    }
}

impl Default for AgentRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_limiter_allows_initial_requests() {
        let limiter = HttpRateLimiter::new();
        assert!(limiter.check_general("1.2.3.4"));
        assert!(limiter.check_task_submit("1.2.3.4"));
    }

    #[test]
    fn http_limiter_tracks_keys_independently() {
        let limiter = HttpRateLimiter::new();
        for _ in 0..TASK_SUBMIT_REQUESTS_PER_MINUTE {
            assert!(limiter.check_task_submit("a"));
        }
        assert!(!limiter.check_task_submit("a"));
        assert!(limiter.check_task_submit("b"));
    }

    #[test]
    fn agent_rate_limiter_exhausts_quota() {
        let limiter = AgentRateLimiter::new();
        for _ in 0..AGENT_ASSIGNMENTS_PER_MINUTE {
            assert!(!limiter.is_limited("agent-1"));
        }
        assert!(limiter.is_limited("agent-1"));
    }
}
