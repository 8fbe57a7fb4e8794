//! Token bucket rate limiting middleware.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};

use crate::observability::metrics::Telemetry;

/// What a bucket is shared by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    /// One bucket for the whole listener.
    #[default]
    Global,
    /// One bucket per client IP.
    PerClient,
}

/// A simple token bucket rate limiter.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    /// Whether the bucket has refilled to `capacity`, which makes it
    /// indistinguishable from a fresh one.
    fn is_full(&self, now: Instant, capacity: f64, refill_rate: f64) -> bool {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens + elapsed * refill_rate >= capacity
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Bucket count at which full buckets are swept out.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug)]
struct Buckets {
    map: HashMap<String, TokenBucket>,
    sweep_at: usize,
}

/// Rate `rate` per second with `burst` capacity; starts full.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<Buckets>,
    rate: f64,
    burst: f64,
    key: RateLimitKey,
    sweep_threshold: usize,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32, key: RateLimitKey) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                map: HashMap::new(),
                sweep_at: SWEEP_THRESHOLD,
            }),
            rate,
            burst: burst as f64,
            key,
            sweep_threshold: SWEEP_THRESHOLD,
        }
    }

    /// Sweep refilled per-client buckets once `threshold` are held.
    pub fn with_sweep_threshold(mut self, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        self.sweep_threshold = threshold;
        self.buckets.get_mut().expect("rate limiter mutex poisoned").sweep_at = threshold;
        self
    }

    /// Buckets currently held.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("rate limiter mutex poisoned").map.len()
    }

    pub fn key(&self) -> RateLimitKey {
        self.key
    }

    /// Take one token from the bucket for `client`.
    pub fn check(&self, client: &str) -> bool {
        let bucket_key = match self.key {
            RateLimitKey::Global => "",
            RateLimitKey::PerClient => client,
        };
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        if !buckets.map.contains_key(bucket_key) && buckets.map.len() >= buckets.sweep_at {
            self.sweep(&mut buckets);
        }
        let bucket = buckets
            .map
            .entry(bucket_key.to_string())
            .or_insert_with(|| TokenBucket::new(self.burst));

        bucket.try_acquire(self.burst, self.rate)
    }

    /// Drop buckets that refilled to capacity. When most buckets are still
    /// draining, the next sweep waits for the map to double.
    fn sweep(&self, buckets: &mut Buckets) {
        let now = Instant::now();
        let before = buckets.map.len();
        buckets
            .map
            .retain(|_, bucket| !bucket.is_full(now, self.burst, self.rate));
        let kept = buckets.map.len();
        buckets.sweep_at = self.sweep_threshold.max(kept.saturating_mul(2));
        tracing::debug!(evicted = before - kept, kept, "Swept idle rate limit buckets");
    }
}

/// Middleware state: the limiter plus where to count rejections.
#[derive(Debug)]
pub struct RateLimiterState {
    pub limiter: RateLimiter,
    pub listener: &'static str,
    pub telemetry: Telemetry,
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<RateLimiterState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();

    if state.limiter.check(&client) {
        next.run(request).await
    } else {
        tracing::warn!(client = %client, listener = state.listener, "Rate limit exceeded");
        state.telemetry.record_rate_limited(state.listener);
        let mut response = Response::new(Body::from("Rate limit exceeded"));
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        response
    }
}
