/*
    Middleware - Inbound message checks run before the core sees a message

    Steps run in registration order. The first rejection short-circuits and the
    message is dropped with a logged reason. A step that errors or panics
    counts as a rejection.

    Also provides `RateLimit`, a per-channel token bucket.
*/

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::trace;

use crate::core_sync::{ChannelId, ChannelMsg};

/// Outcome of one middleware step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in rejection reasons
    fn name(&self) -> &str;

    async fn check(&self, channel_id: ChannelId, message: &ChannelMsg) -> anyhow::Result<Verdict>;
}

/// Ordered list of steps shared by every channel of a host
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    steps: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<M: Middleware + 'static>(mut self, step: M) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn push(&mut self, step: Arc<dyn Middleware>) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn evaluate(&self, channel_id: ChannelId, message: &ChannelMsg) -> Verdict {
        for step in &self.steps {
            let outcome = AssertUnwindSafe(step.check(channel_id, message))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(Verdict::Accept)) => {
                    trace!(step = step.name(), channel = %channel_id, "middleware accepted");
                }
                Ok(Ok(Verdict::Reject(reason))) => {
                    return Verdict::Reject(format!("{}: {}", step.name(), reason));
                }
                Ok(Err(e)) => {
                    return Verdict::Reject(format!("{} failed: {}", step.name(), e));
                }
                Err(_) => {
                    return Verdict::Reject(format!("{} panicked", step.name()));
                }
            }
        }
        Verdict::Accept
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("MiddlewareChain").field("steps", &names).finish()
    }
}

/// Token bucket for a single channel
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: u32) -> Self {
        TokenBucket {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate: refill_rate as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rejects messages from a channel once its burst allowance is used up
#[derive(Debug)]
pub struct RateLimit {
    burst_size: u32,
    per_second: u32,
    buckets: Mutex<HashMap<ChannelId, TokenBucket>>,
}

impl RateLimit {
    pub fn new(burst_size: u32, per_second: u32) -> Self {
        RateLimit {
            burst_size,
            per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Middleware for RateLimit {
    fn name(&self) -> &str {
        "rate-limit"
    }

    async fn check(&self, channel_id: ChannelId, _message: &ChannelMsg) -> anyhow::Result<Verdict> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(channel_id)
            .or_insert_with(|| TokenBucket::new(self.burst_size, self.per_second));
        if bucket.try_consume() {
            Ok(Verdict::Accept)
        } else {
            Ok(Verdict::Reject(format!("{} exceeded its message rate", channel_id)))
        }
    }
}
