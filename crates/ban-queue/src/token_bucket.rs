use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Simple async token bucket: `capacity` tokens, refilled at `rate_per_sec`
/// tokens/second, used to pace calls into a single upstream integration so a
/// burst of bans can never exhaust its rate limit.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    rate_per_sec: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u64, rate_per_sec: u64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
            capacity: capacity as f64,
            rate_per_sec: rate_per_sec.max(1) as f64,
        }
    }

    /// Blocks until a token is available, then consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}
