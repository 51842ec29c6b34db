use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};

/// Token bucket for new connections, refilled once per second.
#[derive(Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    fill_rate: u32,
    last_refill: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    pub fn new(fill_rate: u32) -> Self {
        let fill_rate = fill_rate.max(1);
        Self {
            permits: Arc::new(Semaphore::new(fill_rate as usize)),
            fill_rate,
            last_refill: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = self.refill().await;
            match self.permits.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    return;
                }
                Err(_) => sleep(wait).await,
            }
        }
    }

    /// Top the bucket up if a full second has passed and return the time
    /// left until the next refill.
    async fn refill(&self) -> Duration {
        let mut guard = self.last_refill.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(*guard);
        if elapsed >= Duration::from_secs(1) {
            let to_add = self
                .fill_rate
                .saturating_sub(self.permits.available_permits() as u32);
            if to_add > 0 {
                self.permits.add_permits(to_add as usize);
            }
            *guard = now;
            return Duration::from_secs(1);
        }
        Duration::from_secs(1) - elapsed
    }
}
