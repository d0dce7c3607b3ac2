use tokio::{
    sync::Mutex,
    time::{sleep_until, Duration, Instant},
};

/// Enforces a minimum delay between two requests to the same endpoint.
///
/// One instance is shared by every swap polling that endpoint. Callers are
/// served one at a time; the mutex is held while waiting for the next slot.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        RateLimiter {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::from_secs(0))
    }

    pub async fn acquire(&self) {
        if self.min_interval == Duration::from_secs(0) {
            return;
        }

        let mut last_request = self.last_request.lock().await;

        if let Some(last) = *last_request {
            sleep_until(last + self.min_interval).await;
        }

        *last_request = Some(Instant::now());
    }
}
