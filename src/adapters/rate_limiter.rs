use std::time::Duration;

use error_stack::Report;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ports::{ProviderError, ProviderResult};

pub const DEFAULT_PENALTY: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct LimiterState {
    next_slot: Option<Instant>,
    blocked_until: Option<Instant>,
}

/// Per-client request pacing. Requests are spaced by `1 / requests_per_second`, and after the
/// provider answers 429 every call fails fast with `RateLimited` until the penalty window ends.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Option<Duration>,
    penalty: Duration,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(requests_per_second: Option<f64>, penalty: Duration) -> Self {
        let min_interval = requests_per_second
            .filter(|rps| rps.is_finite() && *rps > 0.0)
            .map(|rps| Duration::from_secs_f64(1.0 / rps));
        Self {
            min_interval,
            penalty,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, DEFAULT_PENALTY)
    }

    pub async fn acquire(&self) -> ProviderResult<()> {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            if let Some(until) = state.blocked_until {
                if until > now {
                    return Err(Report::new(ProviderError::RateLimited)
                        .attach_printable(format!("Backing off for another {:?}", until - now)));
                }
                state.blocked_until = None;
            }
            match self.min_interval {
                Some(interval) => {
                    let slot = state.next_slot.map_or(now, |next| next.max(now));
                    state.next_slot = Some(slot + interval);
                    slot - now
                }
                None => Duration::ZERO,
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    /// Called when the provider reports that we exceeded its quota.
    pub async fn penalize(&self) {
        let mut state = self.state.lock().await;
        state.blocked_until = Some(Instant::now() + self.penalty);
    }
}
