use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(350);

/// Interval gate for progress emissions. The first event always passes, and
/// so does the final one regardless of timing.
#[derive(Debug, Clone)]
pub struct ProgressGate {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self, now: Instant, is_last: bool) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        };
        if due || is_last {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}

impl Default for ProgressGate {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}
