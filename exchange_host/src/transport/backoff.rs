use std::time::Duration;

/// Reconnect backoff for the serial link.
///
/// Delays grow geometrically from `initial` by `factor` up to `cap`. The
/// schedule restarts on every successful connection.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_secs(1),
            factor: 1.5,
            cap: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn start(&self) -> BackoffInstance {
        BackoffInstance {
            next: self.initial.min(self.cap),
            factor: self.factor,
            cap: self.cap,
        }
    }
}

pub struct BackoffInstance {
    next: Duration,
    factor: f64,
    cap: Duration,
}

impl BackoffInstance {
    /// Returns the delay to wait before the next attempt and escalates the
    /// schedule.
    pub fn advance(&mut self) -> Duration {
        let delay = self.next;
        let escalated = self.next.mul_f64(self.factor);
        self.next = escalated.min(self.cap);
        delay
    }

    pub async fn wait(&mut self) {
        let delay = self.advance();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
