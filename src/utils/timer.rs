//! A restartable one-shot timer built on `tokio::time::Sleep`.
//!
//! Used anywhere a loop needs "fire once after a duration, but let some
//! other event push the fire time back out" — the client session's
//! pong-timeout watchdog has this shape.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Instant, Sleep};

pub struct Timer {
    duration: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl Timer {
    pub fn new(duration: Duration) -> Self {
        Timer {
            duration,
            sleep: Box::pin(sleep(duration)),
        }
    }

    /// Pushes the fire time out to `duration` from now.
    pub fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.duration);
    }

    /// Resolves once the timer fires.
    pub async fn fired(&mut self) {
        self.sleep.as_mut().await
    }
}
