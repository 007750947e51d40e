//! Fixed-backoff retry for request/response collaborators.

use crate::error::VoiceResult;
use parley_core::CallSettings;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; zero behaves like one.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn for_classifier(settings: &CallSettings) -> Self {
        Self {
            max_attempts: settings.classifier_max_attempts,
            backoff: Duration::from_millis(settings.classifier_backoff_ms),
        }
    }

    /// Run `op` until it succeeds or the attempts are used up; the last error is returned.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> VoiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VoiceResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts => {
                    warn!(operation, attempt, error = %err, "attempt failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
