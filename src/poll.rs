//! Optional waiting helpers.
//!
//! The core never sleeps or retries. Callers that want to block until a
//! dataset or calculation settles can use [`watch`] or
//! [`wait_until_settled`], which repeat single-round-trip refreshes with
//! exponential backoff.

use crate::config::PollSettings;
use crate::error::{Error, Result};
use crate::state::{Refresh, ResourceState};
use async_stream::try_stream;
use futures::stream::Stream;
use futures::{pin_mut, StreamExt};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_interval)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from(&PollSettings {
            interval_ms: 500,
            max_interval_ms: 8_000,
            timeout_secs: 120,
        })
    }
}

impl From<&PollSettings> for PollPolicy {
    fn from(settings: &PollSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.interval_ms),
            max_interval: Duration::from_millis(settings.max_interval_ms.max(settings.interval_ms)),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }
}

/// Refreshes `resource` until it settles, yielding every observed state.
/// The stream ends after the first settled state and fails with
/// [`Error::Timeout`] once `policy.timeout` has passed.
pub fn watch<'a, R>(resource: &'a mut R, policy: PollPolicy) -> impl Stream<Item = Result<ResourceState>> + 'a
where
    R: Refresh + 'a,
{
    try_stream! {
        let deadline = Instant::now() + policy.timeout;
        let mut interval = policy.interval;

        loop {
            let state = resource.refresh().await?;
            debug!(resource = %resource.describe(), %state, "polled");
            yield state;

            if state.is_settled() {
                break;
            }
            if Instant::now() + interval > deadline {
                Err::<(), Error>(Error::Timeout(resource.describe()))?;
            }
            sleep(interval).await;
            interval = policy.next_interval(interval);
        }
    }
}

/// First settled state of `resource`.
pub async fn wait_until_settled<R: Refresh>(resource: &mut R, policy: PollPolicy) -> Result<ResourceState> {
    let describe = resource.describe();
    let states = watch(resource, policy);
    pin_mut!(states);

    let mut last = None;
    while let Some(state) = states.next().await {
        last = Some(state?);
    }
    last.filter(ResourceState::is_settled)
        .ok_or(Error::Timeout(describe))
}
