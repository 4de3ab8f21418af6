use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::exchange::{BybitRest, RestError};

const PROBE_PAUSE_MS: u64 = 20;
const MAX_PROBES: usize = 9;

pub fn now_local_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("all server time probes failed: {0}")]
    AllProbesFailed(#[source] RestError),
}

/// Fixed local-to-exchange clock offset: `server_ms = local_ms + offset_ms`.
/// Sampled once per run; drift over a sub-minute session is below the
/// scheduling jitter budget.
#[derive(Debug, Clone, Copy)]
pub struct ServerClock {
    offset_ms: i64,
}

impl ServerClock {
    pub fn with_offset(offset_ms: i64) -> Self {
        Self { offset_ms }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    pub fn now_server_ms(&self) -> i64 {
        now_local_ms() + self.offset_ms
    }

    pub fn to_local_ms(&self, server_ms: i64) -> i64 {
        server_ms - self.offset_ms
    }

    /// Suspends until the given server-time instant. Coarse sleeps narrow
    /// into a sub-millisecond tail so wakeup lands within ~2ms, never early.
    pub async fn sleep_until_server_ms(&self, deadline_server_ms: i64) {
        let local_deadline = self.to_local_ms(deadline_server_ms);
        loop {
            let delta = local_deadline - now_local_ms();
            if delta <= 0 {
                return;
            }
            let nap = if delta > 1_500 {
                Duration::from_millis((delta - 800).max(50) as u64)
            } else if delta > 300 {
                Duration::from_millis((delta - 160).max(20) as u64)
            } else if delta > 80 {
                Duration::from_millis((delta - 40).max(5) as u64)
            } else if delta > 25 {
                Duration::from_millis((delta / 2) as u64)
            } else {
                Duration::from_micros(500)
            };
            sleep(nap).await;
        }
    }
}

/// Probes the exchange server time `samples` times and fixes the median of
/// `server_ms - (send_ms + recv_ms) / 2`.
pub async fn estimate_offset(rest: &BybitRest, samples: usize) -> Result<ServerClock, ClockError> {
    let samples = samples.clamp(1, MAX_PROBES);
    let mut offsets = Vec::with_capacity(samples);
    let mut last_error = None;

    for _ in 0..samples {
        let sent_ms = now_local_ms();
        match rest.server_time_ms().await {
            Ok(server_ms) => {
                let recv_ms = now_local_ms();
                offsets.push(server_ms - (sent_ms + recv_ms) / 2);
            }
            Err(error) => {
                debug!(error = %error, "server time probe failed");
                last_error = Some(error);
            }
        }
        sleep(Duration::from_millis(PROBE_PAUSE_MS)).await;
    }

    match median(&mut offsets) {
        Some(offset_ms) => Ok(ServerClock::with_offset(offset_ms)),
        None => Err(ClockError::AllProbesFailed(last_error.unwrap_or(
            RestError::MissingField("timeNano/timeSecond"),
        ))),
    }
}

impl crate::orchestrator::PayoutClock for ServerClock {
    fn now_server_ms(&self) -> i64 {
        ServerClock::now_server_ms(self)
    }

    async fn sleep_until_server_ms(&self, deadline_server_ms: i64) {
        ServerClock::sleep_until_server_ms(self, deadline_server_ms).await;
    }
}

fn median(offsets: &mut [i64]) -> Option<i64> {
    if offsets.is_empty() {
        return None;
    }
    offsets.sort_unstable();
    Some(offsets[offsets.len() / 2])
}
