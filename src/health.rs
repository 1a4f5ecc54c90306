//! Health loop: periodic liveness checks and reconnect scheduling.
//!
//! A ticker pings every connected cluster and schedules reconnects for
//! anything that is failed or disconnected; child-exit events from the
//! supervisor schedule an immediate reconnect outside the tick cadence.
//! Per cluster there is at most one pending reconnect timer, delayed by an
//! exponential backoff that resets on success.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::events::EndpointEvent;
use crate::supervisor::{EndpointState, Supervisor};

/// Delay before the first reconnect attempt for a cluster.
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Reconnect delay for one cluster.
///
/// Holds the delay to use for the next attempt directly: it starts at
/// [`RECONNECT_BASE_DELAY`], doubles on every failed attempt, and saturates
/// at the configured ceiling. Success is modeled by dropping the value, so
/// the next incident starts over from the base.
#[derive(Debug, Clone)]
struct ReconnectBackoff {
    delay: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    fn new(max: Duration) -> Self {
        Self {
            delay: RECONNECT_BASE_DELAY.min(max),
            max,
        }
    }

    /// Delay to wait before the next attempt.
    fn delay(&self) -> Duration {
        self.delay
    }

    /// Record a failed attempt: the next delay doubles, capped at the
    /// ceiling.
    fn double(&mut self) {
        self.delay = self.delay.saturating_mul(2).min(self.max);
    }
}

/// Periodic liveness checker and reconnect driver.
///
/// Cheap to clone; clones share the same state, which is how the
/// background tasks reach back into the loop.
#[derive(Clone)]
pub struct HealthLoop {
    supervisor: Arc<Supervisor>,
    ping_interval: Duration,
    max_backoff: Duration,
    inner: Arc<Mutex<LoopState>>,
}

struct LoopState {
    running: bool,
    cancel: CancellationToken,
    /// Per-cluster reconnect backoff; absent means "start from the base".
    backoff: HashMap<String, ReconnectBackoff>,
    /// Clusters with an armed reconnect timer.
    pending: HashSet<String>,
}

impl HealthLoop {
    pub fn new(supervisor: Arc<Supervisor>, config: &Config) -> Self {
        Self {
            supervisor,
            ping_interval: config.ping_interval,
            max_backoff: config.max_reconnect_backoff,
            inner: Arc::new(Mutex::new(LoopState {
                running: false,
                cancel: CancellationToken::new(),
                backoff: HashMap::new(),
                pending: HashSet::new(),
            })),
        }
    }

    /// Start the ticker and the child-exit listener. No-op when running.
    pub fn start(&self) {
        let cancel = {
            let mut inner = self.inner.lock().unwrap();
            if inner.running {
                return;
            }
            inner.running = true;
            inner.cancel = CancellationToken::new();
            inner.cancel.clone()
        };
        info!(
            interval_secs = self.ping_interval.as_secs(),
            "health loop started"
        );

        // Child exits schedule a reconnect immediately instead of waiting
        // for the next tick.
        let mut events = self.supervisor.subscribe();
        let this = self.clone();
        let exit_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(EndpointEvent::ChildExited { cluster }) => {
                            this.schedule_reconnect(&cluster);
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = exit_cancel.cancelled() => break,
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.ping_interval);
            // A tick that fires while the previous one is still working is
            // dropped rather than queued.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        this.run_tick().await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Stop the ticker, cancel all pending reconnect timers, and clear the
    /// backoff state. No-op when already stopped.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.running {
            return;
        }
        inner.running = false;
        inner.cancel.cancel();
        inner.pending.clear();
        inner.backoff.clear();
        info!("health loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    /// Number of clusters with an armed reconnect timer.
    pub fn pending_reconnects(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    async fn run_tick(&self) {
        for status in self.supervisor.statuses().await {
            match status.state {
                EndpointState::Connected => {
                    if self.supervisor.ping(&status.url).await {
                        self.inner.lock().unwrap().backoff.remove(&status.url);
                    } else {
                        self.schedule_reconnect(&status.url);
                    }
                }
                EndpointState::Failed | EndpointState::Disconnected => {
                    self.schedule_reconnect(&status.url);
                }
                EndpointState::Connecting => {}
            }
        }
    }

    /// Arm a reconnect timer for the cluster.
    ///
    /// Idempotent: an already-armed timer is left alone. The delay is the
    /// cluster's current backoff (1 s when none is recorded).
    pub fn schedule_reconnect(&self, url: &str) {
        let (delay, cancel) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.running {
                return;
            }
            if !inner.pending.insert(url.to_string()) {
                return;
            }
            let max = self.max_backoff;
            let delay = inner
                .backoff
                .entry(url.to_string())
                .or_insert_with(|| ReconnectBackoff::new(max))
                .delay();
            (delay, inner.cancel.clone())
        };

        debug!(cluster = %url, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        let this = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    this.inner.lock().unwrap().pending.remove(&url);
                    return;
                }
            }
            this.inner.lock().unwrap().pending.remove(&url);
            if cancel.is_cancelled() {
                return;
            }

            if this.supervisor.reconnect(&url).await {
                this.inner.lock().unwrap().backoff.remove(&url);
            } else {
                if let Some(backoff) = this.inner.lock().unwrap().backoff.get_mut(&url) {
                    backoff.double();
                }
                this.schedule_reconnect(&url);
            }
        });
    }
}
