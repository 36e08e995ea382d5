//! Latency probing and link quality scoring.
//!
//! [`HealthTracker`] is the pure part: feed it probe outcomes with a
//! timestamp and it keeps [`HealthMetrics`] current. [`HealthMonitor`] drives
//! it from a timer while the link is up.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::config::{HealthConfig, QualityThresholds};
use crate::connections::errors::ConnectionError;
use crate::connections::transport::TransportConnection;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
    #[default]
    Unknown,
}

impl ConnectionQuality {
    pub fn from_latency(latency_ms: f64, thresholds: &QualityThresholds) -> Self {
        if latency_ms < thresholds.excellent_ms {
            ConnectionQuality::Excellent
        } else if latency_ms < thresholds.good_ms {
            ConnectionQuality::Good
        } else if latency_ms < thresholds.fair_ms {
            ConnectionQuality::Fair
        } else if latency_ms < thresholds.poor_ms {
            ConnectionQuality::Poor
        } else {
            ConnectionQuality::Critical
        }
    }

    fn base_score(self) -> u8 {
        match self {
            ConnectionQuality::Excellent => 100,
            ConnectionQuality::Good => 85,
            ConnectionQuality::Fair => 65,
            ConnectionQuality::Poor => 40,
            ConnectionQuality::Critical => 15,
            ConnectionQuality::Unknown => 50,
        }
    }
}

const FAILURE_PENALTY: u8 = 25;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthMetrics {
    /// Smoothed round-trip time; `None` until the first successful probe.
    pub latency_ms: Option<f64>,
    pub quality: ConnectionQuality,
    pub consecutive_failures: u32,
    pub last_check: Option<SystemTime>,
    /// 0..=100, derived from `quality` and `consecutive_failures`.
    pub score: u8,
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    config: HealthConfig,
    metrics: HealthMetrics,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        let mut tracker = Self {
            config,
            metrics: HealthMetrics::default(),
        };
        tracker.rescore();
        tracker
    }

    pub fn metrics(&self) -> &HealthMetrics {
        &self.metrics
    }

    pub fn record_success(&mut self, latency: Duration, at: SystemTime) -> &HealthMetrics {
        let sample = latency.as_micros() as f64 / 1000.0;
        let alpha = self.config.smoothing.clamp(0.0, 1.0);
        let smoothed = match self.metrics.latency_ms {
            Some(previous) => alpha * sample + (1.0 - alpha) * previous,
            None => sample,
        };
        self.metrics.latency_ms = Some(smoothed);
        self.metrics.consecutive_failures = 0;
        self.metrics.last_check = Some(at);
        self.rescore();
        &self.metrics
    }

    /// Returns `true` on the probe that crosses the failure threshold.
    pub fn record_failure(&mut self, at: SystemTime) -> bool {
        self.metrics.consecutive_failures = self.metrics.consecutive_failures.saturating_add(1);
        self.metrics.last_check = Some(at);
        self.rescore();
        self.metrics.consecutive_failures == self.config.failure_threshold.max(1)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.metrics.consecutive_failures >= self.config.failure_threshold.max(1)
    }

    fn rescore(&mut self) {
        let quality = if self.is_unhealthy() {
            ConnectionQuality::Critical
        } else {
            match self.metrics.latency_ms {
                Some(ms) => ConnectionQuality::from_latency(ms, &self.config.thresholds),
                None => ConnectionQuality::Unknown,
            }
        };
        let penalty = FAILURE_PENALTY.saturating_mul(self.metrics.consecutive_failures.min(4) as u8);
        self.metrics.quality = quality;
        self.metrics.score = quality.base_score().saturating_sub(penalty);
    }
}

/// Something that can measure a round trip to the backend.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn probe(&self) -> Result<Duration, ConnectionError>;
}

#[async_trait]
impl LatencyProbe for TransportConnection {
    async fn probe(&self) -> Result<Duration, ConnectionError> {
        self.ping().await
    }
}

/// Raised by the monitor for the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    Unhealthy { link: u64, consecutive_failures: u32 },
}

/// Periodic prober bound to one open link.
pub struct HealthMonitor {
    link: u64,
    probe: Arc<dyn LatencyProbe>,
    tracker: HealthTracker,
    probe_interval: Duration,
    probe_timeout: Duration,
    metrics_tx: watch::Sender<HealthMetrics>,
    signal_tx: mpsc::UnboundedSender<HealthSignal>,
}

impl HealthMonitor {
    pub fn new(
        link: u64,
        probe: Arc<dyn LatencyProbe>,
        config: HealthConfig,
        metrics_tx: watch::Sender<HealthMetrics>,
        signal_tx: mpsc::UnboundedSender<HealthSignal>,
    ) -> Self {
        Self {
            link,
            probe,
            probe_interval: config.probe_interval,
            probe_timeout: config.probe_timeout,
            tracker: HealthTracker::new(config),
            metrics_tx,
            signal_tx,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Probes are awaited inline, so at most one is ever in flight; ticks
    /// that fall due meanwhile are skipped rather than queued.
    pub async fn run(mut self) {
        let mut ticker = interval(self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.metrics_tx.send_replace(self.tracker.metrics().clone());
        loop {
            ticker.tick().await;
            let outcome = match timeout(self.probe_timeout, self.probe.probe()).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::timeout("health probe")),
            };
            let now = SystemTime::now();
            match outcome {
                Ok(latency) => {
                    let metrics = self.tracker.record_success(latency, now);
                    debug!(
                        "Probe on link {}: {:?} (smoothed {:.1} ms, {:?})",
                        self.link, latency, metrics.latency_ms.unwrap_or_default(), metrics.quality
                    );
                }
                Err(e) => {
                    let crossed = self.tracker.record_failure(now);
                    let failures = self.tracker.metrics().consecutive_failures;
                    warn!("Probe on link {} failed ({} in a row): {}", self.link, failures, e);
                    if crossed {
                        let _ = self.signal_tx.send(HealthSignal::Unhealthy {
                            link: self.link,
                            consecutive_failures: failures,
                        });
                    }
                }
            }
            self.metrics_tx.send_replace(self.tracker.metrics().clone());
        }
    }
}
