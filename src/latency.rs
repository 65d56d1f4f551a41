//! Latency prober: user-visible connection quality.
//!
//! Runs a trivial remote command per transport on a fixed cadence and keeps
//! a small rolling window of samples. Deliberately separate from the pool's
//! health checker: this publishes quality to the surface, the health checker
//! drives eviction and stays quiet.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{LatencyOptions, TabId};
use crate::error::{Error, Result};
use crate::events::{EventBus, LatencyEvent};
use crate::transport::{open_exec, Transport};

pub const PROBE_COMMAND: &str = "echo latency_test";

#[derive(Debug, Clone, serde::Serialize)]
pub struct QualitySample {
    pub at: DateTime<Utc>,
    pub latency_ms: Option<u32>,
    pub error: Option<String>,
    pub success: bool,
}

type SampleWindow = Arc<parking_lot::Mutex<VecDeque<QualitySample>>>;

struct ProbeEntry {
    samples: SampleWindow,
    transport: Arc<Transport>,
    task: JoinHandle<()>,
}

pub struct LatencyService {
    opts: LatencyOptions,
    events: Arc<EventBus>,
    entries: parking_lot::Mutex<HashMap<TabId, ProbeEntry>>,
}

impl LatencyService {
    pub fn new(opts: LatencyOptions, events: Arc<EventBus>) -> Self {
        Self {
            opts,
            events,
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Start periodic probing of `transport` on behalf of `tab`. Replaces
    /// any previous registration for the tab (e.g. after reconnection).
    pub fn register(&self, tab: &str, transport: Arc<Transport>) {
        let samples: SampleWindow = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
        let task = tokio::spawn(probe_loop(
            tab.to_string(),
            Arc::clone(&transport),
            Arc::clone(&samples),
            self.opts.clone(),
            Arc::clone(&self.events),
        ));
        let entry = ProbeEntry {
            samples,
            transport,
            task,
        };
        if let Some(old) = self.entries.lock().insert(tab.to_string(), entry) {
            old.task.abort();
        }
    }

    pub fn unregister(&self, tab: &str) {
        if let Some(entry) = self.entries.lock().remove(tab) {
            entry.task.abort();
        }
    }

    /// Probe immediately, record the sample and return the measured ms.
    pub async fn measure_now(&self, tab: &str) -> Result<u32> {
        let (transport, samples) = {
            let entries = self.entries.lock();
            let entry = entries.get(tab).ok_or(Error::NotConnected)?;
            (Arc::clone(&entry.transport), Arc::clone(&entry.samples))
        };
        let outcome = probe_once(&transport, &self.opts).await;
        record(&samples, &outcome, self.opts.window);
        match outcome {
            Ok(ms) => {
                let quality = quality_score(&samples.lock());
                self.events.latency(LatencyEvent::Updated {
                    tab: tab.to_string(),
                    ms,
                    quality,
                });
                Ok(ms)
            }
            Err(err) => {
                self.events.latency(LatencyEvent::Error {
                    tab: tab.to_string(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// The rolling window for a tab, newest last.
    pub fn window(&self, tab: &str) -> Vec<QualitySample> {
        self.entries
            .lock()
            .get(tab)
            .map(|e| e.samples.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn quality(&self, tab: &str) -> Option<u8> {
        let entries = self.entries.lock();
        let entry = entries.get(tab)?;
        let samples = entry.samples.lock();
        if samples.is_empty() {
            None
        } else {
            Some(quality_score(&samples))
        }
    }

    pub fn shutdown(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            entry.task.abort();
        }
    }
}

async fn probe_loop(
    tab: TabId,
    transport: Arc<Transport>,
    samples: SampleWindow,
    opts: LatencyOptions,
    events: Arc<EventBus>,
) {
    let mut ticker = tokio::time::interval(opts.probe_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !transport.is_healthy() {
            events.latency(LatencyEvent::Disconnected { tab: tab.clone() });
            debug!(tab = %tab, "latency probe stopping: transport gone");
            return;
        }
        let outcome = probe_once(&transport, &opts).await;
        record(&samples, &outcome, opts.window);
        match outcome {
            Ok(ms) => {
                let quality = quality_score(&samples.lock());
                events.latency(LatencyEvent::Updated {
                    tab: tab.clone(),
                    ms,
                    quality,
                });
            }
            Err(err) => {
                events.latency(LatencyEvent::Error {
                    tab: tab.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Time from issuing the exec to the first data byte.
async fn probe_once(transport: &Transport, opts: &LatencyOptions) -> Result<u32> {
    let started = Instant::now();
    let probe = async {
        let (mut channel, _permit) = open_exec(transport, PROBE_COMMAND).await?;
        loop {
            match channel.wait().await {
                Some(russh::ChannelMsg::Data { .. })
                | Some(russh::ChannelMsg::ExtendedData { .. }) => {
                    return Ok(started.elapsed().as_millis() as u32);
                }
                Some(_) => continue,
                None => return Err(Error::TransportLost("probe channel closed".into())),
            }
        }
    };
    tokio::time::timeout(opts.probe_timeout, probe)
        .await
        .map_err(|_| Error::Timeout(crate::error::TimeoutKind::Read))?
}

fn record(samples: &SampleWindow, outcome: &Result<u32>, window: usize) {
    let sample = match outcome {
        Ok(ms) => QualitySample {
            at: Utc::now(),
            latency_ms: Some(*ms),
            error: None,
            success: true,
        },
        Err(err) => QualitySample {
            at: Utc::now(),
            latency_ms: None,
            error: Some(err.to_string()),
            success: false,
        },
    };
    let mut guard = samples.lock();
    guard.push_back(sample);
    while guard.len() > window {
        guard.pop_front();
    }
}

/// Quality score in [0..100]: perfect minus latency, jitter and error-rate
/// penalties over the rolling window.
pub fn quality_score(samples: &VecDeque<QualitySample>) -> u8 {
    if samples.is_empty() {
        return 100;
    }
    let total = samples.len() as f64;
    let latencies: Vec<f64> = samples
        .iter()
        .filter_map(|s| s.latency_ms)
        .map(f64::from)
        .collect();
    let failures = total - latencies.len() as f64;

    let error_penalty = (failures / total) * 60.0;

    let (latency_penalty, jitter_penalty) = if latencies.is_empty() {
        (40.0, 0.0)
    } else {
        let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
        // 0 at <=30 ms, full 40-point penalty at >=1 s.
        let lat = ((avg - 30.0).max(0.0) / 970.0).min(1.0) * 40.0;
        let var = latencies
            .iter()
            .map(|l| (l - avg).powi(2))
            .sum::<f64>()
            / latencies.len() as f64;
        let jitter = (var.sqrt() / 200.0).min(1.0) * 10.0;
        (lat, jitter)
    };

    (100.0 - error_penalty - latency_penalty - jitter_penalty)
        .clamp(0.0, 100.0)
        .round() as u8
}

/// Human label for the surface's status line.
pub fn quality_label(score: u8) -> &'static str {
    match score {
        85.. => "excellent",
        60..=84 => "good",
        35..=59 => "fair",
        _ => "poor",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: Option<u32>) -> QualitySample {
        QualitySample {
            at: Utc::now(),
            latency_ms: ms,
            error: ms.is_none().then(|| "probe failed".to_string()),
            success: ms.is_some(),
        }
    }

    #[test]
    fn fast_stable_link_scores_excellent() {
        let samples: VecDeque<_> = (0..10).map(|_| sample(Some(12))).collect();
        let score = quality_score(&samples);
        assert!(score >= 95, "score {score}");
        assert_eq!(quality_label(score), "excellent");
    }

    #[test]
    fn slow_link_scores_lower() {
        let fast: VecDeque<_> = (0..10).map(|_| sample(Some(20))).collect();
        let slow: VecDeque<_> = (0..10).map(|_| sample(Some(800))).collect();
        assert!(quality_score(&slow) < quality_score(&fast));
    }

    #[test]
    fn failures_drag_the_score_down() {
        let mixed: VecDeque<_> = (0..10)
            .map(|i| sample((i % 2 == 0).then_some(50)))
            .collect();
        let clean: VecDeque<_> = (0..10).map(|_| sample(Some(50))).collect();
        assert!(quality_score(&mixed) + 20 < quality_score(&clean));
    }

    #[test]
    fn all_failures_is_poor() {
        let dead: VecDeque<_> = (0..10).map(|_| sample(None)).collect();
        let score = quality_score(&dead);
        assert!(score <= 10, "score {score}");
        assert_eq!(quality_label(score), "poor");
    }

    #[test]
    fn window_is_capped() {
        let samples: SampleWindow = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
        for i in 0..25u32 {
            record(&samples, &Ok(i), 10);
        }
        let guard = samples.lock();
        assert_eq!(guard.len(), 10);
        assert_eq!(guard.back().unwrap().latency_ms, Some(24));
        assert_eq!(guard.front().unwrap().latency_ms, Some(15));
    }

    #[test]
    fn empty_window_is_perfect() {
        assert_eq!(quality_score(&VecDeque::new()), 100);
    }
}
