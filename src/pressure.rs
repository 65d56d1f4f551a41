//! Back-pressure controller: global admission control for transfer streams.
//!
//! Pressure is derived from two signals sampled once a second: bytes held in
//! transfer chunk buffers (against a configured cap) and a scheduler-lag
//! moving average standing in for CPU strain. The resulting state gates new
//! streams; an EWMA-adjusted global throttle factor slows running ones.
//!
//! Buffer accounting is cooperative: the transfer engine wraps every chunk
//! buffer in a [`BufferTicket`] so memory in flight is bounded and visible.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{PressureOptions, Priority};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureState {
    Low,
    Normal,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub priority: Priority,
}

/// Map the two metric ratios onto a pressure state.
pub(crate) fn classify(mem: f64, cpu: f64, opts: &PressureOptions) -> PressureState {
    if mem >= 0.95 || cpu >= 0.97 {
        PressureState::Critical
    } else if mem >= opts.memory_cutoff || cpu >= opts.cpu_cutoff {
        PressureState::High
    } else if mem >= opts.memory_cutoff * 0.8 || cpu >= opts.cpu_cutoff * 0.85 {
        PressureState::Medium
    } else if mem < 0.3 && cpu < 0.3 {
        PressureState::Low
    } else {
        PressureState::Normal
    }
}

pub struct PressureController {
    opts: PressureOptions,
    bytes_in_flight: Arc<AtomicU64>,
    /// EWMA of scheduler lag as a 0..1 load fraction (f32 bits).
    cpu_load: AtomicU32,
    state_tx: watch::Sender<PressureState>,
    /// Global rate factor in (0, 1]; grows under sustained low pressure,
    /// shrinks under high.
    throttle_tx: watch::Sender<f64>,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
    sampler: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PressureController {
    pub fn new(opts: PressureOptions) -> Arc<Self> {
        let (state_tx, _) = watch::channel(PressureState::Normal);
        let (throttle_tx, _) = watch::channel(1.0);
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(opts.max_concurrent_streams)),
            opts,
            bytes_in_flight: Arc::new(AtomicU64::new(0)),
            cpu_load: AtomicU32::new(0f32.to_bits()),
            state_tx,
            throttle_tx,
            queued: AtomicUsize::new(0),
            sampler: parking_lot::Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut guard = self.sampler.lock();
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let interval = this.opts.sample_interval;
            loop {
                let before = Instant::now();
                tokio::time::sleep(interval).await;
                let overshoot = before.elapsed().saturating_sub(interval);
                let instant_load =
                    (overshoot.as_secs_f64() / interval.as_secs_f64()).clamp(0.0, 1.0);
                let prev = f32::from_bits(this.cpu_load.load(Ordering::Relaxed)) as f64;
                let load = prev * 0.7 + instant_load * 0.3;
                this.cpu_load
                    .store((load as f32).to_bits(), Ordering::Relaxed);
                this.resample(load);
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.sampler.lock().take() {
            task.abort();
        }
    }

    fn resample(&self, cpu: f64) {
        let mem = self.memory_ratio();
        let state = classify(mem, cpu, &self.opts);
        let prev = *self.state_tx.borrow();
        if prev != state {
            debug!(?prev, ?state, mem, cpu, "pressure state changed");
        }
        let _ = self.state_tx.send_replace(state);

        let throttle = *self.throttle_tx.borrow();
        let next = match state {
            PressureState::Low | PressureState::Normal => (throttle * 1.1 + 0.01).min(1.0),
            PressureState::Medium => throttle,
            PressureState::High | PressureState::Critical => (throttle * 0.75).max(0.05),
        };
        let _ = self.throttle_tx.send_replace(next);
    }

    pub fn state(&self) -> PressureState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PressureState> {
        self.state_tx.subscribe()
    }

    pub fn memory_in_use(&self) -> u64 {
        self.bytes_in_flight.load(Ordering::Relaxed)
    }

    fn memory_ratio(&self) -> f64 {
        self.memory_in_use() as f64 / self.opts.memory_cap as f64
    }

    fn cpu_ratio(&self) -> f64 {
        f32::from_bits(self.cpu_load.load(Ordering::Relaxed)) as f64
    }

    /// Admission control for one new transfer stream.
    pub async fn request_stream(&self, id: uuid::Uuid, opts: StreamOptions) -> Result<StreamGrant> {
        let state = self.state();
        let factor = match state {
            PressureState::Critical => {
                return Err(Error::Overloaded(format!(
                    "pressure critical: memory {:.0}%, load {:.0}%",
                    self.memory_ratio() * 100.0,
                    self.cpu_ratio() * 100.0
                )));
            }
            PressureState::Low | PressureState::Normal => 1.0,
            PressureState::Medium => {
                // Proportional delay: the lower the global throttle, the
                // longer new streams wait before starting.
                let throttle = *self.throttle_tx.borrow();
                let delay = Duration::from_millis((100.0 * (1.0 / throttle)).min(1000.0) as u64);
                tokio::time::sleep(delay).await;
                throttle
            }
            PressureState::High => {
                if opts.priority >= Priority::High {
                    0.7
                } else {
                    // Pause until pressure drops, bounded; then admit anyway.
                    let mut rx = self.state_tx.subscribe();
                    let _ = tokio::time::timeout(
                        self.opts.pause_cap,
                        rx.wait_for(|s| *s < PressureState::High),
                    )
                    .await;
                    *self.throttle_tx.borrow()
                }
            }
        };

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // All stream slots busy: join the waiter queue if it has room.
                let queued = self.queued.fetch_add(1, Ordering::SeqCst);
                if queued >= self.opts.max_queue_size {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::QueueFull(format!(
                        "{} stream waiters already queued",
                        self.opts.max_queue_size
                    )));
                }
                let acquired = Arc::clone(&self.permits).acquire_owned().await;
                self.queued.fetch_sub(1, Ordering::SeqCst);
                acquired.map_err(|_| Error::Shutdown)?
            }
        };

        debug!(stream = %id, ?state, factor, "stream admitted");
        Ok(StreamGrant {
            _permit: permit,
            factor,
            throttle_rx: self.throttle_tx.subscribe(),
            bytes: Arc::clone(&self.bytes_in_flight),
        })
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: PressureState) {
        let _ = self.state_tx.send_replace(state);
    }

    #[cfg(test)]
    pub(crate) fn force_memory(&self, bytes: u64) {
        self.bytes_in_flight.store(bytes, Ordering::SeqCst);
    }
}

/// An admitted stream: holds a concurrency permit for its lifetime and
/// exposes pacing and buffer accounting to the transfer loop.
#[derive(Debug)]
pub struct StreamGrant {
    _permit: tokio::sync::OwnedSemaphorePermit,
    factor: f64,
    throttle_rx: watch::Receiver<f64>,
    bytes: Arc<AtomicU64>,
}

impl StreamGrant {
    /// Effective rate factor: per-stream admission factor times the global
    /// adaptive throttle.
    pub fn effective_factor(&self) -> f64 {
        (self.factor * *self.throttle_rx.borrow()).clamp(0.05, 1.0)
    }

    /// Account `n` buffered bytes for the lifetime of the returned ticket.
    pub fn reserve(&self, n: usize) -> BufferTicket {
        self.bytes.fetch_add(n as u64, Ordering::SeqCst);
        BufferTicket {
            bytes: Arc::clone(&self.bytes),
            n: n as u64,
        }
    }

    /// Pace the stream after a chunk that took `chunk_duration`: a factor of
    /// 1.0 adds no delay, lower factors stretch the effective transfer rate.
    pub async fn pace(&self, chunk_duration: Duration) {
        let factor = self.effective_factor();
        if factor >= 0.999 {
            return;
        }
        let stretch = chunk_duration.as_secs_f64() * (1.0 - factor) / factor;
        let delay = Duration::from_secs_f64(stretch.min(0.5));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// RAII accounting for one chunk buffer.
pub struct BufferTicket {
    bytes: Arc<AtomicU64>,
    n: u64,
}

impl Drop for BufferTicket {
    fn drop(&mut self) {
        self.bytes.fetch_sub(self.n, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> PressureOptions {
        PressureOptions::default()
    }

    #[test]
    fn classification_thresholds() {
        let o = opts();
        assert_eq!(classify(0.1, 0.1, &o), PressureState::Low);
        assert_eq!(classify(0.5, 0.5, &o), PressureState::Normal);
        assert_eq!(classify(0.7, 0.1, &o), PressureState::Medium);
        assert_eq!(classify(0.85, 0.1, &o), PressureState::High);
        assert_eq!(classify(0.1, 0.92, &o), PressureState::High);
        assert_eq!(classify(0.96, 0.0, &o), PressureState::Critical);
        assert_eq!(classify(0.0, 0.99, &o), PressureState::Critical);
    }

    #[tokio::test]
    async fn critical_pressure_rejects_streams() {
        let ctl = PressureController::new(opts());
        ctl.force_state(PressureState::Critical);
        let err = ctl
            .request_stream(uuid::Uuid::new_v4(), StreamOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded(_)), "{err}");
    }

    #[tokio::test]
    async fn high_pressure_admits_high_priority_with_throttle() {
        let ctl = PressureController::new(opts());
        ctl.force_state(PressureState::High);
        let grant = ctl
            .request_stream(
                uuid::Uuid::new_v4(),
                StreamOptions {
                    priority: Priority::High,
                },
            )
            .await
            .unwrap();
        assert!(grant.effective_factor() <= 0.7 + f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn low_priority_waits_under_high_pressure_then_proceeds() {
        let ctl = PressureController::new(opts());
        ctl.force_state(PressureState::High);
        let started = tokio::time::Instant::now();
        let grant = ctl
            .request_stream(uuid::Uuid::new_v4(), StreamOptions::default())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5), "paused first");
        drop(grant);
    }

    #[tokio::test]
    async fn queue_overflow_rejects_immediately() {
        let mut o = opts();
        o.max_concurrent_streams = 1;
        o.max_queue_size = 0;
        let ctl = PressureController::new(o);
        let _held = ctl
            .request_stream(uuid::Uuid::new_v4(), StreamOptions::default())
            .await
            .unwrap();
        let err = ctl
            .request_stream(uuid::Uuid::new_v4(), StreamOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)), "{err}");
    }

    #[tokio::test]
    async fn released_permit_unblocks_waiter() {
        let mut o = opts();
        o.max_concurrent_streams = 1;
        let ctl = PressureController::new(o);
        let held = ctl
            .request_stream(uuid::Uuid::new_v4(), StreamOptions::default())
            .await
            .unwrap();
        let waiter = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move {
                ctl.request_stream(uuid::Uuid::new_v4(), StreamOptions::default())
                    .await
            })
        };
        tokio::task::yield_now().await;
        drop(held);
        let got = waiter.await.unwrap();
        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn buffer_tickets_are_balanced() {
        let ctl = PressureController::new(opts());
        let grant = ctl
            .request_stream(uuid::Uuid::new_v4(), StreamOptions::default())
            .await
            .unwrap();
        let t1 = grant.reserve(64 * 1024);
        let t2 = grant.reserve(1024);
        assert_eq!(ctl.memory_in_use(), 65 * 1024);
        drop(t1);
        assert_eq!(ctl.memory_in_use(), 1024);
        drop(t2);
        assert_eq!(ctl.memory_in_use(), 0);
    }

    #[tokio::test]
    async fn memory_accounting_feeds_classification() {
        let ctl = PressureController::new(opts());
        ctl.force_memory((0.85 * 256.0 * 1024.0 * 1024.0) as u64);
        ctl.resample(0.0);
        assert_eq!(ctl.state(), PressureState::High);
        ctl.force_memory((0.96 * 256.0 * 1024.0 * 1024.0) as u64);
        ctl.resample(0.0);
        assert_eq!(ctl.state(), PressureState::Critical);
    }
}
