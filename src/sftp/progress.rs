//! Transfer progress plumbing.
//!
//! Progress events are coalesced before they cross to the surface: an event
//! goes out after 20 recorded chunks or 100 ms, whichever comes first. The
//! reporter also enforces a throughput floor on the bytes it counts, so a
//! transfer whose sustained rate collapses is aborted instead of hanging
//! until the operation deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;
use uuid::Uuid;

use crate::config::TransferOptions;
use crate::error::{Error, Result, TimeoutKind};
use crate::events::{EventBus, TransferEvent, TransferStatus};

/// No throughput verdicts until a transfer has had this long to ramp up.
const RATE_FLOOR_WARMUP: Duration = Duration::from_secs(10);
/// A rate window must be at least this long before it is judged.
const RATE_FLOOR_WINDOW: Duration = Duration::from_secs(5);
/// Minimum sustained rate over a window; below this the transfer counts as
/// stalled.
const RATE_FLOOR_BYTES_PER_SEC: f64 = 1024.0;

/// The throughput floor: an open measurement window over the reporter's own
/// byte counter. Re-opened after each passing check, a pause, or a restart.
struct RateFloor {
    checks_from: Instant,
    window_opened: Instant,
    bytes_at_open: u64,
}

impl RateFloor {
    fn open(now: Instant, bytes: u64) -> Self {
        Self {
            checks_from: now + RATE_FLOOR_WARMUP,
            window_opened: now,
            bytes_at_open: bytes,
        }
    }
}

struct ReporterInner {
    bytes: u64,
    total: Option<u64>,
    pending: u32,
    last_emit: Instant,
    started: Instant,
    floor: RateFloor,
}

pub struct ProgressReporter {
    events: Arc<EventBus>,
    id: Uuid,
    batch: u32,
    interval: Duration,
    inner: parking_lot::Mutex<ReporterInner>,
}

impl ProgressReporter {
    pub fn new(events: Arc<EventBus>, id: Uuid, total: Option<u64>, opts: &TransferOptions) -> Self {
        let now = Instant::now();
        Self {
            events,
            id,
            batch: opts.progress_batch,
            interval: opts.progress_interval,
            inner: parking_lot::Mutex::new(ReporterInner {
                bytes: 0,
                total,
                pending: 0,
                last_emit: now,
                started: now,
                floor: RateFloor::open(now, 0),
            }),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// The total becomes known once the source file has been stat-ed.
    pub fn set_total(&self, total: Option<u64>) {
        self.inner.lock().total = total;
    }

    /// Rewind after a restart-from-zero resume. Also re-opens the rate
    /// window, since the restarted stream deserves a fresh warmup.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.bytes = 0;
        inner.pending = 0;
        inner.floor = RateFloor::open(Instant::now(), 0);
    }

    /// Forgive past slowness, e.g. after a pause-and-resume.
    pub fn rearm_throughput(&self) {
        let mut inner = self.inner.lock();
        inner.floor = RateFloor::open(Instant::now(), inner.bytes);
    }

    /// Judge the sustained rate since the current window opened. Windows
    /// shorter than [`RATE_FLOOR_WINDOW`] pass unjudged; a window that moved
    /// fewer than [`RATE_FLOOR_BYTES_PER_SEC`] × its length fails with a
    /// read timeout, otherwise the window rolls forward.
    pub fn throughput_ok(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if now < inner.floor.checks_from {
            return Ok(());
        }
        let open_for = now.duration_since(inner.floor.window_opened);
        if open_for < RATE_FLOOR_WINDOW {
            return Ok(());
        }
        let moved = inner.bytes.saturating_sub(inner.floor.bytes_at_open);
        if (moved as f64) < RATE_FLOOR_BYTES_PER_SEC * open_for.as_secs_f64() {
            return Err(Error::Timeout(TimeoutKind::Read));
        }
        inner.floor.window_opened = now;
        inner.floor.bytes_at_open = inner.bytes;
        Ok(())
    }

    /// Record `n` transferred bytes; emits a coalesced progress event when
    /// the batch or interval threshold is crossed.
    pub fn record(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.bytes += n as u64;
        inner.pending += 1;
        let due = inner.pending >= self.batch || inner.last_emit.elapsed() >= self.interval;
        if !due {
            return;
        }
        inner.pending = 0;
        inner.last_emit = Instant::now();
        let (bytes, total, rate, eta) = snapshot(&inner);
        drop(inner);
        trace!(id = %self.id, bytes, rate, "transfer progress");
        self.events.transfer(TransferEvent::Progress {
            id: self.id,
            bytes,
            total,
            rate,
            eta,
        });
    }

    /// Final event: one last progress emission plus the completion record.
    pub fn finish(&self, status: TransferStatus, error: Option<String>) {
        let inner = self.inner.lock();
        let (bytes, total, rate, eta) = snapshot(&inner);
        drop(inner);
        self.events.transfer(TransferEvent::Progress {
            id: self.id,
            bytes,
            total,
            rate,
            eta,
        });
        self.events.transfer(TransferEvent::Complete {
            id: self.id,
            status,
            error,
        });
    }

    /// Shape the rate window for tests: warmup already over, window opened
    /// `opened_ago` in the past at the current byte count.
    #[cfg(test)]
    fn force_window(&self, opened_ago: Duration) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.floor.checks_from = now - Duration::from_millis(1);
        inner.floor.window_opened = now - opened_ago;
        inner.floor.bytes_at_open = inner.bytes;
    }
}

fn snapshot(inner: &ReporterInner) -> (u64, Option<u64>, f64, Option<Duration>) {
    let elapsed = inner.started.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        inner.bytes as f64 / elapsed
    } else {
        0.0
    };
    let eta = match inner.total {
        Some(total) if rate > 0.0 && total > inner.bytes => {
            Some(Duration::from_secs_f64((total - inner.bytes) as f64 / rate))
        }
        _ => None,
    };
    (inner.bytes, inner.total, rate, eta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn reporter(batch: u32, interval: Duration) -> (Arc<EventBus>, ProgressReporter) {
        let events = Arc::new(EventBus::default());
        let opts = TransferOptions {
            progress_batch: batch,
            progress_interval: interval,
            ..TransferOptions::default()
        };
        let reporter = ProgressReporter::new(
            Arc::clone(&events),
            Uuid::new_v4(),
            Some(1024 * 1024),
            &opts,
        );
        (events, reporter)
    }

    #[tokio::test]
    async fn batches_of_twenty_coalesce_into_one_event() {
        let (events, reporter) = reporter(20, Duration::from_secs(3600));
        let mut rx = events.subscribe_transfer();

        for _ in 0..19 {
            reporter.record(1024);
        }
        assert!(rx.try_recv().is_err(), "no event before the batch fills");

        reporter.record(1024);
        match rx.try_recv().unwrap() {
            TransferEvent::Progress { bytes, total, .. } => {
                assert_eq!(bytes, 20 * 1024);
                assert_eq!(total, Some(1024 * 1024));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "exactly one event per batch");
    }

    #[tokio::test]
    async fn interval_threshold_emits_without_a_full_batch() {
        let (events, reporter) = reporter(1000, Duration::ZERO);
        let mut rx = events.subscribe_transfer();
        reporter.record(10);
        match rx.try_recv().unwrap() {
            TransferEvent::Progress { bytes, .. } => assert_eq!(bytes, 10),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn finish_emits_progress_then_completion() {
        let (events, reporter) = reporter(1000, Duration::from_secs(3600));
        let mut rx = events.subscribe_transfer();
        reporter.record(500);
        reporter.finish(TransferStatus::Completed, None);

        assert!(matches!(
            rx.try_recv().unwrap(),
            TransferEvent::Progress { bytes: 500, .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransferEvent::Complete {
                status: TransferStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rate_floor_passes_during_warmup() {
        let (_events, reporter) = reporter(1000, Duration::from_secs(3600));
        // Fresh reporter, zero bytes moved: still warming up.
        assert!(reporter.throughput_ok().is_ok());
        reporter.record(3);
        assert!(reporter.throughput_ok().is_ok());
    }

    #[tokio::test]
    async fn rate_floor_fails_a_dead_window() {
        let (_events, reporter) = reporter(1000, Duration::from_secs(3600));
        reporter.record(256 * 1024);
        // Window open for 7 s with nothing recorded since it opened.
        reporter.force_window(Duration::from_secs(7));
        let err = reporter.throughput_ok().unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutKind::Read)));
    }

    #[tokio::test]
    async fn rate_floor_rolls_a_healthy_window() {
        let (_events, reporter) = reporter(1000, Duration::from_secs(3600));
        reporter.force_window(Duration::from_secs(6));
        // 6 s at the 1 KiB/s floor needs 6 KiB; move well past it.
        reporter.record(48 * 1024);
        assert!(reporter.throughput_ok().is_ok());
        // The window rolled: an immediate re-check is unjudged again.
        assert!(reporter.throughput_ok().is_ok());
    }

    #[tokio::test]
    async fn trickle_below_the_floor_still_fails() {
        let (_events, reporter) = reporter(1000, Duration::from_secs(3600));
        reporter.force_window(Duration::from_secs(9));
        // 9 s at the floor needs 9216 bytes; a 2 KiB trickle is not enough.
        reporter.record(2048);
        let err = reporter.throughput_ok().unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutKind::Read)));
    }

    #[tokio::test]
    async fn rearm_forgives_a_slow_stretch() {
        let (_events, reporter) = reporter(1000, Duration::from_secs(3600));
        reporter.force_window(Duration::from_secs(9));
        reporter.rearm_throughput();
        assert!(reporter.throughput_ok().is_ok(), "fresh warmup after rearm");
    }

    #[tokio::test]
    async fn reset_rewinds_bytes_and_rate_window() {
        let (_events, reporter) = reporter(1000, Duration::from_secs(3600));
        reporter.record(10_000);
        reporter.force_window(Duration::from_secs(8));
        reporter.reset();
        assert_eq!(reporter.bytes(), 0);
        assert!(reporter.throughput_ok().is_ok());
    }
}
