//! Per-tab SFTP operation queue.
//!
//! One strictly serial dispatcher per tab picks the highest-priority waiting
//! operation (FIFO within a priority). Identical mergeable requests attach
//! to the waiting operation and share its single execution. Transient
//! failures retry with a linear delay; timeouts are sized to the operation.
//! Cancellation drains queued work and interrupts the in-flight operation,
//! distinguishing user cancellation from connection closure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Priority, QueueOptions, TabId};
use crate::error::{CancelKind, Error, Result, TimeoutKind};
use crate::sftp::session_pool::SftpSessionPool;
use crate::sftp::transfer::TransferEngine;
use crate::sftp::{entry_from_attrs, FileEntry};

/// Everything the queue can run on a tab's SFTP sessions.
#[derive(Debug, Clone)]
pub enum SftpOp {
    Readdir { path: String },
    Stat { path: String },
    ReadFile { path: String },
    WriteFile { path: String, data: Bytes },
    Mkdir { path: String },
    RemoveFile { path: String },
    RemoveDir { path: String },
    Rename { from: String, to: String },
    Upload { transfer: Uuid },
    Download { transfer: Uuid },
    UploadFolder { transfer: Uuid },
    DownloadFolder { transfer: Uuid },
    UploadMulti { transfer: Uuid, files: Vec<(PathBuf, String)> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Readdir,
    Stat,
    ReadFile,
    WriteFile,
    Mkdir,
    RemoveFile,
    RemoveDir,
    Rename,
    Upload,
    Download,
    UploadFolder,
    DownloadFolder,
    UploadMulti,
}

impl SftpOp {
    pub fn kind(&self) -> OpKind {
        match self {
            SftpOp::Readdir { .. } => OpKind::Readdir,
            SftpOp::Stat { .. } => OpKind::Stat,
            SftpOp::ReadFile { .. } => OpKind::ReadFile,
            SftpOp::WriteFile { .. } => OpKind::WriteFile,
            SftpOp::Mkdir { .. } => OpKind::Mkdir,
            SftpOp::RemoveFile { .. } => OpKind::RemoveFile,
            SftpOp::RemoveDir { .. } => OpKind::RemoveDir,
            SftpOp::Rename { .. } => OpKind::Rename,
            SftpOp::Upload { .. } => OpKind::Upload,
            SftpOp::Download { .. } => OpKind::Download,
            SftpOp::UploadFolder { .. } => OpKind::UploadFolder,
            SftpOp::DownloadFolder { .. } => OpKind::DownloadFolder,
            SftpOp::UploadMulti { .. } => OpKind::UploadMulti,
        }
    }

    /// Only idempotent reads may merge.
    fn merge_key(&self) -> Option<(OpKind, &str)> {
        match self {
            SftpOp::Readdir { path } => Some((OpKind::Readdir, path)),
            SftpOp::Stat { path } => Some((OpKind::Stat, path)),
            SftpOp::ReadFile { path } => Some((OpKind::ReadFile, path)),
            _ => None,
        }
    }
}

/// Result payload delivered to every completer of an operation.
#[derive(Debug, Clone)]
pub enum OpOutput {
    Entries(Vec<FileEntry>),
    Entry(FileEntry),
    Data(Bytes),
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub can_merge: bool,
    /// Known file size, used to scale the operation timeout.
    pub size_hint: Option<u64>,
    pub timeout_override: Option<Duration>,
}

struct QueuedOp {
    id: Uuid,
    seq: u64,
    op: SftpOp,
    priority: Priority,
    can_merge: bool,
    attempts: u32,
    #[allow(dead_code)]
    enqueued_at: Instant,
    timeout: Duration,
    completers: Vec<oneshot::Sender<Result<OpOutput>>>,
}

/// Highest priority first, FIFO within a priority.
fn select_next(waiting: &mut Vec<QueuedOp>) -> Option<QueuedOp> {
    let idx = waiting
        .iter()
        .enumerate()
        .max_by_key(|(_, op)| (op.priority.value(), std::cmp::Reverse(op.seq)))
        .map(|(idx, _)| idx)?;
    Some(waiting.remove(idx))
}

/// Deadline for one attempt of an operation.
pub(crate) fn dynamic_timeout(
    kind: OpKind,
    size_hint: Option<u64>,
    opts: &QueueOptions,
) -> Duration {
    let size = size_hint.unwrap_or(0);
    let scaled = |rate: u64, floor: Duration| {
        let extra = Duration::from_secs(size / rate.max(1));
        (opts.base_timeout + extra).max(floor).min(opts.max_op_timeout)
    };
    match kind {
        OpKind::Readdir
        | OpKind::Stat
        | OpKind::Mkdir
        | OpKind::RemoveFile
        | OpKind::RemoveDir
        | OpKind::Rename => opts.base_timeout,
        OpKind::ReadFile | OpKind::WriteFile => scaled(512 * 1024, opts.base_timeout),
        OpKind::Upload | OpKind::Download => scaled(256 * 1024, Duration::from_secs(60)),
        OpKind::UploadFolder | OpKind::DownloadFolder | OpKind::UploadMulti => opts.max_op_timeout,
    }
}

struct TabQueue {
    waiting: parking_lot::Mutex<Vec<QueuedOp>>,
    running: AtomicBool,
    seq: AtomicU64,
    cancel_current: Notify,
    cancel_kind: parking_lot::Mutex<CancelKind>,
}

impl TabQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            waiting: parking_lot::Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            cancel_current: Notify::new(),
            cancel_kind: parking_lot::Mutex::new(CancelKind::User),
        })
    }
}

pub struct SftpQueue {
    opts: QueueOptions,
    sessions: Arc<SftpSessionPool>,
    transfers: Arc<TransferEngine>,
    tabs: parking_lot::Mutex<HashMap<TabId, Arc<TabQueue>>>,
}

impl SftpQueue {
    pub fn new(
        opts: QueueOptions,
        sessions: Arc<SftpSessionPool>,
        transfers: Arc<TransferEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            opts,
            sessions,
            transfers,
            tabs: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue and wait for the outcome.
    pub async fn submit(
        self: &Arc<Self>,
        tab: &str,
        op: SftpOp,
        opts: EnqueueOptions,
    ) -> Result<OpOutput> {
        let rx = self.enqueue(tab, op, opts);
        rx.await
            .unwrap_or_else(|_| Err(Error::Cancelled(CancelKind::Close)))
    }

    /// Enqueue without waiting; the receiver resolves with the outcome.
    pub fn enqueue(
        self: &Arc<Self>,
        tab: &str,
        op: SftpOp,
        opts: EnqueueOptions,
    ) -> oneshot::Receiver<Result<OpOutput>> {
        let (tx, rx) = oneshot::channel();
        let tq = self.tab_queue(tab);
        {
            let mut waiting = tq.waiting.lock();
            if opts.can_merge {
                if let Some(key) = op.merge_key() {
                    let existing = waiting
                        .iter_mut()
                        .find(|q| q.can_merge && q.op.merge_key() == Some(key));
                    if let Some(existing) = existing {
                        debug!(tab, ?key, "merged sftp request into waiting operation");
                        existing.completers.push(tx);
                        existing.priority = existing.priority.max(opts.priority);
                        return rx;
                    }
                }
            }
            let timeout = opts
                .timeout_override
                .unwrap_or_else(|| dynamic_timeout(op.kind(), opts.size_hint, &self.opts));
            waiting.push(QueuedOp {
                id: Uuid::new_v4(),
                seq: tq.seq.fetch_add(1, Ordering::SeqCst),
                op,
                priority: opts.priority,
                can_merge: opts.can_merge,
                attempts: 0,
                enqueued_at: Instant::now(),
                timeout,
                completers: vec![tx],
            });
        }
        self.ensure_dispatcher(tab, &tq);
        rx
    }

    /// Reject every queued operation and interrupt the in-flight one.
    /// `CancelKind::User` surfaces as "cancelled", `CancelKind::Close` as
    /// "interrupted".
    pub fn cancel_for_tab(&self, tab: &str, kind: CancelKind) {
        let tq = self.tabs.lock().get(tab).cloned();
        if let Some(tq) = tq {
            *tq.cancel_kind.lock() = kind;
            let drained: Vec<QueuedOp> = {
                let mut waiting = tq.waiting.lock();
                waiting.drain(..).collect()
            };
            if !drained.is_empty() {
                debug!(tab, count = drained.len(), ?kind, "draining queued sftp ops");
            }
            for op in drained {
                complete(op.completers, Err(Error::Cancelled(kind)));
            }
            tq.cancel_current.notify_waiters();
        }
        self.transfers.cancel_for_tab(tab, kind);
    }

    /// Drain on transport loss, before reconnection attempts run.
    pub fn drain_for_loss(&self, tab: &str) {
        self.cancel_for_tab(tab, CancelKind::Close);
    }

    /// Drain every tab's queue, e.g. at shutdown.
    pub fn cancel_all(&self, kind: CancelKind) {
        let tabs: Vec<TabId> = self.tabs.lock().keys().cloned().collect();
        for tab in tabs {
            self.cancel_for_tab(&tab, kind);
        }
    }

    pub fn queued_len(&self, tab: &str) -> usize {
        self.tabs
            .lock()
            .get(tab)
            .map(|tq| tq.waiting.lock().len())
            .unwrap_or(0)
    }

    fn tab_queue(&self, tab: &str) -> Arc<TabQueue> {
        let mut tabs = self.tabs.lock();
        Arc::clone(tabs.entry(tab.to_string()).or_insert_with(TabQueue::new))
    }

    fn ensure_dispatcher(self: &Arc<Self>, tab: &str, tq: &Arc<TabQueue>) {
        if tq.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = Arc::clone(self);
        let tq = Arc::clone(tq);
        let tab = tab.to_string();
        tokio::spawn(async move {
            queue.dispatch(tab, tq).await;
        });
    }

    /// Single-flight per tab: runs until the queue drains.
    async fn dispatch(self: Arc<Self>, tab: TabId, tq: Arc<TabQueue>) {
        loop {
            let next = {
                let mut waiting = tq.waiting.lock();
                select_next(&mut waiting)
            };
            let Some(mut op) = next else {
                tq.running.store(false, Ordering::SeqCst);
                // An enqueue may have raced the drain; reclaim the
                // dispatcher role if so.
                let has_more = !tq.waiting.lock().is_empty();
                if has_more && !tq.running.swap(true, Ordering::SeqCst) {
                    continue;
                }
                return;
            };

            loop {
                let outcome = self.execute(&tab, &tq, &op).await;
                match outcome {
                    ExecOutcome::Done(result) => {
                        if let Err(err) = &result {
                            debug!(tab = %tab, op = ?op.op.kind(), attempts = op.attempts, "sftp op failed: {err}");
                        }
                        complete(std::mem::take(&mut op.completers), result);
                        break;
                    }
                    ExecOutcome::Retry(delay) => {
                        op.attempts += 1;
                        warn!(tab = %tab, op = ?op.op.kind(), attempt = op.attempts, "retrying sftp op in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn execute(&self, tab: &str, tq: &TabQueue, op: &QueuedOp) -> ExecOutcome {
        let result = tokio::select! {
            r = tokio::time::timeout(op.timeout, self.run_op(tab, &op.op)) => {
                match r {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::Timeout(TimeoutKind::Operation)),
                }
            }
            _ = tq.cancel_current.notified() => {
                Err(Error::Cancelled(*tq.cancel_kind.lock()))
            }
        };
        match &result {
            Err(err)
                if err.is_transient()
                    && op.attempts < self.opts.max_retries =>
            {
                let delay = self.opts.retry_delay_unit * (op.attempts + 1);
                ExecOutcome::Retry(delay)
            }
            _ => ExecOutcome::Done(result),
        }
    }

    async fn run_op(&self, tab: &str, op: &SftpOp) -> Result<OpOutput> {
        match op {
            SftpOp::Readdir { path } => {
                let session = self.sessions.borrow(tab).await?;
                let result = read_entries(&session.sftp, path).await;
                self.sessions.release(&session);
                result.map(OpOutput::Entries)
            }
            SftpOp::Stat { path } => {
                let session = self.sessions.borrow(tab).await?;
                let result = session.sftp.metadata(path.as_str()).await;
                self.sessions.release(&session);
                let attrs = result.map_err(Error::from)?;
                let (parent, name) = split_remote(path);
                Ok(OpOutput::Entry(entry_from_attrs(parent, name, &attrs)))
            }
            SftpOp::Mkdir { path } => {
                let session = self.sessions.borrow(tab).await?;
                let result = session.sftp.create_dir(path.as_str()).await;
                self.sessions.release(&session);
                result.map_err(Error::from)?;
                Ok(OpOutput::Done)
            }
            SftpOp::RemoveFile { path } => {
                let session = self.sessions.borrow(tab).await?;
                let result = session.sftp.remove_file(path.as_str()).await;
                self.sessions.release(&session);
                result.map_err(Error::from)?;
                Ok(OpOutput::Done)
            }
            SftpOp::RemoveDir { path } => {
                let session = self.sessions.borrow(tab).await?;
                let result = session.sftp.remove_dir(path.as_str()).await;
                self.sessions.release(&session);
                result.map_err(Error::from)?;
                Ok(OpOutput::Done)
            }
            SftpOp::Rename { from, to } => {
                let session = self.sessions.borrow(tab).await?;
                let result = session.sftp.rename(from.as_str(), to.as_str()).await;
                self.sessions.release(&session);
                result.map_err(Error::from)?;
                Ok(OpOutput::Done)
            }
            SftpOp::ReadFile { path } => self
                .transfers
                .read_inline(tab, path)
                .await
                .map(OpOutput::Data),
            SftpOp::WriteFile { path, data } => {
                self.transfers.write_inline(tab, path, data.clone()).await?;
                Ok(OpOutput::Done)
            }
            SftpOp::Upload { transfer } => {
                self.transfers.run_upload(tab, *transfer).await?;
                Ok(OpOutput::Done)
            }
            SftpOp::Download { transfer } => {
                self.transfers.run_download(tab, *transfer).await?;
                Ok(OpOutput::Done)
            }
            SftpOp::UploadFolder { transfer } => {
                self.transfers.run_upload_folder(tab, *transfer).await?;
                Ok(OpOutput::Done)
            }
            SftpOp::DownloadFolder { transfer } => {
                self.transfers.run_download_folder(tab, *transfer).await?;
                Ok(OpOutput::Done)
            }
            SftpOp::UploadMulti { transfer, files } => {
                self.transfers.run_upload_multi(tab, *transfer, files).await?;
                Ok(OpOutput::Done)
            }
        }
    }
}

enum ExecOutcome {
    Done(Result<OpOutput>),
    Retry(Duration),
}

fn complete(completers: Vec<oneshot::Sender<Result<OpOutput>>>, result: Result<OpOutput>) {
    let mut pending = completers.into_iter();
    if let Some(last) = pending.next_back() {
        for tx in pending {
            let _ = tx.send(result.clone());
        }
        let _ = last.send(result);
    }
}

async fn read_entries(
    sftp: &russh_sftp::client::SftpSession,
    path: &str,
) -> Result<Vec<FileEntry>> {
    let dir = sftp.read_dir(path).await.map_err(Error::from)?;
    let mut entries: Vec<FileEntry> = dir
        .into_iter()
        .map(|entry| {
            let name = entry.file_name();
            entry_from_attrs(path, &name, &entry.metadata())
        })
        .collect();
    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    Ok(entries)
}

/// `"/a/b/c.txt"` → `("/a/b", "c.txt")`.
fn split_remote(path: &str) -> (&str, &str) {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolOptions, PressureOptions, SftpOptions, TransferOptions};
    use crate::events::EventBus;
    use crate::pool::ConnectionPool;
    use crate::pressure::PressureController;
    use crate::store::MemoryStore;

    fn queued(op: SftpOp, priority: Priority, seq: u64) -> QueuedOp {
        QueuedOp {
            id: Uuid::new_v4(),
            seq,
            op,
            priority,
            can_merge: false,
            attempts: 0,
            enqueued_at: Instant::now(),
            timeout: Duration::from_secs(20),
            completers: Vec::new(),
        }
    }

    #[test]
    fn selection_prefers_priority_then_fifo() {
        let mut waiting = vec![
            queued(SftpOp::Readdir { path: "/a".into() }, Priority::Normal, 0),
            queued(SftpOp::Readdir { path: "/b".into() }, Priority::Critical, 1),
            queued(SftpOp::Readdir { path: "/c".into() }, Priority::Normal, 2),
            queued(SftpOp::Readdir { path: "/d".into() }, Priority::Critical, 3),
        ];
        let order: Vec<u64> = std::iter::from_fn(|| select_next(&mut waiting).map(|op| op.seq))
            .collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[test]
    fn timeout_scales_with_operation_and_size() {
        let opts = QueueOptions::default();
        assert_eq!(
            dynamic_timeout(OpKind::Readdir, None, &opts),
            Duration::from_secs(20)
        );
        assert_eq!(
            dynamic_timeout(OpKind::Upload, Some(1024), &opts),
            Duration::from_secs(60)
        );
        // 100 MiB upload: 20 s base + 400 s at 256 KiB/s.
        assert_eq!(
            dynamic_timeout(OpKind::Upload, Some(100 * 1024 * 1024), &opts),
            Duration::from_secs(420)
        );
        assert_eq!(
            dynamic_timeout(OpKind::UploadFolder, None, &opts),
            Duration::from_secs(600)
        );
        // Never exceeds the hard cap.
        assert_eq!(
            dynamic_timeout(OpKind::Download, Some(u64::MAX / 2), &opts),
            Duration::from_secs(600)
        );
    }

    fn stack() -> Arc<SftpQueue> {
        let events = Arc::new(EventBus::default());
        let pool = ConnectionPool::new(
            PoolOptions::default(),
            Arc::clone(&events),
            Arc::new(MemoryStore::new()),
        );
        let sessions = SftpSessionPool::new(SftpOptions::default(), pool);
        let pressure = PressureController::new(PressureOptions::default());
        let transfers = TransferEngine::new(
            TransferOptions::default(),
            Arc::clone(&events),
            pressure,
            Arc::clone(&sessions),
        );
        SftpQueue::new(QueueOptions::default(), sessions, transfers)
    }

    #[tokio::test]
    async fn identical_mergeable_requests_share_one_execution() {
        let queue = stack();
        // Park a queued op by hand so the merge target is in `waiting`.
        let tq = queue.tab_queue("t1");
        tq.running.store(true, Ordering::SeqCst); // hold the dispatcher off

        let rx1 = queue.enqueue(
            "t1",
            SftpOp::Readdir { path: "/tmp".into() },
            EnqueueOptions {
                can_merge: true,
                ..Default::default()
            },
        );
        let rx2 = queue.enqueue(
            "t1",
            SftpOp::Readdir { path: "/tmp".into() },
            EnqueueOptions {
                can_merge: true,
                priority: Priority::High,
                ..Default::default()
            },
        );

        {
            let waiting = tq.waiting.lock();
            assert_eq!(waiting.len(), 1, "second request merged into the first");
            assert_eq!(waiting[0].completers.len(), 2);
            assert_eq!(waiting[0].priority, Priority::High, "priority raised");
        }

        // A different path does not merge.
        let _rx3 = queue.enqueue(
            "t1",
            SftpOp::Readdir { path: "/etc".into() },
            EnqueueOptions {
                can_merge: true,
                ..Default::default()
            },
        );
        assert_eq!(queue.queued_len("t1"), 2);

        // Draining completes every completer of the merged op.
        queue.cancel_for_tab("t1", CancelKind::User);
        let r1 = rx1.await.unwrap();
        let r2 = rx2.await.unwrap();
        assert!(matches!(r1, Err(Error::Cancelled(CancelKind::User))));
        assert!(matches!(r2, Err(Error::Cancelled(CancelKind::User))));
        assert_eq!(queue.queued_len("t1"), 0);
    }

    #[tokio::test]
    async fn ops_without_a_transport_fail_cleanly() {
        let queue = stack();
        let result = queue
            .submit(
                "t1",
                SftpOp::Readdir { path: "/".into() },
                EnqueueOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::NotConnected)), "{result:?}");
        // Invariant: nothing remains queued afterwards.
        assert_eq!(queue.queued_len("t1"), 0);
    }

    #[tokio::test]
    async fn drain_for_loss_reports_interruption() {
        let queue = stack();
        let tq = queue.tab_queue("t2");
        tq.running.store(true, Ordering::SeqCst);
        let rx = queue.enqueue(
            "t2",
            SftpOp::Stat { path: "/x".into() },
            EnqueueOptions::default(),
        );
        queue.drain_for_loss("t2");
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled(CancelKind::Close))));
    }

    #[test]
    fn remote_path_split() {
        assert_eq!(split_remote("/a/b/c.txt"), ("/a/b", "c.txt"));
        assert_eq!(split_remote("/c.txt"), ("/", "c.txt"));
        assert_eq!(split_remote("c.txt"), ("", "c.txt"));
        assert_eq!(split_remote("/a/b/"), ("/a", "b"));
    }
}
