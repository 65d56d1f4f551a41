//! Streaming uploads and downloads over borrowed SFTP sub-sessions.
//!
//! Transfers run as queue operations: the id is handed back immediately,
//! progress and completion arrive as events. Chunked I/O adapts its chunk
//! size to observed throughput and back-pressure; every chunk buffer is
//! accounted against the pressure controller's memory cap.
//!
//! On transport loss the transfer pauses, waits for the reconnection
//! manager to install a replacement, reopens the remote file and resumes
//! from the committed byte offset; when the server cannot seek, the file
//! restarts from zero. Chunk-level retries (≤3) are independent of the
//! queue's whole-operation retries (≤2).

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Priority, TabId, TransferOptions};
use crate::error::{CancelKind, Error, Result};
use crate::events::{EventBus, TransferStatus};
use crate::pressure::{PressureController, StreamGrant, StreamOptions};
use crate::sftp::progress::ProgressReporter;
use crate::sftp::queue::{EnqueueOptions, SftpOp, SftpQueue};
use crate::sftp::session_pool::{SftpEntry, SftpSessionPool};
use crate::sftp::join_remote;

type RemoteFile = russh_sftp::client::fs::File;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

pub struct TransferHandle {
    pub id: Uuid,
    pub tab: TabId,
    pub direction: Direction,
    pub source: String,
    pub dest: String,
    pub priority: Priority,
    state: parking_lot::Mutex<TransferStatus>,
    cancelled: AtomicBool,
    cancel_kind: parking_lot::Mutex<CancelKind>,
    bytes: AtomicU64,
}

impl TransferHandle {
    pub fn status(&self) -> TransferStatus {
        *self.state.lock()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: TransferStatus) {
        *self.state.lock() = state;
    }

    fn add_bytes(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn reset_bytes(&self) {
        self.bytes.store(0, Ordering::Relaxed);
    }

    pub fn cancel(&self, kind: CancelKind) {
        *self.cancel_kind.lock() = kind;
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(Error::Cancelled(*self.cancel_kind.lock()))
        } else {
            Ok(())
        }
    }
}

struct ActiveTransfer {
    handle: Arc<TransferHandle>,
    reporter: Arc<ProgressReporter>,
}

pub struct TransferEngine {
    opts: TransferOptions,
    events: Arc<EventBus>,
    pressure: Arc<PressureController>,
    sessions: Arc<SftpSessionPool>,
    queue: OnceLock<Weak<SftpQueue>>,
    active: parking_lot::Mutex<HashMap<Uuid, ActiveTransfer>>,
}

/// Grow fast chunks, shrink slow or throttled ones.
pub(crate) fn adapt_chunk(
    current: usize,
    duration: Duration,
    factor: f64,
    opts: &TransferOptions,
) -> usize {
    if duration > Duration::from_millis(500) || factor < 0.5 {
        (current / 2).max(opts.min_chunk_size)
    } else if duration < Duration::from_millis(50) && factor >= 0.999 {
        (current * 2).min(opts.max_chunk_size)
    } else {
        current
    }
}

impl TransferEngine {
    pub fn new(
        opts: TransferOptions,
        events: Arc<EventBus>,
        pressure: Arc<PressureController>,
        sessions: Arc<SftpSessionPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            opts,
            events,
            pressure,
            sessions,
            queue: OnceLock::new(),
            active: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Folder transfers enqueue their per-file children through the queue.
    pub fn set_queue(&self, queue: &Arc<SftpQueue>) {
        let _ = self.queue.set(Arc::downgrade(queue));
    }

    fn queue(&self) -> Result<Arc<SftpQueue>> {
        self.queue
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Unknown("transfer engine has no operation queue".into()))
    }

    /// Create a transfer record. The id is immediately valid for
    /// cancellation and event correlation.
    pub fn register(
        &self,
        tab: &str,
        direction: Direction,
        source: &str,
        dest: &str,
        priority: Priority,
    ) -> Arc<TransferHandle> {
        let handle = Arc::new(TransferHandle {
            id: Uuid::new_v4(),
            tab: tab.to_string(),
            direction,
            source: source.to_string(),
            dest: dest.to_string(),
            priority,
            state: parking_lot::Mutex::new(TransferStatus::Queued),
            cancelled: AtomicBool::new(false),
            cancel_kind: parking_lot::Mutex::new(CancelKind::User),
            bytes: AtomicU64::new(0),
        });
        let reporter = Arc::new(ProgressReporter::new(
            Arc::clone(&self.events),
            handle.id,
            None,
            &self.opts,
        ));
        self.active.lock().insert(
            handle.id,
            ActiveTransfer {
                handle: Arc::clone(&handle),
                reporter,
            },
        );
        handle
    }

    pub fn handle(&self, id: Uuid) -> Option<Arc<TransferHandle>> {
        self.active.lock().get(&id).map(|t| Arc::clone(&t.handle))
    }

    fn reporter(&self, id: Uuid) -> Option<Arc<ProgressReporter>> {
        self.active.lock().get(&id).map(|t| Arc::clone(&t.reporter))
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn cancel(&self, id: Uuid, kind: CancelKind) -> bool {
        match self.handle(id) {
            Some(handle) => {
                handle.cancel(kind);
                true
            }
            None => false,
        }
    }

    pub fn cancel_for_tab(&self, tab: &str, kind: CancelKind) {
        let handles: Vec<Arc<TransferHandle>> = self
            .active
            .lock()
            .values()
            .filter(|t| t.handle.tab == tab)
            .map(|t| Arc::clone(&t.handle))
            .collect();
        for handle in handles {
            handle.cancel(kind);
        }
    }

    /// Remove the record and emit the final events.
    pub fn finalize(&self, id: Uuid, status: TransferStatus, error: Option<String>) {
        let removed = self.active.lock().remove(&id);
        if let Some(transfer) = removed {
            transfer.handle.set_state(status);
            transfer.reporter.finish(status, error);
        }
    }

    /// Wait for running transfers to drain, bounded by the shutdown grace.
    pub async fn await_idle(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.active_count();
        if leftover > 0 {
            warn!(leftover, "transfers still active at shutdown, force-closing");
            let ids: Vec<Uuid> = self.active.lock().keys().copied().collect();
            for id in ids {
                self.cancel(id, CancelKind::Close);
                self.finalize(id, TransferStatus::Cancelled, None);
            }
        }
    }

    // ---- single-file transfers ---------------------------------------

    pub(crate) async fn run_upload(&self, tab: &str, id: Uuid) -> Result<()> {
        let (handle, reporter) = self.lookup(id)?;
        handle.set_state(TransferStatus::Running);
        let result = self.upload_inner(tab, &handle, &reporter).await;
        self.settle(id, &handle, result).await
    }

    pub(crate) async fn run_download(&self, tab: &str, id: Uuid) -> Result<()> {
        let (handle, reporter) = self.lookup(id)?;
        handle.set_state(TransferStatus::Running);
        let result = self.download_inner(tab, &handle, &reporter).await;
        self.settle(id, &handle, result).await
    }

    fn lookup(&self, id: Uuid) -> Result<(Arc<TransferHandle>, Arc<ProgressReporter>)> {
        let handle = self.handle(id).ok_or(Error::Cancelled(CancelKind::User))?;
        let reporter = self.reporter(id).ok_or(Error::Cancelled(CancelKind::User))?;
        Ok((handle, reporter))
    }

    /// Map an attempt's outcome onto the transfer record. Transient errors
    /// leave the record alive so the queue's op retry can take another run.
    async fn settle(&self, id: Uuid, handle: &TransferHandle, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => self.finalize(id, TransferStatus::Completed, None),
            Err(Error::Cancelled(kind)) => {
                self.finalize(id, TransferStatus::Cancelled, Some(kind.to_string()));
            }
            Err(err) if err.is_transient() => {
                handle.set_state(TransferStatus::Queued);
            }
            Err(err) => {
                self.finalize(id, TransferStatus::Failed, Some(err.to_string()));
            }
        }
        result
    }

    async fn upload_inner(
        &self,
        tab: &str,
        handle: &Arc<TransferHandle>,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        let mut file = tokio::fs::File::open(&handle.source)
            .await
            .map_err(Error::from)?;
        let total = file.metadata().await.map_err(Error::from)?.len();
        reporter.set_total(Some(total));

        let grant = self
            .pressure
            .request_stream(
                handle.id,
                StreamOptions {
                    priority: handle.priority,
                },
            )
            .await?;

        let mut session = self.sessions.borrow(tab).await?;
        // Queue wait and admission pauses must not count against the rate
        // floor.
        reporter.rearm_throughput();
        let mut offset = handle.bytes_transferred();
        let mut resume_attempts = 0u32;

        let outcome = loop {
            let remote = match self.open_remote_for_write(&session, &handle.dest, offset).await {
                Ok((remote, at)) => {
                    if at == 0 && offset != 0 {
                        // Seek unsupported: restart the file from zero.
                        debug!(id = %handle.id, "server cannot seek, restarting upload");
                        offset = 0;
                        handle.reset_bytes();
                        reporter.reset();
                        if let Err(err) = file.seek(SeekFrom::Start(0)).await {
                            break Err(Error::from(err));
                        }
                    }
                    remote
                }
                Err(err) => break Err(err),
            };
            if offset > 0 {
                if let Err(err) = file.seek(SeekFrom::Start(offset)).await {
                    break Err(Error::from(err));
                }
            }

            match self
                .pump_up(&mut file, remote, offset, handle, reporter, &grant)
                .await
            {
                Ok(_) => break Ok(()),
                Err((err, reached)) => {
                    offset = reached;
                    match self
                        .recover(tab, &mut session, handle, reporter, &err, &mut resume_attempts)
                        .await
                    {
                        Ok(()) => continue,
                        Err(final_err) => break Err(final_err),
                    }
                }
            }
        };

        self.sessions.release(&session);
        outcome
    }

    async fn download_inner(
        &self,
        tab: &str,
        handle: &Arc<TransferHandle>,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        let grant = self
            .pressure
            .request_stream(
                handle.id,
                StreamOptions {
                    priority: handle.priority,
                },
            )
            .await?;

        let mut session = self.sessions.borrow(tab).await?;
        let total = match session.sftp.metadata(handle.source.as_str()).await {
            Ok(attrs) => attrs.size,
            Err(err) => {
                self.sessions.release(&session);
                return Err(Error::from(err));
            }
        };
        reporter.set_total(total);

        if let Some(parent) = Path::new(&handle.dest).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
        }
        let mut local = match tokio::fs::File::create(&handle.dest).await {
            Ok(file) => file,
            Err(err) => {
                self.sessions.release(&session);
                return Err(Error::from(err));
            }
        };

        reporter.rearm_throughput();
        let mut offset = 0u64;
        let mut resume_attempts = 0u32;

        let outcome = loop {
            let remote = match self.open_remote_for_read(&session, &handle.source, offset).await {
                Ok((remote, at)) => {
                    if at == 0 && offset != 0 {
                        debug!(id = %handle.id, "server cannot seek, restarting download");
                        offset = 0;
                        handle.reset_bytes();
                        reporter.reset();
                        if let Err(err) = local.seek(SeekFrom::Start(0)).await {
                            break Err(Error::from(err));
                        }
                    }
                    remote
                }
                Err(err) => break Err(err),
            };
            if offset > 0 {
                if let Err(err) = local.seek(SeekFrom::Start(offset)).await {
                    break Err(Error::from(err));
                }
            }

            match self
                .pump_down(remote, &mut local, offset, handle, reporter, &grant)
                .await
            {
                Ok(_) => {
                    if let Err(err) = local.flush().await {
                        break Err(Error::from(err));
                    }
                    break Ok(());
                }
                Err((err, reached)) => {
                    offset = reached;
                    match self
                        .recover(tab, &mut session, handle, reporter, &err, &mut resume_attempts)
                        .await
                    {
                        Ok(()) => continue,
                        Err(final_err) => break Err(final_err),
                    }
                }
            }
        };

        self.sessions.release(&session);
        outcome
    }

    /// Open (or reopen) the remote file for writing at `offset`. Returns the
    /// offset actually honored: 0 when the server rejected the seek.
    async fn open_remote_for_write(
        &self,
        session: &SftpEntry,
        path: &str,
        offset: u64,
    ) -> Result<(RemoteFile, u64)> {
        if offset == 0 {
            let remote = session
                .sftp
                .open_with_flags(
                    path,
                    OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                )
                .await
                .map_err(Error::from)?;
            return Ok((remote, 0));
        }
        let mut remote = session
            .sftp
            .open_with_flags(path, OpenFlags::WRITE)
            .await
            .map_err(Error::from)?;
        match remote.seek(SeekFrom::Start(offset)).await {
            Ok(_) => Ok((remote, offset)),
            Err(_) => {
                let remote = session
                    .sftp
                    .open_with_flags(
                        path,
                        OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                    )
                    .await
                    .map_err(Error::from)?;
                Ok((remote, 0))
            }
        }
    }

    async fn open_remote_for_read(
        &self,
        session: &SftpEntry,
        path: &str,
        offset: u64,
    ) -> Result<(RemoteFile, u64)> {
        let mut remote = session
            .sftp
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(Error::from)?;
        if offset == 0 {
            return Ok((remote, 0));
        }
        match remote.seek(SeekFrom::Start(offset)).await {
            Ok(_) => Ok((remote, offset)),
            Err(_) => {
                let remote = session
                    .sftp
                    .open_with_flags(path, OpenFlags::READ)
                    .await
                    .map_err(Error::from)?;
                Ok((remote, 0))
            }
        }
    }

    /// Decide what a failed pump means: pause-and-resume for connection
    /// loss, bounded reopen for other transient errors, fail otherwise.
    async fn recover(
        &self,
        tab: &str,
        session: &mut Arc<SftpEntry>,
        handle: &Arc<TransferHandle>,
        reporter: &ProgressReporter,
        err: &Error,
        resume_attempts: &mut u32,
    ) -> Result<()> {
        if matches!(err, Error::Cancelled(_)) {
            return Err(err.clone());
        }
        if err.is_connection_loss() {
            warn!(id = %handle.id, "transport lost mid-transfer, pausing");
            handle.set_state(TransferStatus::Paused);
            self.sessions.release(session);
            *session = self.reacquire(tab).await?;
            handle.set_state(TransferStatus::Running);
            reporter.rearm_throughput();
            return Ok(());
        }
        if err.is_transient() {
            *resume_attempts += 1;
            if *resume_attempts > self.opts.chunk_retries {
                return Err(Error::TransferFailed(err.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(200 * *resume_attempts as u64)).await;
            reporter.rearm_throughput();
            return Ok(());
        }
        Err(Error::TransferFailed(err.to_string()))
    }

    /// Wait out the reconnection window for a replacement transport.
    async fn reacquire(&self, tab: &str) -> Result<Arc<SftpEntry>> {
        let deadline = Instant::now() + self.opts.resume_window;
        loop {
            match self.sessions.borrow(tab).await {
                Ok(session) => return Ok(session),
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    async fn pump_up(
        &self,
        file: &mut tokio::fs::File,
        mut remote: RemoteFile,
        start: u64,
        handle: &Arc<TransferHandle>,
        reporter: &ProgressReporter,
        grant: &StreamGrant,
    ) -> std::result::Result<u64, (Error, u64)> {
        let mut offset = start;
        let mut chunk = self.opts.chunk_size.clamp(self.opts.min_chunk_size, self.opts.max_chunk_size);
        let mut buf = vec![0u8; self.opts.max_chunk_size];
        loop {
            if let Err(err) = handle.check_cancel() {
                return Err((err, offset));
            }
            let n = match file.read(&mut buf[..chunk]).await {
                Ok(n) => n,
                Err(err) => return Err((Error::from(err), offset)),
            };
            if n == 0 {
                if let Err(err) = remote.shutdown().await {
                    return Err((Error::from(err), offset));
                }
                return Ok(offset);
            }
            let ticket = grant.reserve(n);
            let started = Instant::now();
            if let Err(err) = remote.write_all(&buf[..n]).await {
                return Err((Error::from(err), offset));
            }
            drop(ticket);

            offset += n as u64;
            handle.add_bytes(n);
            reporter.record(n);
            if let Err(err) = reporter.throughput_ok() {
                return Err((err, offset));
            }
            let took = started.elapsed();
            chunk = adapt_chunk(chunk, took, grant.effective_factor(), &self.opts);
            grant.pace(took).await;
        }
    }

    async fn pump_down(
        &self,
        mut remote: RemoteFile,
        local: &mut tokio::fs::File,
        start: u64,
        handle: &Arc<TransferHandle>,
        reporter: &ProgressReporter,
        grant: &StreamGrant,
    ) -> std::result::Result<u64, (Error, u64)> {
        let mut offset = start;
        let mut chunk = self.opts.chunk_size.clamp(self.opts.min_chunk_size, self.opts.max_chunk_size);
        let mut buf = vec![0u8; self.opts.max_chunk_size];
        loop {
            if let Err(err) = handle.check_cancel() {
                return Err((err, offset));
            }
            let ticket = grant.reserve(chunk);
            let started = Instant::now();
            let n = match remote.read(&mut buf[..chunk]).await {
                Ok(n) => n,
                Err(err) => return Err((Error::from(err), offset)),
            };
            if n == 0 {
                return Ok(offset);
            }
            if let Err(err) = local.write_all(&buf[..n]).await {
                return Err((Error::from(err), offset));
            }
            drop(ticket);

            offset += n as u64;
            handle.add_bytes(n);
            reporter.record(n);
            if let Err(err) = reporter.throughput_ok() {
                return Err((err, offset));
            }
            let took = started.elapsed();
            chunk = adapt_chunk(chunk, took, grant.effective_factor(), &self.opts);
            grant.pace(took).await;
        }
    }

    // ---- bounded in-memory reads/writes (editor staging) -------------

    pub(crate) async fn read_inline(&self, tab: &str, path: &str) -> Result<Bytes> {
        let session = self.sessions.borrow(tab).await?;
        let result = async {
            let attrs = session.sftp.metadata(path).await.map_err(Error::from)?;
            if let Some(size) = attrs.size {
                if size > self.opts.max_inline_read {
                    return Err(Error::Unknown(format!(
                        "{path} is {size} bytes, larger than the {} byte inline limit",
                        self.opts.max_inline_read
                    )));
                }
            }
            let remote = session
                .sftp
                .open_with_flags(path, OpenFlags::READ)
                .await
                .map_err(Error::from)?;
            let mut data = Vec::new();
            remote
                .take(self.opts.max_inline_read + 1)
                .read_to_end(&mut data)
                .await
                .map_err(Error::from)?;
            if data.len() as u64 > self.opts.max_inline_read {
                return Err(Error::Unknown(format!(
                    "{path} grew past the inline read limit"
                )));
            }
            Ok(Bytes::from(data))
        }
        .await;
        self.sessions.release(&session);
        result
    }

    pub(crate) async fn write_inline(&self, tab: &str, path: &str, data: Bytes) -> Result<()> {
        let session = self.sessions.borrow(tab).await?;
        let result = async {
            let mut remote = session
                .sftp
                .open_with_flags(
                    path,
                    OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                )
                .await
                .map_err(Error::from)?;
            remote.write_all(&data).await.map_err(Error::from)?;
            remote.shutdown().await.map_err(Error::from)?;
            Ok(())
        }
        .await;
        self.sessions.release(&session);
        result
    }

    // ---- folder and multi-file transfers -----------------------------

    pub(crate) async fn run_upload_folder(&self, tab: &str, id: Uuid) -> Result<()> {
        let (handle, reporter) = self.lookup(id)?;
        handle.set_state(TransferStatus::Running);

        let local_root = PathBuf::from(&handle.source);
        let remote_root = handle.dest.clone();
        let files = walk_local(&local_root).await?;
        let total: u64 = files.iter().map(|f| f.size).sum();
        reporter.set_total(Some(total));

        // Create the remote directory skeleton first.
        {
            let session = self.sessions.borrow(tab).await?;
            let mut dirs: Vec<String> = files
                .iter()
                .filter_map(|f| f.rel.parent().map(|p| p.to_path_buf()))
                .map(|p| rel_to_remote(&remote_root, &p))
                .collect();
            dirs.push(remote_root.clone());
            dirs.sort();
            dirs.dedup();
            for dir in dirs {
                // Existing directories are fine.
                let _ = session.sftp.create_dir(dir.as_str()).await;
            }
            self.sessions.release(&session);
        }

        let pairs: Vec<(PathBuf, String)> = files
            .iter()
            .map(|f| {
                (
                    local_root.join(&f.rel),
                    rel_to_remote(&remote_root, &f.rel),
                )
            })
            .collect();
        let result = self.dispatch_children(tab, &handle, &reporter, &pairs).await;
        self.settle(id, &handle, result).await
    }

    pub(crate) async fn run_upload_multi(
        &self,
        tab: &str,
        id: Uuid,
        files: &[(PathBuf, String)],
    ) -> Result<()> {
        let (handle, reporter) = self.lookup(id)?;
        handle.set_state(TransferStatus::Running);
        let mut total = 0u64;
        for (local, _) in files {
            if let Ok(meta) = tokio::fs::metadata(local).await {
                total += meta.len();
            }
        }
        reporter.set_total(Some(total));
        let result = self
            .dispatch_children(tab, &handle, &reporter, files)
            .await;
        self.settle(id, &handle, result).await
    }

    pub(crate) async fn run_download_folder(&self, tab: &str, id: Uuid) -> Result<()> {
        let (handle, reporter) = self.lookup(id)?;
        handle.set_state(TransferStatus::Running);

        let remote_root = handle.source.clone();
        let local_root = PathBuf::from(&handle.dest);

        // Enumerate remote entries, then dispatch per-file downloads.
        let session = self.sessions.borrow(tab).await?;
        let listing = walk_remote(&session, &remote_root).await;
        self.sessions.release(&session);
        let files = listing?;
        let total: u64 = files.iter().map(|(_, _, size)| size).sum();
        reporter.set_total(Some(total));

        let mut pairs: Vec<(PathBuf, String)> = Vec::with_capacity(files.len());
        for (remote_path, rel, _) in &files {
            let local_path = local_root.join(rel);
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(Error::from)?;
            }
            pairs.push((local_path, remote_path.clone()));
        }

        let queue = self.queue()?;
        let mut children = Vec::with_capacity(pairs.len());
        for (local, remote) in &pairs {
            let child = self.register(
                tab,
                Direction::Download,
                remote,
                &local.to_string_lossy(),
                handle.priority,
            );
            let rx = queue.enqueue(
                tab,
                SftpOp::Download { transfer: child.id },
                EnqueueOptions {
                    priority: handle.priority,
                    ..Default::default()
                },
            );
            children.push((child, rx));
        }
        let result = self.await_children(&handle, &reporter, children).await;
        self.settle(id, &handle, result).await
    }

    /// Enqueue one upload per file, inheriting the parent's priority, and
    /// wait for the lot.
    async fn dispatch_children(
        &self,
        tab: &str,
        handle: &Arc<TransferHandle>,
        reporter: &Arc<ProgressReporter>,
        pairs: &[(PathBuf, String)],
    ) -> Result<()> {
        let queue = self.queue()?;
        let mut children = Vec::with_capacity(pairs.len());
        for (local, remote) in pairs {
            let size_hint = tokio::fs::metadata(local).await.ok().map(|m| m.len());
            let child = self.register(
                tab,
                Direction::Upload,
                &local.to_string_lossy(),
                remote,
                handle.priority,
            );
            let rx = queue.enqueue(
                tab,
                SftpOp::Upload { transfer: child.id },
                EnqueueOptions {
                    priority: handle.priority,
                    size_hint,
                    ..Default::default()
                },
            );
            children.push((child, rx));
        }
        self.await_children(handle, reporter, children).await
    }

    async fn await_children(
        &self,
        handle: &Arc<TransferHandle>,
        reporter: &Arc<ProgressReporter>,
        children: Vec<(
            Arc<TransferHandle>,
            tokio::sync::oneshot::Receiver<Result<crate::sftp::queue::OpOutput>>,
        )>,
    ) -> Result<()> {
        let total = children.len();
        let mut failed = 0usize;
        for (child, rx) in children {
            if handle.check_cancel().is_err() {
                child.cancel(*handle.cancel_kind.lock());
            }
            match rx.await {
                Ok(Ok(_)) => {
                    reporter.record(child.bytes_transferred() as usize);
                }
                Ok(Err(err)) => {
                    failed += 1;
                    debug!(parent = %handle.id, child = %child.id, "child transfer failed: {err}");
                    // Exhausted-retry children may still hold a record.
                    self.finalize(child.id, TransferStatus::Failed, Some(err.to_string()));
                }
                Err(_) => {
                    failed += 1;
                }
            }
        }
        handle.check_cancel()?;
        if failed > 0 {
            Err(Error::TransferFailed(format!(
                "{failed} of {total} files failed"
            )))
        } else {
            Ok(())
        }
    }
}

struct LocalFile {
    rel: PathBuf,
    size: u64,
}

/// Recursively enumerate regular files under `root`, relative paths only.
async fn walk_local(root: &Path) -> Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(Error::from)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::from)? {
            let path = entry.path();
            let meta = entry.metadata().await.map_err(Error::from)?;
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|_| Error::Unknown("walk escaped its root".into()))?
                    .to_path_buf();
                files.push(LocalFile {
                    rel,
                    size: meta.len(),
                });
            }
        }
    }
    Ok(files)
}

/// Recursively enumerate a remote directory: (full path, relative path,
/// size) per regular file.
async fn walk_remote(
    session: &SftpEntry,
    root: &str,
) -> Result<Vec<(String, PathBuf, u64)>> {
    let mut files = Vec::new();
    let mut stack = vec![(root.to_string(), PathBuf::new())];
    while let Some((dir, rel)) = stack.pop() {
        let entries = session.sftp.read_dir(dir.as_str()).await.map_err(Error::from)?;
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let full = join_remote(&dir, &name);
            let meta = entry.metadata();
            if meta.is_dir() {
                stack.push((full, rel.join(&name)));
            } else {
                files.push((full, rel.join(&name), meta.size.unwrap_or(0)));
            }
        }
    }
    Ok(files)
}

fn rel_to_remote(root: &str, rel: &Path) -> String {
    let mut out = root.trim_end_matches('/').to_string();
    for component in rel.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.is_empty() {
            continue;
        }
        out.push('/');
        out.push_str(&name);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolOptions, PressureOptions, SftpOptions};
    use crate::pool::ConnectionPool;
    use crate::store::MemoryStore;

    fn engine() -> Arc<TransferEngine> {
        let events = Arc::new(EventBus::default());
        let pool = ConnectionPool::new(
            PoolOptions::default(),
            Arc::clone(&events),
            Arc::new(MemoryStore::new()),
        );
        let sessions = SftpSessionPool::new(SftpOptions::default(), pool);
        let pressure = PressureController::new(PressureOptions::default());
        TransferEngine::new(TransferOptions::default(), events, pressure, sessions)
    }

    #[test]
    fn chunk_adaptation_grows_and_shrinks_within_bounds() {
        let opts = TransferOptions::default();
        // Fast and unthrottled: grow.
        assert_eq!(
            adapt_chunk(64 * 1024, Duration::from_millis(10), 1.0, &opts),
            128 * 1024
        );
        // Slow: shrink.
        assert_eq!(
            adapt_chunk(64 * 1024, Duration::from_millis(900), 1.0, &opts),
            32 * 1024
        );
        // Heavy throttle: shrink even when fast.
        assert_eq!(
            adapt_chunk(64 * 1024, Duration::from_millis(10), 0.3, &opts),
            32 * 1024
        );
        // Bounds hold.
        assert_eq!(
            adapt_chunk(opts.max_chunk_size, Duration::from_millis(1), 1.0, &opts),
            opts.max_chunk_size
        );
        assert_eq!(
            adapt_chunk(opts.min_chunk_size, Duration::from_secs(2), 1.0, &opts),
            opts.min_chunk_size
        );
    }

    #[tokio::test]
    async fn registry_round_trip_and_cancel() {
        let engine = engine();
        let handle = engine.register("t1", Direction::Upload, "/tmp/a", "/remote/a", Priority::Normal);
        assert_eq!(handle.status(), TransferStatus::Queued);
        assert_eq!(engine.active_count(), 1);

        assert!(engine.cancel(handle.id, CancelKind::User));
        assert!(handle.check_cancel().is_err());

        engine.finalize(handle.id, TransferStatus::Cancelled, None);
        assert_eq!(engine.active_count(), 0);
        assert!(!engine.cancel(handle.id, CancelKind::User), "already gone");
    }

    #[tokio::test]
    async fn cancel_for_tab_only_touches_that_tab() {
        let engine = engine();
        let a = engine.register("t1", Direction::Upload, "/a", "/ra", Priority::Normal);
        let b = engine.register("t2", Direction::Download, "/b", "/rb", Priority::Normal);
        engine.cancel_for_tab("t1", CancelKind::Close);
        assert!(a.check_cancel().is_err());
        assert!(b.check_cancel().is_ok());
    }

    #[tokio::test]
    async fn await_idle_force_closes_stragglers() {
        let engine = engine();
        let handle = engine.register("t1", Direction::Upload, "/a", "/ra", Priority::Normal);
        engine.await_idle(Duration::from_millis(150)).await;
        assert_eq!(engine.active_count(), 0);
        assert_eq!(handle.status(), TransferStatus::Cancelled);
    }

    #[tokio::test]
    async fn local_walk_collects_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tokio::fs::create_dir_all(root.join("a/b")).await.unwrap();
        tokio::fs::write(root.join("top.txt"), b"1234").await.unwrap();
        tokio::fs::write(root.join("a/mid.txt"), b"12").await.unwrap();
        tokio::fs::write(root.join("a/b/deep.txt"), b"123456").await.unwrap();

        let mut files = walk_local(root).await.unwrap();
        files.sort_by(|x, y| x.rel.cmp(&y.rel));
        let rels: Vec<String> = files
            .iter()
            .map(|f| f.rel.to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(rels, vec!["a/b/deep.txt", "a/mid.txt", "top.txt"]);
        assert_eq!(files.iter().map(|f| f.size).sum::<u64>(), 12);
    }

    #[test]
    fn relative_paths_map_to_remote() {
        assert_eq!(rel_to_remote("/up", Path::new("a/b.txt")), "/up/a/b.txt");
        assert_eq!(rel_to_remote("/up/", Path::new("c.txt")), "/up/c.txt");
    }
}
