//! The inbound API consumed by the terminal / file-manager surface.
//!
//! One `SessionManager` per application. `connect` binds a tab to a pooled
//! transport and starts its terminal driver; byte streams and status come
//! back as events on the context's bus. File operations go through the
//! per-tab SFTP queue; transfers return their id immediately and report via
//! transfer events.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use russh::client::Msg;
use russh::Channel;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AuthMethod, ConnectConfig, Priority, Protocol, TabId, TermOptions};
use crate::context::AppContext;
use crate::error::{CancelKind, Error, Result};
use crate::events::{ConnectionEvent, ConnectionStatus, EventBus, TerminalEvent, TransferStatus};
use crate::latency::QualitySample;
use crate::sftp::queue::{EnqueueOptions, OpOutput, SftpOp};
use crate::sftp::transfer::Direction;
use crate::sftp::FileEntry;
use crate::telnet::{AutoLoginStep, PromptMatcher, TelnetCodec};
use crate::transport::Transport;
use crate::x11;

/// Options for a single queued SFTP call.
#[derive(Debug, Clone, Default)]
pub struct SftpCallOptions {
    pub priority: Priority,
    pub merge: bool,
}

/// Options for starting a transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferRequest {
    pub priority: Priority,
}

enum TermCmd {
    Write(Bytes),
    Resize { cols: u32, rows: u32 },
    Close,
}

struct TabRuntime {
    key: String,
    transport: Arc<Transport>,
    driver_tx: mpsc::Sender<TermCmd>,
    driver: JoinHandle<()>,
    x11: Option<JoinHandle<()>>,
}

pub struct SessionManager {
    ctx: Arc<AppContext>,
    tabs: tokio::sync::Mutex<HashMap<TabId, TabRuntime>>,
    sftp_ids: parking_lot::Mutex<HashMap<Uuid, TabId>>,
    replaced_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(ctx: Arc<AppContext>) -> Arc<Self> {
        let manager = Arc::new(Self {
            ctx,
            tabs: tokio::sync::Mutex::new(HashMap::new()),
            sftp_ids: parking_lot::Mutex::new(HashMap::new()),
            replaced_task: parking_lot::Mutex::new(None),
        });
        manager.spawn_replacement_watcher();
        manager
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Watch for in-place transport replacements and reopen the shell for
    /// every affected tab on the new transport.
    fn spawn_replacement_watcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut rx = self.ctx.events.subscribe_connection();
        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                };
                if let ConnectionEvent::Replaced { key } = event {
                    let Some(manager) = Weak::upgrade(&weak) else {
                        break;
                    };
                    manager.handle_replacement(&key).await;
                }
            }
        });
        *self.replaced_task.lock() = Some(task);
    }

    async fn handle_replacement(self: &Arc<Self>, key: &str) {
        let Some(transport) = self.ctx.pool.get(key).await else {
            return;
        };
        for tab in transport.tabs() {
            let bound = {
                let tabs = self.tabs.lock().await;
                tabs.contains_key(&tab)
            };
            if !bound {
                continue;
            }
            info!(tab = %tab, key = %key, "reattaching terminal to replaced transport");
            match self.attach_terminal(&tab, &transport).await {
                Ok(runtime) => {
                    let mut tabs = self.tabs.lock().await;
                    if let Some(old) = tabs.insert(tab.clone(), runtime) {
                        old.driver.abort();
                        if let Some(x11) = old.x11 {
                            x11.abort();
                        }
                    }
                    if transport.protocol == Protocol::Ssh {
                        self.ctx.latency.register(&tab, Arc::clone(&transport));
                    }
                }
                Err(err) => {
                    warn!(tab = %tab, "failed to reattach terminal: {err}");
                }
            }
        }
    }

    // ---- connection lifecycle ----------------------------------------

    /// Connect a tab: acquire (or reuse) a pooled transport, open the
    /// terminal, start probing. Returns the connection id.
    pub async fn connect(self: &Arc<Self>, tab: &str, mut cfg: ConnectConfig) -> Result<Uuid> {
        cfg.tab_id = Some(tab.to_string());
        self.ctx.events.status(
            tab,
            ConnectionStatus {
                connected: false,
                connecting: true,
                quality: None,
                host: cfg.host.clone(),
                port: cfg.port,
            },
        );

        let transport = match self.ctx.pool.get_connection(cfg.clone()).await {
            Ok(transport) => transport,
            Err(err) => {
                self.ctx.events.status(
                    tab,
                    ConnectionStatus {
                        connected: false,
                        connecting: false,
                        quality: None,
                        host: cfg.host.clone(),
                        port: cfg.port,
                    },
                );
                return Err(err);
            }
        };

        let runtime = match self.attach_terminal(tab, &transport).await {
            Ok(runtime) => runtime,
            Err(err) => {
                self.ctx.pool.release(&transport, Some(tab)).await;
                return Err(err);
            }
        };
        let connection_id = transport.id;
        self.tabs.lock().await.insert(tab.to_string(), runtime);

        if transport.protocol == Protocol::Ssh {
            self.ctx.latency.register(tab, Arc::clone(&transport));
        }
        let ident = if cfg.username.is_empty() {
            format!("{}:{}", cfg.host, cfg.port)
        } else {
            format!("{}@{}:{}", cfg.username, cfg.host, cfg.port)
        };
        let _ = self.ctx.store.push_recent(&ident).await;

        self.ctx.events.status(
            tab,
            ConnectionStatus {
                connected: true,
                connecting: false,
                quality: self.ctx.latency.quality(tab),
                host: cfg.host.clone(),
                port: cfg.port,
            },
        );
        info!(tab = %tab, key = %transport.key, "tab connected");
        Ok(connection_id)
    }

    /// Connect using a saved credential record from the config store. The
    /// decrypted secret is treated as opaque and never logged.
    pub async fn connect_with_credential(
        self: &Arc<Self>,
        tab: &str,
        host: &str,
        port: u16,
        credential_id: &str,
    ) -> Result<Uuid> {
        let record = self
            .ctx
            .store
            .credential(credential_id)
            .await?
            .ok_or_else(|| {
                Error::BadCredentials(format!("no credential record {credential_id:?}"))
            })?;
        let mut cfg = ConnectConfig::password(host, port, &record.username, "");
        cfg.auth = match record.kind {
            crate::store::CredentialKind::Password => AuthMethod::Password(record.secret.clone()),
            crate::store::CredentialKind::KeyPath => AuthMethod::Key {
                material: crate::config::KeyMaterial::Path(
                    record.secret.expose_secret().to_string().into(),
                ),
                passphrase: None,
            },
        };
        self.connect(tab, cfg).await
    }

    /// Tear a tab down: cancel its file work, close its sessions, release
    /// the transport. Tab-scoped transports close immediately.
    pub async fn disconnect(&self, tab: &str) {
        let runtime = self.tabs.lock().await.remove(tab);
        self.ctx.queue.cancel_for_tab(tab, CancelKind::User);
        self.ctx.sessions.close_all(tab).await;
        self.ctx.latency.unregister(tab);
        self.sftp_ids.lock().retain(|_, t| t != tab);

        let Some(runtime) = runtime else {
            return;
        };
        runtime.transport.mark_intentional_close();
        let _ = runtime.driver_tx.send(TermCmd::Close).await;
        if let Some(x11) = runtime.x11 {
            x11.abort();
        }
        self.ctx.pool.release(&runtime.transport, Some(tab)).await;
        self.ctx.pool.retire_if_unreferenced(&runtime.key).await;
        debug!(tab = %tab, "tab disconnected");
    }

    pub async fn write_input(&self, tab: &str, bytes: &[u8]) -> Result<()> {
        let tabs = self.tabs.lock().await;
        let runtime = tabs.get(tab).ok_or(Error::NotConnected)?;
        runtime
            .driver_tx
            .send(TermCmd::Write(Bytes::copy_from_slice(bytes)))
            .await
            .map_err(|_| Error::NotConnected)
    }

    pub async fn resize(&self, tab: &str, cols: u32, rows: u32) -> Result<()> {
        let tabs = self.tabs.lock().await;
        let runtime = tabs.get(tab).ok_or(Error::NotConnected)?;
        runtime
            .driver_tx
            .send(TermCmd::Resize { cols, rows })
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Report that host networking came back; wakes pending reconnects.
    pub fn network_restored(&self) {
        self.ctx.reconnect.network_restored();
    }

    // ---- SFTP surface ------------------------------------------------

    /// Open (or reuse) the tab's SFTP endpoint.
    pub async fn open_sftp(&self, tab: &str) -> Result<Uuid> {
        self.tabs
            .lock()
            .await
            .get(tab)
            .ok_or(Error::NotConnected)?;
        self.ctx.sessions.ensure_primary(tab).await?;
        let mut ids = self.sftp_ids.lock();
        if let Some((id, _)) = ids.iter().find(|(_, t)| t.as_str() == tab) {
            return Ok(*id);
        }
        let id = Uuid::new_v4();
        ids.insert(id, tab.to_string());
        Ok(id)
    }

    fn tab_for_sftp(&self, sftp_id: Uuid) -> Result<TabId> {
        self.sftp_ids
            .lock()
            .get(&sftp_id)
            .cloned()
            .ok_or(Error::NotConnected)
    }

    pub async fn readdir(
        &self,
        sftp_id: Uuid,
        path: &str,
        opts: SftpCallOptions,
    ) -> Result<Vec<FileEntry>> {
        let tab = self.tab_for_sftp(sftp_id)?;
        let output = self
            .ctx
            .queue
            .submit(
                &tab,
                SftpOp::Readdir {
                    path: path.to_string(),
                },
                EnqueueOptions {
                    priority: opts.priority,
                    can_merge: opts.merge,
                    ..Default::default()
                },
            )
            .await?;
        match output {
            OpOutput::Entries(entries) => Ok(entries),
            other => Err(Error::Unknown(format!("unexpected readdir output {other:?}"))),
        }
    }

    pub async fn stat(&self, sftp_id: Uuid, path: &str, opts: SftpCallOptions) -> Result<FileEntry> {
        let tab = self.tab_for_sftp(sftp_id)?;
        let output = self
            .ctx
            .queue
            .submit(
                &tab,
                SftpOp::Stat {
                    path: path.to_string(),
                },
                EnqueueOptions {
                    priority: opts.priority,
                    can_merge: opts.merge,
                    ..Default::default()
                },
            )
            .await?;
        match output {
            OpOutput::Entry(entry) => Ok(entry),
            other => Err(Error::Unknown(format!("unexpected stat output {other:?}"))),
        }
    }

    pub async fn read_file(&self, sftp_id: Uuid, path: &str, opts: SftpCallOptions) -> Result<Bytes> {
        let tab = self.tab_for_sftp(sftp_id)?;
        let output = self
            .ctx
            .queue
            .submit(
                &tab,
                SftpOp::ReadFile {
                    path: path.to_string(),
                },
                EnqueueOptions {
                    priority: opts.priority,
                    can_merge: opts.merge,
                    ..Default::default()
                },
            )
            .await?;
        match output {
            OpOutput::Data(data) => Ok(data),
            other => Err(Error::Unknown(format!("unexpected read output {other:?}"))),
        }
    }

    pub async fn write_file(
        &self,
        sftp_id: Uuid,
        path: &str,
        data: Bytes,
        opts: SftpCallOptions,
    ) -> Result<()> {
        let tab = self.tab_for_sftp(sftp_id)?;
        self.ctx
            .queue
            .submit(
                &tab,
                SftpOp::WriteFile {
                    path: path.to_string(),
                    data,
                },
                EnqueueOptions {
                    priority: opts.priority,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn mkdir(&self, sftp_id: Uuid, path: &str, opts: SftpCallOptions) -> Result<()> {
        let tab = self.tab_for_sftp(sftp_id)?;
        self.ctx
            .queue
            .submit(
                &tab,
                SftpOp::Mkdir {
                    path: path.to_string(),
                },
                EnqueueOptions {
                    priority: opts.priority,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn remove(&self, sftp_id: Uuid, path: &str, dir: bool, opts: SftpCallOptions) -> Result<()> {
        let tab = self.tab_for_sftp(sftp_id)?;
        let op = if dir {
            SftpOp::RemoveDir {
                path: path.to_string(),
            }
        } else {
            SftpOp::RemoveFile {
                path: path.to_string(),
            }
        };
        self.ctx
            .queue
            .submit(
                &tab,
                op,
                EnqueueOptions {
                    priority: opts.priority,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn rename(
        &self,
        sftp_id: Uuid,
        from: &str,
        to: &str,
        opts: SftpCallOptions,
    ) -> Result<()> {
        let tab = self.tab_for_sftp(sftp_id)?;
        self.ctx
            .queue
            .submit(
                &tab,
                SftpOp::Rename {
                    from: from.to_string(),
                    to: to.to_string(),
                },
                EnqueueOptions {
                    priority: opts.priority,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    // ---- transfers ---------------------------------------------------

    pub async fn upload(
        &self,
        sftp_id: Uuid,
        local: &str,
        remote: &str,
        opts: TransferRequest,
    ) -> Result<Uuid> {
        let tab = self.tab_for_sftp(sftp_id)?;
        let size_hint = tokio::fs::metadata(local).await.ok().map(|m| m.len());
        let handle = self
            .ctx
            .transfers
            .register(&tab, Direction::Upload, local, remote, opts.priority);
        self.dispatch_transfer(
            &tab,
            handle.id,
            SftpOp::Upload {
                transfer: handle.id,
            },
            opts.priority,
            size_hint,
        );
        Ok(handle.id)
    }

    pub async fn download(
        &self,
        sftp_id: Uuid,
        remote: &str,
        local: &str,
        opts: TransferRequest,
    ) -> Result<Uuid> {
        let tab = self.tab_for_sftp(sftp_id)?;
        let handle = self
            .ctx
            .transfers
            .register(&tab, Direction::Download, remote, local, opts.priority);
        self.dispatch_transfer(
            &tab,
            handle.id,
            SftpOp::Download {
                transfer: handle.id,
            },
            opts.priority,
            None,
        );
        Ok(handle.id)
    }

    pub async fn upload_folder(
        &self,
        sftp_id: Uuid,
        local: &str,
        remote: &str,
        opts: TransferRequest,
    ) -> Result<Uuid> {
        let tab = self.tab_for_sftp(sftp_id)?;
        let handle = self
            .ctx
            .transfers
            .register(&tab, Direction::Upload, local, remote, opts.priority);
        self.dispatch_transfer(
            &tab,
            handle.id,
            SftpOp::UploadFolder {
                transfer: handle.id,
            },
            opts.priority,
            None,
        );
        Ok(handle.id)
    }

    pub async fn download_folder(
        &self,
        sftp_id: Uuid,
        remote: &str,
        local: &str,
        opts: TransferRequest,
    ) -> Result<Uuid> {
        let tab = self.tab_for_sftp(sftp_id)?;
        let handle = self
            .ctx
            .transfers
            .register(&tab, Direction::Download, remote, local, opts.priority);
        self.dispatch_transfer(
            &tab,
            handle.id,
            SftpOp::DownloadFolder {
                transfer: handle.id,
            },
            opts.priority,
            None,
        );
        Ok(handle.id)
    }

    pub async fn upload_files(
        &self,
        sftp_id: Uuid,
        files: Vec<(std::path::PathBuf, String)>,
        opts: TransferRequest,
    ) -> Result<Uuid> {
        let tab = self.tab_for_sftp(sftp_id)?;
        let handle = self.ctx.transfers.register(
            &tab,
            Direction::Upload,
            "<multiple>",
            "<multiple>",
            opts.priority,
        );
        self.dispatch_transfer(
            &tab,
            handle.id,
            SftpOp::UploadMulti {
                transfer: handle.id,
                files,
            },
            opts.priority,
            None,
        );
        Ok(handle.id)
    }

    /// Enqueue the transfer op and make sure its record is finalized even
    /// when the queue exhausts its retries.
    fn dispatch_transfer(
        &self,
        tab: &str,
        id: Uuid,
        op: SftpOp,
        priority: Priority,
        size_hint: Option<u64>,
    ) {
        let rx = self.ctx.queue.enqueue(
            tab,
            op,
            EnqueueOptions {
                priority,
                size_hint,
                ..Default::default()
            },
        );
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    ctx.transfers
                        .finalize(id, TransferStatus::Failed, Some(err.to_string()));
                }
                Err(_) => {
                    ctx.transfers
                        .finalize(id, TransferStatus::Cancelled, None);
                }
            }
        });
    }

    pub fn cancel_transfer(&self, id: Uuid) -> bool {
        self.ctx.transfers.cancel(id, CancelKind::User)
    }

    // ---- latency -----------------------------------------------------

    pub fn get_latency(&self, tab: &str) -> Vec<QualitySample> {
        self.ctx.latency.window(tab)
    }

    pub async fn measure_latency(&self, tab: &str) -> Result<u32> {
        self.ctx.latency.measure_now(tab).await
    }

    // ---- terminal attachment -----------------------------------------

    async fn attach_terminal(
        self: &Arc<Self>,
        tab: &str,
        transport: &Arc<Transport>,
    ) -> Result<TabRuntime> {
        match transport.protocol {
            Protocol::Ssh => self.attach_ssh(tab, transport).await,
            Protocol::Telnet => self.attach_telnet(tab, transport).await,
        }
    }

    async fn attach_ssh(
        self: &Arc<Self>,
        tab: &str,
        transport: &Arc<Transport>,
    ) -> Result<TabRuntime> {
        let handle = transport
            .ssh_handle()
            .ok_or_else(|| Error::TransportNotReady("expected an ssh transport".into()))?;
        let permit = Arc::clone(&transport.channel_permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Shutdown)?;
        let channel = handle.channel_open_session().await.map_err(Error::from)?;

        let term: &TermOptions = &transport.config.term;
        let mut x11_task = None;
        if transport.config.enable_x11 {
            let cookie = x11::fake_cookie();
            channel
                .request_x11(false, false, "MIT-MAGIC-COOKIE-1", cookie, 0)
                .await
                .map_err(Error::from)?;
            if let Some(rx) = transport.take_x11_rx() {
                x11_task = Some(x11::spawn_acceptor(rx, transport.config.x11_display));
            }
        }
        channel
            .request_pty(false, &term.term, term.cols, term.rows, 0, 0, &[])
            .await
            .map_err(Error::from)?;
        channel.request_shell(true).await.map_err(Error::from)?;

        let (tx, rx) = mpsc::channel(64);
        let driver = tokio::spawn(ssh_shell_driver(
            Arc::clone(&self.ctx),
            tab.to_string(),
            transport.key.clone(),
            channel,
            rx,
            permit,
        ));
        Ok(TabRuntime {
            key: transport.key.clone(),
            transport: Arc::clone(transport),
            driver_tx: tx,
            driver,
            x11: x11_task,
        })
    }

    async fn attach_telnet(
        self: &Arc<Self>,
        tab: &str,
        transport: &Arc<Transport>,
    ) -> Result<TabRuntime> {
        let link = transport
            .telnet_link()
            .ok_or_else(|| Error::TransportNotReady("expected a telnet transport".into()))?;
        let reader = link
            .take_reader()
            .ok_or_else(|| Error::TransportNotReady("telnet stream already attached".into()))?;

        let username = transport.config.username.clone();
        let password = match &transport.config.auth {
            AuthMethod::Password(secret) => Some(secret.clone()),
            _ => None,
        };

        let (tx, rx) = mpsc::channel(64);
        let driver = tokio::spawn(telnet_driver(
            Arc::clone(&self.ctx),
            tab.to_string(),
            transport.key.clone(),
            link,
            reader,
            rx,
            username,
            password,
        ));
        Ok(TabRuntime {
            key: transport.key.clone(),
            transport: Arc::clone(transport),
            driver_tx: tx,
            driver,
            x11: None,
        })
    }
}

// ---- drivers ---------------------------------------------------------

enum Step {
    Msg(Option<russh::ChannelMsg>),
    Cmd(Option<TermCmd>),
}

/// Pumps shell bytes to the event bus and commands to the channel. Ends on
/// channel close or an explicit `Close` command; unexpected transport death
/// is reported to the pool.
async fn ssh_shell_driver(
    ctx: Arc<AppContext>,
    tab: TabId,
    key: String,
    mut channel: Channel<Msg>,
    mut rx: mpsc::Receiver<TermCmd>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let mut exit_code: Option<u32> = None;
    let mut intentional = false;
    let mut pending: VecDeque<TermCmd> = VecDeque::new();

    'outer: loop {
        let step = tokio::select! {
            msg = channel.wait() => Step::Msg(msg),
            cmd = rx.recv() => Step::Cmd(cmd),
        };
        match step {
            Step::Msg(Some(russh::ChannelMsg::Data { data })) => {
                ctx.events.terminal(TerminalEvent::Data {
                    tab: tab.clone(),
                    bytes: Bytes::copy_from_slice(&data),
                });
            }
            Step::Msg(Some(russh::ChannelMsg::ExtendedData { data, .. })) => {
                ctx.events.terminal(TerminalEvent::Data {
                    tab: tab.clone(),
                    bytes: Bytes::copy_from_slice(&data),
                });
            }
            Step::Msg(Some(russh::ChannelMsg::ExitStatus { exit_status })) => {
                exit_code = Some(exit_status);
            }
            Step::Msg(Some(russh::ChannelMsg::Close)) | Step::Msg(None) => break,
            Step::Msg(Some(_)) => {}
            Step::Cmd(Some(cmd)) => pending.push_back(cmd),
            Step::Cmd(None) => {
                intentional = true;
                break;
            }
        }
        while let Some(cmd) = pending.pop_front() {
            match cmd {
                TermCmd::Write(bytes) => {
                    if channel.data(&bytes[..]).await.is_err() {
                        break 'outer;
                    }
                }
                TermCmd::Resize { cols, rows } => {
                    let _ = channel.window_change(cols, rows, 0, 0).await;
                }
                TermCmd::Close => {
                    intentional = true;
                    let _ = channel.eof().await;
                    break 'outer;
                }
            }
        }
    }

    ctx.events.terminal(TerminalEvent::Exit {
        tab: tab.clone(),
        code: exit_code,
    });
    debug!(tab = %tab, intentional, "shell driver finished");

    if !intentional {
        if let Some(transport) = ctx.pool.get(&key).await {
            if !transport.is_healthy() && !transport.intentional_close() {
                ctx.queue.drain_for_loss(&tab);
                ctx.pool.report_lost(&key).await;
            }
        }
    }
}

/// Telnet pump: strips negotiation, answers it with refusals, detects
/// login/password prompts and submits stored credentials once each.
#[allow(clippy::too_many_arguments)]
async fn telnet_driver(
    ctx: Arc<AppContext>,
    tab: TabId,
    key: String,
    link: Arc<crate::telnet::TelnetLink>,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    mut rx: mpsc::Receiver<TermCmd>,
    username: String,
    password: Option<SecretString>,
) {
    let mut codec = TelnetCodec::new();
    let mut matcher = PromptMatcher::new();
    let mut buf = vec![0u8; 8 * 1024];
    let mut intentional = false;

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let mut clean = Vec::with_capacity(n);
                let mut replies = Vec::new();
                codec.feed(&buf[..n], &mut clean, &mut replies);
                if !replies.is_empty() {
                    let _ = link.write_raw(&replies).await;
                }
                if clean.is_empty() {
                    continue;
                }
                match matcher.observe(&String::from_utf8_lossy(&clean)) {
                    Some(AutoLoginStep::SendUsername) if !username.is_empty() => {
                        let line = format!("{username}\r\n");
                        let _ = link.write(line.as_bytes()).await;
                    }
                    Some(AutoLoginStep::SendPassword) => {
                        if let Some(password) = &password {
                            let line = format!("{}\r\n", password.expose_secret());
                            let _ = link.write(line.as_bytes()).await;
                        }
                    }
                    _ => {}
                }
                ctx.events.terminal(TerminalEvent::Data {
                    tab: tab.clone(),
                    bytes: Bytes::from(clean),
                });
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(TermCmd::Write(bytes)) => {
                        if link.write(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(TermCmd::Resize { .. }) => {
                        // NAWS negotiation is out; geometry is client-side.
                    }
                    Some(TermCmd::Close) | None => {
                        intentional = true;
                        link.close().await;
                        break;
                    }
                }
            }
        }
    }

    link.mark_closed();
    ctx.events.terminal(TerminalEvent::Exit {
        tab: tab.clone(),
        code: None,
    });
    debug!(tab = %tab, intentional, "telnet driver finished");

    if !intentional {
        ctx.queue.drain_for_loss(&tab);
        ctx.pool.report_lost(&key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextOptions;
    use crate::store::MemoryStore;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn manager() -> Arc<SessionManager> {
        let ctx = AppContext::new(ContextOptions::default(), Arc::new(MemoryStore::new()));
        SessionManager::new(ctx)
    }

    #[tokio::test]
    async fn write_and_resize_require_a_connection() {
        let manager = manager().await;
        assert!(matches!(
            manager.write_input("t1", b"ls\n").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            manager.resize("t1", 120, 40).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn sftp_calls_require_an_open_endpoint() {
        let manager = manager().await;
        let bogus = Uuid::new_v4();
        assert!(matches!(
            manager.readdir(bogus, "/", SftpCallOptions::default()).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn telnet_connect_streams_data_and_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Banner, a DO ECHO negotiation, then hold the socket open.
            stream
                .write_all(b"Welcome\r\n\xff\xfd\x01")
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });

        let manager = manager().await;
        let mut terminal = manager.events().subscribe_terminal();
        let mut cfg = ConnectConfig::telnet("127.0.0.1", port);
        cfg.username = "operator".into();

        manager.connect("t1", cfg).await.unwrap();

        // The banner arrives with negotiation stripped.
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), terminal.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TerminalEvent::Data { tab, bytes } => {
                assert_eq!(tab, "t1");
                assert_eq!(&bytes[..], b"Welcome\r\n");
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(manager.write_input("t1", b"ls\r\n").await.is_ok());
        manager.disconnect("t1").await;
        assert_eq!(manager.ctx.pool.len().await, 0, "tab transport retired");
        assert!(matches!(
            manager.write_input("t1", b"x").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn recents_record_successful_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let _s = stream;
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                });
            }
        });

        let manager = manager().await;
        manager
            .connect("t1", ConnectConfig::telnet("127.0.0.1", port))
            .await
            .unwrap();
        let recents = manager.ctx.store.recent_connections().await.unwrap();
        assert_eq!(recents, vec![format!("127.0.0.1:{port}")]);
        manager.disconnect("t1").await;
    }
}
