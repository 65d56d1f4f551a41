//! Telnet transport: plain TCP with just enough IAC handling to keep the
//! byte stream clean, plus login/password prompt detection for stored
//! credentials.
//!
//! Negotiation is refused wholesale (DO → WONT, WILL → DONT); subnegotiation
//! blocks are skipped. That leaves the remote in classic NVT mode, which is
//! what the terminal surface renders.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodecState {
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Incremental IAC parser. `feed` separates clean terminal bytes from
/// negotiation, appending refusal replies that should be written back.
#[derive(Debug)]
pub struct TelnetCodec {
    state: CodecState,
}

impl TelnetCodec {
    pub fn new() -> Self {
        Self {
            state: CodecState::Data,
        }
    }

    pub fn feed(&mut self, input: &[u8], clean: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &byte in input {
            self.state = match self.state {
                CodecState::Data => {
                    if byte == IAC {
                        CodecState::Iac
                    } else {
                        clean.push(byte);
                        CodecState::Data
                    }
                }
                CodecState::Iac => match byte {
                    IAC => {
                        clean.push(IAC);
                        CodecState::Data
                    }
                    DO | WILL | DONT | WONT => CodecState::Negotiate(byte),
                    SB => CodecState::Sub,
                    _ => CodecState::Data,
                },
                CodecState::Negotiate(verb) => {
                    match verb {
                        DO => replies.extend_from_slice(&[IAC, WONT, byte]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, byte]),
                        _ => {}
                    }
                    CodecState::Data
                }
                CodecState::Sub => {
                    if byte == IAC {
                        CodecState::SubIac
                    } else {
                        CodecState::Sub
                    }
                }
                CodecState::SubIac => {
                    if byte == SE {
                        CodecState::Data
                    } else {
                        CodecState::Sub
                    }
                }
            };
        }
    }
}

impl Default for TelnetCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Escape literal 0xFF bytes in outbound data.
pub fn escape_output(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if b == IAC {
            out.push(IAC);
        }
        out.push(b);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoLoginStep {
    SendUsername,
    SendPassword,
}

/// Watches the inbound text for login/password prompts and tells the driver
/// to submit stored credentials, once each.
pub struct PromptMatcher {
    login: Regex,
    password: Regex,
    sent_username: bool,
    sent_password: bool,
}

impl PromptMatcher {
    pub fn new() -> Self {
        Self {
            login: Regex::new(r"(?i)login:|用户名:").expect("static regex"),
            password: Regex::new(r"(?i)password:|密码:").expect("static regex"),
            sent_username: false,
            sent_password: false,
        }
    }

    pub fn observe(&mut self, text: &str) -> Option<AutoLoginStep> {
        if !self.sent_password && self.password.is_match(text) {
            self.sent_password = true;
            return Some(AutoLoginStep::SendPassword);
        }
        if !self.sent_username && self.login.is_match(text) {
            self.sent_username = true;
            return Some(AutoLoginStep::SendUsername);
        }
        None
    }
}

impl Default for PromptMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A live Telnet connection. The read half is taken once by the tab's driver
/// task; writes are serialized through a mutex so the transport keeps a
/// single writer lane.
pub struct TelnetLink {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: parking_lot::Mutex<Option<OwnedReadHalf>>,
    connected: AtomicBool,
    peer: String,
}

impl TelnetLink {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TelnetLink> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout(crate::error::TimeoutKind::Connect))?
            .map_err(Error::from)?;
        stream.set_nodelay(true).ok();
        let peer = format!("{host}:{port}");
        debug!(peer = %peer, "telnet connected");
        let (read, write) = stream.into_split();
        Ok(TelnetLink {
            writer: tokio::sync::Mutex::new(Some(write)),
            reader: parking_lot::Mutex::new(Some(read)),
            connected: AtomicBool::new(true),
            peer,
        })
    }

    /// A link that is already closed; lets bookkeeping be tested without a
    /// socket.
    #[cfg(test)]
    pub(crate) fn closed_for_tests() -> TelnetLink {
        TelnetLink {
            writer: tokio::sync::Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
            connected: AtomicBool::new(false),
            peer: "test:0".to_string(),
        }
    }

    /// Hand the read half to the tab driver. Returns `None` after the first
    /// call.
    pub fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader.lock().take()
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let escaped = escape_output(data);
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };
        writer.write_all(&escaped).await.map_err(|err| {
            self.mark_closed();
            Error::from(err)
        })
    }

    /// Write pre-framed bytes (negotiation replies) without IAC escaping.
    pub async fn write_raw(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };
        writer.write_all(data).await.map_err(|err| {
            self.mark_closed();
            Error::from(err)
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn mark_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub async fn close(&self) {
        self.mark_closed();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!(peer = %self.peer, "telnet closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_codec(input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut codec = TelnetCodec::new();
        let mut clean = Vec::new();
        let mut replies = Vec::new();
        codec.feed(input, &mut clean, &mut replies);
        (clean, replies)
    }

    #[test]
    fn plain_bytes_pass_through() {
        let (clean, replies) = run_codec(b"hello\r\n");
        assert_eq!(clean, b"hello\r\n");
        assert!(replies.is_empty());
    }

    #[test]
    fn negotiation_is_refused() {
        // IAC DO ECHO(1), IAC WILL SGA(3)
        let (clean, replies) = run_codec(&[IAC, DO, 1, b'x', IAC, WILL, 3]);
        assert_eq!(clean, b"x");
        assert_eq!(replies, vec![IAC, WONT, 1, IAC, DONT, 3]);
    }

    #[test]
    fn escaped_iac_is_literal() {
        let (clean, replies) = run_codec(&[b'a', IAC, IAC, b'b']);
        assert_eq!(clean, vec![b'a', IAC, b'b']);
        assert!(replies.is_empty());
    }

    #[test]
    fn subnegotiation_is_skipped() {
        let (clean, _) = run_codec(&[b'a', IAC, SB, 31, 0, 80, 0, 24, IAC, SE, b'b']);
        assert_eq!(clean, b"ab");
    }

    #[test]
    fn codec_handles_split_sequences() {
        let mut codec = TelnetCodec::new();
        let mut clean = Vec::new();
        let mut replies = Vec::new();
        codec.feed(&[IAC], &mut clean, &mut replies);
        codec.feed(&[DO], &mut clean, &mut replies);
        codec.feed(&[1, b'z'], &mut clean, &mut replies);
        assert_eq!(clean, b"z");
        assert_eq!(replies, vec![IAC, WONT, 1]);
    }

    #[test]
    fn output_escaping_doubles_iac() {
        assert_eq!(escape_output(&[1, IAC, 2]), vec![1, IAC, IAC, 2]);
    }

    #[test]
    fn prompts_match_english_and_chinese() {
        let mut m = PromptMatcher::new();
        assert_eq!(m.observe("Ubuntu 22.04 LTS\nlogin: "), Some(AutoLoginStep::SendUsername));
        assert_eq!(m.observe("Password: "), Some(AutoLoginStep::SendPassword));

        let mut m = PromptMatcher::new();
        assert_eq!(m.observe("用户名: "), Some(AutoLoginStep::SendUsername));
        assert_eq!(m.observe("密码: "), Some(AutoLoginStep::SendPassword));
    }

    #[test]
    fn prompts_fire_once_each() {
        let mut m = PromptMatcher::new();
        assert!(m.observe("Login: ").is_some());
        assert!(m.observe("login: ").is_none());
        assert!(m.observe("PASSWORD: ").is_some());
        assert!(m.observe("password: ").is_none());
    }

    #[test]
    fn unrelated_output_matches_nothing() {
        let mut m = PromptMatcher::new();
        assert!(m.observe("total 12\ndrwxr-xr-x 2 root root").is_none());
        assert!(m.observe("$ ").is_none());
    }
}
