//! X11 forwarding bridge.
//!
//! The SSH server opens an `x11` channel per client window; each one is
//! bridged to the local X server's TCP endpoint (6000 + display). Bridges
//! live and die with the transport: on loss the acceptor task is dropped and
//! a replacement transport re-requests forwarding on its new shell channel.

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::X11Incoming;

/// Hex cookie sent with the x11-req; the real authentication is the X
/// server's, this only has to be well-formed.
pub fn fake_cookie() -> String {
    hex::encode(uuid::Uuid::new_v4().as_bytes())
}

/// Accept server-opened X11 channels and bridge each to the X server.
/// Returns the acceptor task; aborting it tears down future accepts while
/// in-flight bridges drain on their own.
pub fn spawn_acceptor(
    mut rx: mpsc::UnboundedReceiver<X11Incoming>,
    display: u16,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(incoming) = rx.recv().await {
            tokio::spawn(bridge_one(incoming, display));
        }
    })
}

async fn bridge_one(incoming: X11Incoming, display: u16) {
    let port = 6000 + display;
    let originator = incoming.originator;
    let tcp = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(tcp) => tcp,
        Err(err) => {
            warn!(port, originator = %originator, "x11 bridge dial failed: {err}");
            return;
        }
    };
    debug!(port, originator = %originator, "x11 channel bridged");
    let mut channel_stream = incoming.channel.into_stream();
    let mut tcp = tcp;
    match tokio::io::copy_bidirectional(&mut channel_stream, &mut tcp).await {
        Ok((to_x, from_x)) => {
            debug!(to_x, from_x, originator = %originator, "x11 bridge finished");
        }
        Err(err) => {
            debug!(originator = %originator, "x11 bridge ended: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_is_32_hex_chars() {
        let cookie = fake_cookie();
        assert_eq!(cookie.len(), 32);
        assert!(cookie.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
