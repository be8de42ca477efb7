//! Outbound mode: listen for FreeSWITCH-initiated connections, issue
//! `connect`, and hand back the decoded channel info.

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::engine::{self, Engine, Mode};
use crate::error::{Error, Result};
use crate::message::Message;

/// Listens for FreeSWITCH outbound-mode connections.
///
/// Mirrors the legacy `OutboundFactory`: each accepted socket gets its
/// own `Engine`/actor, immediately sends `connect`, and the first frame
/// FreeSWITCH replies with (full call channel variables, URL-encoded) is
/// delivered as channel info rather than routed as a `command/reply`.
pub struct Listener {
    inner: TcpListener,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.inner.local_addr().ok())
            .finish()
    }
}

impl Listener {
    /// Bind a listener on `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Listener> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Listener { inner })
    }

    /// Accept one connection, perform the `connect` handshake, and
    /// return a ready `Engine` plus the decoded channel-info message.
    pub async fn accept(&self) -> Result<(Engine, Message)> {
        let (socket, peer) = self.inner.accept().await?;
        debug!(%peer, "accepted outbound connection");

        let (channel_info_tx, channel_info_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(tx);
        let mode = Mode::Outbound { channel_info: Some(channel_info_tx) };
        tokio::spawn(engine::run(socket, mode, rx, Vec::new()));

        engine.send_connect()?;
        let channel_info = channel_info_rx.await.map_err(|_| Error::connection_lost())?;

        Ok((engine, channel_info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accept_performs_connect_handshake_and_decodes_channel_info() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.inner.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut socket = TcpStream::connect(addr).await.unwrap();

            let mut buf = vec![0u8; 512];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"connect\n\n");

            socket
                .write_all(b"Channel-State: CS_NEW\nCaller-Caller-ID-Name: conf%3Aroom1\n\n")
                .await
                .unwrap();
        });

        let (engine, channel_info) = listener.accept().await.unwrap();
        client.await.unwrap();

        assert_eq!(channel_info.header("Channel-State"), Some("CS_NEW"));
        assert_eq!(channel_info.header("Caller-Caller-ID-Name"), Some("conf:room1"));
        drop(engine);
    }
}
