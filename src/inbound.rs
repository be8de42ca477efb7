//! Inbound mode: dial FreeSWITCH, authenticate, and hand back a ready
//! [`Engine`].

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{self, Engine, Mode};
use crate::error::{Error, Result};
use crate::message::Message;

/// Dial FreeSWITCH at `addr`, wait for its `auth/request` challenge,
/// authenticate with `password`, and return a ready [`Engine`].
///
/// Mirrors the legacy `InboundFactory`/`InboundProtocol` handshake: the
/// very first frame FreeSWITCH sends on an inbound connection is always
/// `Content-Type: auth/request`, answered with `auth <password>`.
pub async fn connect(addr: impl ToSocketAddrs, password: &str) -> Result<Engine> {
    let mut socket = TcpStream::connect(addr).await?;
    let (_, leftover) = await_auth_request(&mut socket).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Engine::new(tx);
    tokio::spawn(engine::run(socket, Mode::Inbound, rx, leftover));

    let reply = engine.send_line(format!("auth {}", password)).await?;
    let reply_text = reply.header("Reply-Text").unwrap_or_default();
    if !reply_text.starts_with("+OK") {
        return Err(Error::auth(reply_text.to_string()));
    }

    debug!("inbound authentication succeeded");
    Ok(engine)
}

/// Read directly off the socket until the `auth/request` header block is
/// seen, before the actor task (and its FIFO correlator) starts. This
/// frame has no associated request, so it cannot be matched through the
/// normal command FIFO.
///
/// Returns the parsed message plus any bytes read past the end of its
/// header block (`auth/request` never carries a body, but a fast peer
/// may have already written its next frame into the same read); these
/// must be fed to the actor's framer rather than dropped.
async fn await_auth_request<IO>(socket: &mut IO) -> Result<(Message, Vec<u8>)>
where
    IO: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        if let Some(pos) = find_double_newline(&buf) {
            let headers = Message::parse_head(&buf[..pos + 2])?
                .expect("header block known complete by find_double_newline")
                .0;
            let message = Message::new(headers, Default::default());
            if message.content_type() != Some("auth/request") {
                return Err(Error::protocol("expected auth/request as first inbound frame"));
            }
            let leftover = buf[pos + 2..].to_vec();
            return Ok((message, leftover));
        }
        let mut chunk = [0u8; 512];
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::connection_lost());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_completes_after_auth_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"Content-Type: auth/request\n\n").await.unwrap();

            let mut buf = vec![0u8; 512];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"auth ClueCon\n\n");

            socket
                .write_all(b"Content-Type: command/reply\nReply-Text: +OK accepted\n\n")
                .await
                .unwrap();
        });

        let engine = connect(addr, "ClueCon").await.unwrap();
        server.await.unwrap();
        drop(engine);
    }

    #[tokio::test]
    async fn rejected_auth_fails_with_auth_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"Content-Type: auth/request\n\n").await.unwrap();
            let mut buf = vec![0u8; 512];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"Content-Type: command/reply\nReply-Text: -ERR invalid\n\n")
                .await
                .unwrap();
        });

        let err = connect(addr, "wrong").await.unwrap_err();
        assert!(!err.is_connection_lost());
    }

    #[tokio::test]
    async fn await_auth_request_rejects_unexpected_first_frame() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            server.write_all(b"Content-Type: command/reply\n\n").await.unwrap();
        });
        let err = await_auth_request(&mut client).await.unwrap_err();
        assert!(!err.is_connection_lost());
    }
}
