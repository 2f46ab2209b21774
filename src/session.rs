//! Per-connection state machine: upstream connect, optional upstream
//! `AUTH`, client TLS handshake and CN binding, in-band client `AUTH`
//! interception, per-frame ACL gating, and half-duplex relay — all of it
//! preserving pipelined frame order by substituting blocked client frames
//! 1-for-1 with a synthetic upstream command.
//!
//! `SERVER_CONNECT -> SERVER_AUTH? -> CLIENT_CHECK <-> {CLIENT_PASS,
//! CLIENT_BLOCK, CLIENT_AUTH}`. There is no explicit terminal state: the
//! session just returns, which drops every handle it owns.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, WriteHalf};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::acl::{self, AclEntry, Gate};
use crate::proxy::Shared;
use crate::resp::{ParseOutcome, RespBuffer};
use crate::tls;

const READ_CHUNK: usize = 16 * 1024;

/// Session-fatal conditions, matching spec.md §4.4's transition table:
/// every variant carries its own client-facing message (or none at all,
/// for conditions a client can't meaningfully act on).
#[derive(Debug)]
enum SessionError {
    UpstreamTimeout,
    UpstreamConnect,
    UpstreamEof,
    UpstreamError,
    UpstreamAuthMismatch,
    ClientEof,
    ClientError,
    ParseError,
    WriteError,
}

impl SessionError {
    /// `None` means drop silently: the client is the one who's gone, or
    /// the frame they sent made no sense to begin with.
    fn client_message(&self) -> Option<&'static str> {
        match self {
            SessionError::UpstreamTimeout => Some("timeout connecting to a server"),
            SessionError::UpstreamConnect => Some("could not connect to a server"),
            SessionError::UpstreamEof => Some("server has closed connection"),
            SessionError::UpstreamError => Some("got error from a server"),
            SessionError::UpstreamAuthMismatch => Some("unexpected auth response from a server"),
            SessionError::ClientEof | SessionError::ClientError | SessionError::ParseError | SessionError::WriteError => None,
        }
    }
}

/// A client connection, plain or TLS. Implements `AsyncRead`/`AsyncWrite`
/// purely by delegation so it can go through `tokio::io::split` — the
/// relay loop needs independently ownable read and write halves, and
/// `TlsStream` doesn't offer an owned split the way `TcpStream` does.
enum ClientConn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientConn {
    /// The peer certificate's `commonName`, if this connection is TLS and
    /// a client certificate was presented and verified.
    fn peer_common_name(&self) -> Option<String> {
        let ClientConn::Tls(s) = self else {
            return None;
        };
        let certs = s.get_ref().1.peer_certificates()?;
        tls::peer_common_name(certs.first()?)
    }
}

impl AsyncRead for ClientConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientConn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientConn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientConn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientConn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientConn::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientConn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientConn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientConn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

pub async fn run(client_sock: TcpStream, remote: SocketAddr, shared: Arc<Shared>) {
    let _ = client_sock.set_nodelay(true);

    let upstream = match connect_upstream(&shared, remote).await {
        Ok(s) => s,
        Err(e) => {
            report_preauth_error(&client_sock, e, remote).await;
            return;
        }
    };
    let (mut upstream_r, mut upstream_w) = upstream.into_split();

    if let Some(auth_cmd) = &shared.auth_cmd
        && let Err(e) = perform_upstream_auth(&mut upstream_r, &mut upstream_w, auth_cmd).await
    {
        report_preauth_error(&client_sock, e, remote).await;
        return;
    }

    let client = match accept_client_tls(client_sock, &shared, remote).await {
        Some(c) => c,
        None => return,
    };

    let mut bound_acl: Option<AclEntry> = acl::match_net(&shared.acls, &remote.ip()).cloned();
    if let Some(cn) = client.peer_common_name()
        && let Some(matched) = acl::match_cert(&shared.acls, &cn)
    {
        bound_acl = Some(matched.clone());
    }

    let (mut client_r, mut client_w) = tokio::io::split(client);

    let mut parser = RespBuffer::new();
    let mut client_buf = [0u8; READ_CHUNK];
    let mut upstream_buf = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            result = client_r.read(&mut client_buf) => {
                let n = match result {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                parser.feed(&client_buf[..n]);

                loop {
                    match parser.parse() {
                        ParseOutcome::NeedMore => break,
                        ParseOutcome::Malformed => return,
                        ParseOutcome::Complete => {
                            if !handle_client_frame(&mut client_w, &mut upstream_w, &mut parser, &mut bound_acl, &shared).await {
                                return;
                            }
                        }
                    }
                }
            }
            result = upstream_r.read(&mut upstream_buf) => {
                match result {
                    Ok(0) => {
                        let _ = client_w.write_all(&crate::resp::error("server has closed connection")).await;
                        return;
                    }
                    Ok(n) => {
                        if client_w.write_all(&upstream_buf[..n]).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = client_w.write_all(&crate::resp::error("got error from a server")).await;
                        return;
                    }
                }
            }
        }
    }
}

/// `SERVER_CONNECT`: dial upstream with the configured timeout.
async fn connect_upstream(shared: &Shared, remote: SocketAddr) -> Result<TcpStream, SessionError> {
    match timeout(shared.upstream_timeout, TcpStream::connect(shared.upstream_addr)).await {
        Ok(Ok(s)) => {
            let _ = s.set_nodelay(true);
            Ok(s)
        }
        Ok(Err(e)) => {
            tracing::debug!(client = %remote, error = ?e, "upstream connect failed");
            Err(SessionError::UpstreamConnect)
        }
        Err(_) => {
            tracing::debug!(client = %remote, "upstream connect timed out");
            Err(SessionError::UpstreamTimeout)
        }
    }
}

/// `SERVER_AUTH`: send the cached upstream `AUTH` frame and demand
/// exactly 5 bytes back, byte-compared against `+OK\r\n`.
async fn perform_upstream_auth(
    upstream_r: &mut OwnedReadHalf,
    upstream_w: &mut OwnedWriteHalf,
    auth_cmd: &[u8],
) -> Result<(), SessionError> {
    upstream_w.write_all(auth_cmd).await.map_err(|_| SessionError::UpstreamError)?;

    let mut reply = [0u8; 5];
    upstream_r
        .read_exact(&mut reply)
        .await
        .map_err(|_| SessionError::UpstreamEof)?;

    if &reply != b"+OK\r\n" {
        return Err(SessionError::UpstreamAuthMismatch);
    }

    Ok(())
}

/// Writes a `SessionError`'s client-facing message (if any) over the raw
/// socket. Used only before any client TLS handshake has happened — the
/// connection is about to be dropped either way, so this is best-effort.
async fn report_preauth_error(mut client_sock: &TcpStream, err: SessionError, remote: SocketAddr) {
    tracing::debug!(client = %remote, error = ?err, "session dropped before client handshake");
    if let Some(msg) = err.client_message() {
        let _ = client_sock.write_all(&crate::resp::error(msg)).await;
    }
}

async fn accept_client_tls(client_sock: TcpStream, shared: &Shared, remote: SocketAddr) -> Option<ClientConn> {
    match &shared.tls_config {
        Some(cfg) => {
            let acceptor = TlsAcceptor::from(cfg.clone());
            match acceptor.accept(client_sock).await {
                Ok(s) => Some(ClientConn::Tls(Box::new(s))),
                Err(e) => {
                    tracing::debug!(client = %remote, error = ?e, "client TLS handshake failed");
                    None
                }
            }
        }
        None => Some(ClientConn::Plain(client_sock)),
    }
}

/// `CLIENT_CHECK` plus whichever of `{CLIENT_PASS, CLIENT_BLOCK,
/// CLIENT_AUTH}` a frame routes to. Returns `false` if the session must
/// drop (a write failed).
async fn handle_client_frame(
    client_w: &mut WriteHalf<ClientConn>,
    upstream_w: &mut OwnedWriteHalf,
    parser: &mut RespBuffer,
    bound_acl: &mut Option<AclEntry>,
    shared: &Shared,
) -> bool {
    let cmd = parser.command_name().unwrap_or(&[]).to_vec();
    let total_parts = parser.total_parts();
    let parsed = parser.parsed();

    // Preserved verbatim per the design note on AUTH detection: a
    // prefix-bounded, case-insensitive match against "auth" also catches
    // a command like "authx".
    let looks_like_auth = acl::prefix_match_ci(&cmd, b"auth");

    if looks_like_auth && total_parts == 2 {
        // CLIENT_AUTH: bypasses gating entirely.
        let password = parser.last_value().unwrap_or_default();
        parser.drain(parsed);

        let password = String::from_utf8_lossy(&password);
        match acl::match_auth(&shared.acls, &password) {
            Some(matched) => {
                *bound_acl = Some(matched.clone());
                client_w.write_all(&shared.client_ok).await.is_ok()
            }
            None => {
                *bound_acl = None;
                client_w.write_all(&shared.client_autherr).await.is_ok()
            }
        }
    } else if looks_like_auth {
        // Wrong argument count: forward as-is and let upstream reject it.
        let frame = parser.drain(parsed);
        upstream_w.write_all(&frame).await.is_ok()
    } else {
        match acl::gate_command(bound_acl.as_ref(), &cmd) {
            Gate::Allow => {
                let frame = parser.drain(parsed);
                upstream_w.write_all(&frame).await.is_ok()
            }
            Gate::Block => {
                parser.drain(parsed);
                upstream_w.write_all(&shared.fail_cmd).await.is_ok()
            }
        }
    }
}
