//! Proxy listener: owns a listening socket, TLS server context, upstream
//! address, the ACL subset permitted to use this listener, and its own
//! worker.
//!
//! Binding happens in two phases, mirroring the original daemon's ordering
//! in `main.c` (`proxy_create` — which binds the listening socket and loads
//! TLS certificate files — runs before the chroot/`seteuid` block further
//! down `main`): [`Proxy::prepare`] is a plain synchronous call made before
//! any chroot or privilege drop, so a `listen` address on a privileged port
//! and `cert`/`key` paths outside a chroot jail both still work; it hands
//! back a [`PreparedProxy`] holding a `std::net::TcpListener` already bound
//! and listening. [`Proxy::activate`] — called once a Tokio runtime exists,
//! after chroot/`seteuid` — merely registers that socket with the reactor
//! and spawns the worker task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::acl::AclEntry;
use crate::config::ProxyConfig;
use crate::resp;
use crate::session;
use crate::tls;
use crate::worker::{Worker, WorkerState};

/// Everything a spawned session needs, precomputed once at construction
/// and never mutated afterward — no locking is required anywhere in this
/// struct for the lifetime of the proxy.
pub struct Shared {
    pub upstream_addr: SocketAddr,
    pub upstream_timeout: Duration,
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
    /// Precomputed `AUTH <password>` RESP array sent upstream before any
    /// client traffic, if `redis_auth` is configured.
    pub auth_cmd: Option<Bytes>,
    /// The synthetic `["NOT AUTHORIZED"]` command sent upstream in place
    /// of every blocked client frame.
    pub fail_cmd: Bytes,
    /// `+OK\r\n`, sent to the client on a successful in-band `AUTH`.
    pub client_ok: Bytes,
    /// `-ERR invalid password\r\n`, sent on a failed in-band `AUTH`.
    pub client_autherr: Bytes,
    /// The subset of the global ACL list this listener accepts, in
    /// declared order.
    pub acls: Vec<AclEntry>,
}

/// The synchronous half of building a proxy: a bound-and-listening std
/// socket plus everything [`Shared`] needs, computed with full filesystem
/// and privileged-port access, before any chroot/`seteuid`.
pub struct PreparedProxy {
    listen_addr: SocketAddr,
    std_listener: std::net::TcpListener,
    shared: Arc<Shared>,
}

pub struct Proxy {
    listen_addr: SocketAddr,
    listener: Arc<TcpListener>,
    stop: Arc<Notify>,
    worker: Worker,
}

impl Proxy {
    /// Resolve a config group into a bound listening socket and its
    /// precomputed ACL/TLS/canned-RESP state. Plain sync I/O only — no
    /// Tokio runtime required, so this can run before one is built, the
    /// same place the original's `proxy_create` runs before its daemon
    /// drops privileges.
    pub fn prepare(cfg: &ProxyConfig, global_acls: &[AclEntry]) -> Result<PreparedProxy> {
        let tls_config = tls::build_server_config(cfg)?.map(Arc::new);

        let acls: Vec<AclEntry> = global_acls
            .iter()
            .filter(|a| cfg.acl_ids.iter().any(|id| id == &a.id))
            .cloned()
            .collect();

        let auth_cmd = cfg
            .redis_auth
            .as_deref()
            .map(|pw| resp::command(&[b"AUTH", pw.as_bytes()]));

        let shared = Arc::new(Shared {
            upstream_addr: cfg.redis,
            upstream_timeout: cfg.redis_timeout,
            tls_config,
            auth_cmd,
            fail_cmd: resp::command(&[b"NOT AUTHORIZED"]),
            client_ok: resp::simple("OK"),
            client_autherr: resp::error("ERR invalid password"),
            acls,
        });

        let std_listener = bind_reuseaddr(cfg.listen)
            .with_context(|| format!("failed to bind listener on '{}'", cfg.listen))?;

        Ok(PreparedProxy {
            listen_addr: cfg.listen,
            std_listener,
            shared,
        })
    }

    /// Register a [`PreparedProxy`]'s socket with the Tokio reactor and
    /// spawn its worker task. Requires a running runtime; called after any
    /// chroot/`seteuid` has already happened.
    pub fn activate(prepared: PreparedProxy) -> Result<Self> {
        let PreparedProxy {
            listen_addr,
            std_listener,
            shared,
        } = prepared;

        let listener = TcpListener::from_std(std_listener)
            .with_context(|| format!("failed to register listener '{listen_addr}' with the async runtime"))?;
        let listener = Arc::new(listener);

        let stop = Arc::new(Notify::new());
        let worker_listener = listener.clone();
        let worker_shared = shared.clone();
        let worker_stop = stop.clone();

        let worker = Worker::spawn(format!("proxy:{listen_addr}"), move || {
            let listener = worker_listener.clone();
            let shared = worker_shared.clone();
            let stop = worker_stop.clone();
            async move { accept_loop(listener, shared, stop).await }
        });

        Ok(Proxy {
            listen_addr,
            listener,
            stop,
            worker,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Put the worker into `Run`: the accept loop starts handing off
    /// connections to [`session::run`].
    pub async fn start(&self) {
        tracing::info!(listen = %self.listen_addr, "proxy starting");
        self.worker.instruct_and_wait(WorkerState::Run).await;
    }

    /// Break the accept loop and put the worker back to `Sleep`. The
    /// listening socket stays bound; `start` can be called again.
    pub async fn stop(&self) {
        tracing::info!(listen = %self.listen_addr, "proxy stopping");
        self.stop.notify_waiters();
        self.worker.instruct_and_wait(WorkerState::Sleep).await;
    }

    /// Stop, then tear down the worker task for good.
    pub async fn shutdown(mut self) {
        self.stop.notify_waiters();
        self.worker.instruct_and_wait(WorkerState::Exit).await;
        self.worker.join().await;
        drop(self.listener);
    }
}

/// Bind and listen with `SO_REUSEADDR` set, matching the original's
/// `LEV_OPT_REUSEABLE` listener flag, and leave the socket non-blocking so
/// it can later be handed to [`TcpListener::from_std`].
fn bind_reuseaddr(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).context("failed to create socket")?;
    socket.set_reuse_address(true).context("failed to set SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("failed to set socket non-blocking")?;
    socket.bind(&addr.into()).with_context(|| format!("failed to bind '{addr}'"))?;
    socket.listen(1024).context("failed to listen")?;
    Ok(socket.into())
}

async fn accept_loop(listener: Arc<TcpListener>, shared: Arc<Shared>, stop: Arc<Notify>) {
    loop {
        tokio::select! {
            biased;
            _ = stop.notified() => {
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, remote)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            session::run(socket, remote, shared).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, "accept failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

    use super::*;
    use crate::resp;

    /// A fake Redis that replies `+OK\r\n` to anything it's sent.
    async fn fake_upstream() -> SocketAddr {
        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        if sock.write_all(b"+OK\r\n").await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        addr
    }

    fn proxy_config(listen: SocketAddr, redis: SocketAddr) -> ProxyConfig {
        ProxyConfig {
            listen,
            redis,
            redis_timeout: Duration::from_secs(1),
            redis_auth: None,
            cert: None,
            key: None,
            ca: None,
            acl_ids: vec![],
        }
    }

    #[tokio::test]
    async fn prepare_binds_before_any_runtime_dependent_step_and_activate_completes_it() {
        let redis = fake_upstream().await;
        // Port 0 lets the OS pick a free ephemeral port synchronously, the
        // same thing a privileged `listen` port would need before chroot.
        let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let cfg = proxy_config(listen, redis);

        let prepared = Proxy::prepare(&cfg, &[]).expect("prepare is plain sync I/O");
        let bound_addr = prepared.listen_addr;

        let proxy = Proxy::activate(prepared).expect("activate registers the bound socket");
        assert_eq!(proxy.listen_addr(), bound_addr);

        proxy.start().await;

        let mut client = TcpStream::connect(bound_addr).await.unwrap();
        client.write_all(&resp::command(&[b"PING"])).await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"+OK\r\n");

        proxy.stop().await;
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn stop_breaks_the_accept_loop_without_dropping_the_socket() {
        let redis = fake_upstream().await;
        let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let cfg = proxy_config(listen, redis);

        let prepared = Proxy::prepare(&cfg, &[]).unwrap();
        let proxy = Proxy::activate(prepared).unwrap();
        proxy.start().await;
        proxy.stop().await;

        assert_eq!(proxy.worker.state(), WorkerState::Sleep);
        proxy.shutdown().await;
    }
}
