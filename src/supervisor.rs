//! Top-level process lifecycle: daemonize, chroot/drop privileges, build
//! every proxy from the loaded configuration, install signal handlers,
//! start them, and wait for a shutdown signal.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::logging::LogSink;
use crate::proxy::{PreparedProxy, Proxy};

/// Double-fork daemonize: fork, `setsid`, fork again so the process can
/// never reacquire a controlling terminal, `chdir("/")`, write the PID
/// file from the final child, and close stdin/stderr.
///
/// stdout is deliberately left open here — matching `main.c`'s ordering,
/// which only closes it once the real logfile has successfully opened, so
/// a startup failure between this call and that point (a listener that
/// won't bind, a cert that won't parse, chroot/seteuid failing) still has
/// somewhere to report to. Call [`close_stdout`] once the logfile is open.
///
/// Must run before any Tokio runtime exists: forking a live
/// multi-threaded runtime only duplicates the calling thread, leaving the
/// child with a runtime whose other worker threads never came along.
pub fn daemonize(pidfile: Option<&Path>) -> Result<()> {
    use nix::unistd::{ForkResult, chdir, fork, setsid};

    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;

    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    chdir("/").context("chdir('/') failed")?;

    if let Some(path) = pidfile {
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write pidfile '{}'", path.display()))?;
    }

    redirect_to_devnull(&[0, 2])?;
    Ok(())
}

/// Close stdout to `/dev/null`. Called once the logfile has successfully
/// opened, mirroring `main.c`'s `if (daemonize) close(1);` placement after
/// its own logfile-reopen call.
pub fn close_stdout() -> Result<()> {
    redirect_to_devnull(&[1])
}

fn redirect_to_devnull(fds: &[i32]) -> Result<()> {
    use nix::fcntl::{OFlag, open};
    use nix::sys::stat::Mode;
    use nix::unistd::{close, dup2};

    let devnull = open("/dev/null", OFlag::O_RDWR, Mode::empty()).context("failed to open /dev/null")?;
    for &fd in fds {
        dup2(devnull, fd).context("failed to redirect stdio to /dev/null")?;
    }
    if !fds.contains(&devnull) {
        let _ = close(devnull);
    }
    Ok(())
}

/// `chroot` into `dir` (if configured), then drop effective privileges to
/// `user` (a name or a bare numeric uid). Order matters: the name lookup
/// must happen before `chroot` makes `/etc/passwd` unreachable unless the
/// chroot jail carries its own copy.
pub fn apply_chroot_and_user(chroot_dir: Option<&Path>, user: Option<&str>) -> Result<()> {
    use nix::unistd::{Uid, User, chdir, chroot, seteuid};

    let uid = user
        .map(|u| resolve_uid(u))
        .transpose()
        .context("failed to resolve 'user'")?;

    if let Some(dir) = chroot_dir {
        chdir(dir).with_context(|| format!("chdir('{}') failed", dir.display()))?;
        chroot(dir).with_context(|| format!("chroot('{}') failed", dir.display()))?;
        chdir("/").context("chdir('/') after chroot failed")?;
    }

    if let Some(uid) = uid {
        seteuid(uid).with_context(|| format!("seteuid({uid}) failed"))?;
    }

    fn resolve_uid(user: &str) -> Result<Uid> {
        if let Ok(numeric) = user.parse::<u32>() {
            return Ok(Uid::from_raw(numeric));
        }
        User::from_name(user)
            .with_context(|| format!("failed to look up user '{user}'"))?
            .map(|u| u.uid)
            .ok_or_else(|| anyhow!("unknown user '{user}'"))
    }

    Ok(())
}

/// Activate every already-bound proxy (registering its socket with the
/// Tokio reactor), start them all, and block until a shutdown signal
/// arrives, then stop them all. The sockets themselves were bound earlier,
/// by [`crate::proxy::Proxy::prepare`], before any chroot/privilege drop.
pub async fn run(prepared: Vec<PreparedProxy>, log_sink: LogSink) -> Result<()> {
    let mut proxies = Vec::with_capacity(prepared.len());
    for p in prepared {
        let proxy = Proxy::activate(p).context("failed to activate proxy listener")?;
        proxies.push(proxy);
    }

    for proxy in &proxies {
        proxy.start().await;
    }
    tracing::info!(proxies = proxies.len(), "all proxies started");

    wait_for_shutdown(&log_sink).await;

    for proxy in proxies {
        proxy.shutdown().await;
    }
    tracing::info!("all proxies stopped");

    Ok(())
}

/// `SIGTERM` stops the process. `SIGHUP` reopens the logfile in place.
/// `SIGALRM`/`SIGUSR1`/`SIGUSR2` are reserved: observed, never acted on.
async fn wait_for_shutdown(log_sink: &LogSink) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut hup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut alarm = signal(SignalKind::alarm()).expect("failed to install SIGALRM handler");
    let mut usr1 = signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
    let mut usr2 = signal(SignalKind::user_defined2()).expect("failed to install SIGUSR2 handler");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested (ctrl-c)");
                return;
            }
            _ = term.recv() => {
                tracing::info!("SIGTERM received, shutting down");
                return;
            }
            _ = hup.recv() => {
                tracing::info!("SIGHUP received, reopening logfile");
                if let Err(e) = log_sink.reopen() {
                    tracing::warn!(error = ?e, "failed to reopen logfile");
                }
            }
            _ = alarm.recv() => {
                tracing::debug!("SIGALRM received (reserved, no-op)");
            }
            _ = usr1.recv() => {
                tracing::debug!("SIGUSR1 received (reserved, no-op)");
            }
            _ = usr2.recv() => {
                tracing::debug!("SIGUSR2 received (reserved, no-op)");
            }
        }
    }
}
