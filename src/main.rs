mod acl;
mod config;
mod logging;
mod proxy;
mod resp;
mod session;
mod supervisor;
mod tls;
mod worker;

use std::process::ExitCode;

use clap::Parser;

use config::{Cli, Config};
use logging::LogSink;

/// Plain synchronous entry point: daemonizing forks the process, and
/// forking after a multi-threaded Tokio runtime has started its worker
/// threads only ever carries the calling thread into the child, leaving
/// the rest of the runtime behind. Everything that must happen
/// pre-fork — argument parsing, config validation, daemonizing,
/// chroot/privilege drop — runs here before a runtime is ever built.
fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("redis-aclproxy: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // A forked `-t` run would background a process that only ever prints
    // one line and exits; the original skips the fork entirely when
    // testing, and otherwise only when `-f/--foreground` asked for it.
    let daemonizing = !cli.foreground && !cli.test;
    if daemonizing {
        if let Err(e) = supervisor::daemonize(cfg.pidfile.as_deref()) {
            eprintln!("redis-aclproxy: failed to daemonize: {e:#}");
            return ExitCode::FAILURE;
        }
    }

    // Bind every listening socket and load every TLS cert/key/ca file now,
    // with full filesystem access and before any privilege drop — a
    // `listen` on a privileged port, or `cert`/`key` paths that won't
    // resolve once `chroot` takes effect, both depend on this happening
    // here rather than after the block below.
    let proxies = match cfg
        .proxy
        .iter()
        .map(|p| proxy::Proxy::prepare(p, &cfg.acl))
        .collect::<anyhow::Result<Vec<_>>>()
    {
        Ok(proxies) => proxies,
        Err(e) => {
            eprintln!("redis-aclproxy: failed to prepare proxies: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if cfg.chroot.is_some() || cfg.user.is_some() {
        if let Err(e) = supervisor::apply_chroot_and_user(cfg.chroot.as_deref(), cfg.user.as_deref()) {
            eprintln!("redis-aclproxy: failed to apply chroot/user: {e:#}");
            return ExitCode::FAILURE;
        }
    }

    // `-t` is a real dry run: it only declares success once every listener
    // has actually bound, every TLS file has actually loaded, and
    // chroot/user have actually resolved — not merely once the config file
    // parsed.
    if cli.test {
        println!("configuration OK");
        return ExitCode::SUCCESS;
    }

    let log_sink = match LogSink::open(cfg.logfile.clone()) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("redis-aclproxy: failed to open logfile: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if daemonizing {
        if let Err(e) = supervisor::close_stdout() {
            eprintln!("redis-aclproxy: failed to close stdout: {e:#}");
            return ExitCode::FAILURE;
        }
    }

    let mask = logging::resolve_logmask(cfg.logmask.as_deref());
    tracing_subscriber::fmt()
        .with_env_filter(logging::build_env_filter(&mask))
        .with_writer(log_sink.clone())
        .with_ansi(false)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("redis-aclproxy: failed to start async runtime: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(supervisor::run(proxies, log_sink)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "fatal error");
            ExitCode::FAILURE
        }
    }
}
