//! Configuration tree and CLI flags.
//!
//! The original daemon reads its tree via `libconfig`; this parses the same
//! shape out of TOML with `serde`, matching the pairing the pack uses for
//! comparable proxy daemons. Validation (required lists, cert/key pairing,
//! unknown ACL ids) happens once, at load time, the same place the original
//! fails fast with an `E1` log line and a non-zero exit.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::Deserialize;

use crate::acl::{AclEntry, AclNet};

const DEFAULT_CA: &str = "/etc/ssl/certs/ca-certificates.crt";
const DEFAULT_REDIS_TIMEOUT_SECS: u64 = 3;

#[derive(Parser, Debug)]
#[command(name = "redis-aclproxy", version, about = "TLS + ACL proxy for redis")]
pub struct Cli {
    /// Read configuration from file.
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// Validate the configuration and exit without starting any proxy.
    #[arg(short = 't', long = "test")]
    pub test: bool,

    /// Don't daemonize; run in the foreground.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    user: Option<String>,
    chroot: Option<String>,
    pidfile: Option<String>,
    logfile: Option<String>,
    logmask: Option<String>,
    #[serde(default)]
    acl: Vec<RawAcl>,
    #[serde(default)]
    proxy: Vec<RawProxy>,
}

#[derive(Debug, Deserialize)]
struct RawAcl {
    id: String,
    auth: Option<String>,
    cert: Option<String>,
    #[serde(default)]
    net: Vec<String>,
    allow: Option<Vec<String>>,
    deny: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawProxy {
    listen: String,
    redis: String,
    redis_timeout: Option<u64>,
    redis_auth: Option<String>,
    cert: Option<String>,
    key: Option<String>,
    ca: Option<String>,
    #[serde(default)]
    acl: Vec<String>,
}

/// A fully parsed and validated configuration.
#[derive(Debug)]
pub struct Config {
    pub user: Option<String>,
    pub chroot: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    pub logmask: Option<String>,
    pub acl: Vec<AclEntry>,
    pub proxy: Vec<ProxyConfig>,
}

/// One `[[proxy]]` listener, resolved and validated.
#[derive(Debug)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub redis: SocketAddr,
    pub redis_timeout: Duration,
    pub redis_auth: Option<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// `None` means TLS is plain (no client certificate verification);
    /// `Some` is the CA bundle to verify client certs against.
    pub ca: Option<PathBuf>,
    pub acl_ids: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration from '{}'", path.display()))?;
        let raw: RawConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse configuration '{}'", path.display()))?;

        if raw.acl.is_empty() {
            return Err(anyhow!("missing 'acl' configuration"));
        }
        if raw.proxy.is_empty() {
            return Err(anyhow!("missing 'proxy' configuration"));
        }

        let acl = raw
            .acl
            .into_iter()
            .map(build_acl_entry)
            .collect::<Result<Vec<_>>>()?;

        for (i, a) in acl.iter().enumerate() {
            if a.id.is_empty() {
                return Err(anyhow!("'acl' entry at index {i} has an empty 'id'"));
            }
            if acl[..i].iter().any(|other| other.id == a.id) {
                return Err(anyhow!("duplicate 'acl' id '{}'", a.id));
            }
        }

        let proxy = raw
            .proxy
            .into_iter()
            .map(|p| build_proxy_config(p, &acl))
            .collect::<Result<Vec<_>>>()?;

        Ok(Config {
            user: raw.user,
            chroot: raw.chroot.map(PathBuf::from),
            pidfile: raw.pidfile.map(PathBuf::from),
            logfile: raw.logfile.map(PathBuf::from),
            logmask: raw.logmask,
            acl,
            proxy,
        })
    }
}

fn build_acl_entry(raw: RawAcl) -> Result<AclEntry> {
    let nets = raw
        .net
        .iter()
        .map(|cidr| AclNet::parse(cidr).with_context(|| format!("failed to parse 'net' for acl '{}'", raw.id)))
        .collect::<Result<Vec<_>>>()?;

    Ok(AclEntry {
        id: raw.id,
        auth: raw.auth,
        cert: raw.cert,
        nets,
        allow: raw.allow.filter(|v| !v.is_empty()),
        deny: raw.deny.filter(|v| !v.is_empty()),
    })
}

fn build_proxy_config(raw: RawProxy, acl: &[AclEntry]) -> Result<ProxyConfig> {
    let listen = raw
        .listen
        .parse()
        .with_context(|| format!("failed to parse 'listen' '{}'", raw.listen))?;
    let redis = raw
        .redis
        .parse()
        .with_context(|| format!("failed to parse 'redis' '{}'", raw.redis))?;

    let (cert, key, ca) = match (raw.cert, raw.key) {
        (Some(cert), Some(key)) => {
            let ca = match raw.ca {
                Some(ca) if ca.is_empty() => None,
                Some(ca) => Some(ca),
                None => Some(DEFAULT_CA.to_string()),
            };
            if let Some(ca) = &ca {
                fs::metadata(ca).with_context(|| format!("failed to read '{ca}'"))?;
            }
            (Some(PathBuf::from(cert)), Some(PathBuf::from(key)), ca.map(PathBuf::from))
        }
        (None, None) => (None, None, None),
        _ => return Err(anyhow!("'proxy' entry without valid 'cert'+'key'")),
    };

    for id in &raw.acl {
        if !acl.iter().any(|a| &a.id == id) {
            return Err(anyhow!("unknown 'acl' entry '{id}'"));
        }
    }

    Ok(ProxyConfig {
        listen,
        redis,
        redis_timeout: Duration::from_secs(raw.redis_timeout.unwrap_or(DEFAULT_REDIS_TIMEOUT_SECS)),
        redis_auth: raw.redis_auth,
        cert,
        key,
        ca,
        acl_ids: raw.acl,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn write_config(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_valid_config() {
        let file = write_config(
            r#"
            [[acl]]
            id = "internal"
            net = ["10.0.0.0/8"]

            [[proxy]]
            listen = "0.0.0.0:6380"
            redis = "127.0.0.1:6379"
            acl = ["internal"]
            "#,
        );
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.acl.len(), 1);
        assert_eq!(cfg.proxy.len(), 1);
        assert_eq!(cfg.proxy[0].redis_timeout, Duration::from_secs(3));
        assert!(cfg.proxy[0].cert.is_none());
    }

    #[test]
    fn rejects_empty_acl_list() {
        let file = write_config(
            r#"
            [[proxy]]
            listen = "0.0.0.0:6380"
            redis = "127.0.0.1:6379"
            "#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn rejects_duplicate_acl_ids() {
        let file = write_config(
            r#"
            [[acl]]
            id = "dup"
            net = ["10.0.0.0/8"]

            [[acl]]
            id = "dup"
            net = ["10.1.0.0/16"]

            [[proxy]]
            listen = "0.0.0.0:6380"
            redis = "127.0.0.1:6379"
            acl = ["dup"]
            "#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn rejects_unknown_acl_reference() {
        let file = write_config(
            r#"
            [[acl]]
            id = "internal"
            net = ["10.0.0.0/8"]

            [[proxy]]
            listen = "0.0.0.0:6380"
            redis = "127.0.0.1:6379"
            acl = ["nonexistent"]
            "#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn rejects_cert_without_key() {
        let file = write_config(
            r#"
            [[acl]]
            id = "internal"
            net = ["10.0.0.0/8"]

            [[proxy]]
            listen = "0.0.0.0:6380"
            redis = "127.0.0.1:6379"
            acl = ["internal"]
            cert = "/tmp/does-not-matter.crt"
            "#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn empty_ca_disables_client_verification() {
        let file = write_config(&format!(
            r#"
            [[acl]]
            id = "internal"
            net = ["10.0.0.0/8"]

            [[proxy]]
            listen = "0.0.0.0:6380"
            redis = "127.0.0.1:6379"
            acl = ["internal"]
            cert = "{cert}"
            key = "{key}"
            ca = ""
            "#,
            cert = "/dev/null",
            key = "/dev/null",
        ));
        let cfg = Config::load(file.path()).unwrap();
        assert!(cfg.proxy[0].ca.is_none());
    }
}
