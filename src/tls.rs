//! Server TLS context and peer-certificate CN extraction.
//!
//! `rustls` never parses the certificate it's handed past what it needs for
//! the handshake, so a CN lookup goes through `x509-parser` separately, on
//! whatever DER bytes the handshake returned.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use crate::config::ProxyConfig;

fn cert_reader<P: AsRef<Path>>(path: P) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path.as_ref()).with_context(|| format!("failed to open '{}'", path.as_ref().display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in '{}'", path.as_ref().display()))
}

fn privkey_reader<P: AsRef<Path>>(path: P) -> Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path.as_ref()).with_context(|| format!("failed to open '{}'", path.as_ref().display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to parse private key in '{}'", path.as_ref().display()))?
        .ok_or_else(|| anyhow!("no private key found in '{}'", path.as_ref().display()))
}

fn load_root_store<P: AsRef<Path>>(path: P) -> Result<RootCertStore> {
    let certs = cert_reader(path.as_ref())?;
    let mut store = RootCertStore::empty();
    let (_, rejected) = store.add_parsable_certificates(certs);
    if rejected != 0 {
        return Err(anyhow!(
            "{} certificate(s) in '{}' could not be parsed",
            rejected,
            path.as_ref().display()
        ));
    }
    if store.is_empty() {
        return Err(anyhow!("'{}' did not contain any valid certificates", path.as_ref().display()));
    }
    Ok(store)
}

/// Build a server TLS config for a proxy listener, if it's configured for
/// TLS at all. Client certificate verification is only installed when `ca`
/// is set; an empty `ca` means the listener terminates TLS without
/// requiring (or even asking for) a client certificate.
pub fn build_server_config(proxy: &ProxyConfig) -> Result<Option<ServerConfig>> {
    let (Some(cert_path), Some(key_path)) = (&proxy.cert, &proxy.key) else {
        return Ok(None);
    };

    let cert = cert_reader(cert_path)?;
    let key = privkey_reader(key_path)?;

    let config = match &proxy.ca {
        Some(ca_path) => {
            let roots = load_root_store(ca_path)?;
            // `ca` configured means the handshake asks for a client cert,
            // not that it requires one: `session.c`'s cert-binding guard
            // only runs `if (cert)`, so a client with no certificate at all
            // still completes the handshake and simply binds no CN-based
            // ACL.
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| anyhow!("failed to build client certificate verifier: {e}"))?;
            ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(cert, key)?
        }
        None => ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert, key)?,
    };

    Ok(Some(config))
}

/// Pull the `commonName` RDN out of a peer certificate's subject, if one
/// was presented and parses as a well-formed X.509 certificate.
pub fn peer_common_name(der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}
