//! Self-signed certificate provisioning for the adoption and upload servers.
//!
//! Grounded in `api_server.py::_ensure_cert_exists` (shell out to `openssl`, same flags)
//! and the teacher's external-process idiom (`camera.rs::discover_onvif`,
//! `update.rs::spawn_update_poller` both drive subprocesses via `tokio::process::Command`
//! and surface a `NotFound` distinctly from other failures).

use anyhow::{Context, Result, anyhow};
use axum_server::tls_rustls::RustlsConfig;
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};

/// Generates a 2048-bit self-signed RSA cert (CN=localhost, 365 days) at `cert_path`/
/// `key_path` if either is missing. No-op otherwise.
pub async fn ensure_self_signed_cert(cert_path: &Path, key_path: &Path) -> Result<()> {
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }

    warn!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "cert/key not found, generating self-signed certificate"
    );

    let status = Command::new("openssl")
        .arg("req")
        .arg("-x509")
        .arg("-newkey")
        .arg("rsa:2048")
        .arg("-nodes")
        .arg("-keyout")
        .arg(key_path)
        .arg("-out")
        .arg(cert_path)
        .arg("-days")
        .arg("365")
        .arg("-subj")
        .arg("/CN=localhost")
        .status()
        .await
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                anyhow!("openssl not found in PATH; cannot generate self-signed certificate")
            } else {
                anyhow!(err).context("failed to spawn openssl")
            }
        })?;

    if !status.success() {
        return Err(anyhow!("openssl exited with {status} while generating certificate"));
    }

    info!("self-signed certificate generated");
    Ok(())
}

pub async fn load(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig> {
    RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .with_context(|| format!("failed loading TLS cert/key from {}/{}", cert_path.display(), key_path.display()))
}
