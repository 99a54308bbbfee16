//! TLS configuration: build rustls server and client configs from PEM files.

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Build a rustls ServerConfig from PEM certificate and key file paths.
pub fn load_server_config_from_files(
    cert_file: &str,
    key_file: &str,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs_from_file(cert_file)?;
    let key = load_private_key_from_file(key_file)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

/// Build a rustls ClientConfig trusting the CAs in the given PEM file.
pub fn load_client_config_from_files(ca_file: &str) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs_from_file(ca_file)? {
        roots
            .add(cert)
            .context("Add CA certificate to root store")?;
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open cert file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("Open key file: {}", path))?;
    let mut reader = BufReader::new(file);
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let file = fs::File::open(path).with_context(|| format!("Open key file: {}", path))?;
    let mut reader = BufReader::new(file);
    let rsa: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

/// Check that cert and key files exist and parse (for startup validation).
pub fn validate_tls_files(cert_file: &str, key_file: &str, ca_file: Option<&str>) -> Result<()> {
    if !Path::new(cert_file).exists() {
        anyhow::bail!("TLS cert file not found: {}", cert_file);
    }
    if !Path::new(key_file).exists() {
        anyhow::bail!("TLS key file not found: {}", key_file);
    }
    if let Some(ca) = ca_file {
        if !Path::new(ca).exists() {
            anyhow::bail!("TLS CA file not found: {}", ca);
        }
    }
    load_server_config_from_files(cert_file, key_file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_rejected() {
        assert!(validate_tls_files("/nonexistent/cert.pem", "/nonexistent/key.pem", None).is_err());
        assert!(load_server_config_from_files("/nonexistent/cert.pem", "/nonexistent/key.pem").is_err());
        assert!(load_client_config_from_files("/nonexistent/ca.pem").is_err());
    }

    #[test]
    fn test_empty_pem_has_no_certs() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let err = load_certs_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("No certificates"));
    }
}
