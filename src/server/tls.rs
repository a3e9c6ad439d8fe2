use crate::error::ProxyError;
use crate::settings::ServerSettings;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;

/// PEM contents are passed inline or by filename; inline material is
/// detected by the PEM header prefix.
const PEM_PREFIX: &str = "-----BEGIN ";

/// Resolve one TLS input to PEM bytes: inline contents as-is, anything
/// else read as a filename relative to the TLS base directory.
fn load_material(value: &str, base_dir: &str) -> Result<Vec<u8>, ProxyError> {
    if value.trim_start().starts_with(PEM_PREFIX) {
        return Ok(value.as_bytes().to_vec());
    }
    let path = Path::new(base_dir).join(value);
    std::fs::read(&path).map_err(|e| ProxyError::Tls(format!("{}: {}", path.display(), e)))
}

/// Build the rustls server config from the TLS settings: certificate,
/// key, optional chain. Encrypted keys are unsupported: a configured
/// passphrase is a startup error rather than a silently ignored knob.
pub fn load_server_config(settings: &ServerSettings) -> Result<rustls::ServerConfig, ProxyError> {
    if !settings.tls_passphrase().is_empty() {
        return Err(ProxyError::Tls(
            "encrypted TLS keys are not supported; provide an unencrypted key".to_string(),
        ));
    }

    let cert_value = settings.tls_cert();
    let key_value = settings.tls_key();
    if cert_value.is_empty() || key_value.is_empty() {
        return Err(ProxyError::Tls(
            "TLS is enabled but TLS_CERT / TLS_KEY are not set".to_string(),
        ));
    }

    let base_dir = settings.tls_base_dir();

    let mut cert_pem = load_material(&cert_value, &base_dir)?;
    let chain_value = settings.tls_chain();
    if !chain_value.is_empty() {
        cert_pem.push(b'\n');
        cert_pem.extend_from_slice(&load_material(&chain_value, &base_dir)?);
    }

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<_, _>>()
            .map_err(|e| ProxyError::Tls(format!("certificate parse failed: {}", e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls("no certificates found in TLS_CERT".to_string()));
    }

    let key_pem = load_material(&key_value, &base_dir)?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| ProxyError::Tls(format!("private key parse failed: {}", e)))?
        .ok_or_else(|| ProxyError::Tls("no private key found in TLS_KEY".to_string()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("certificate/key mismatch: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}
