use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::aws_lc_rs;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::debug;

use crate::error::StoreError;

/// TLS connector for PostgreSQL connections in `prefer` and `require` mode.
///
/// Server certificates are verified against the webpki root set, extended
/// with the PEM certificates in `root_cert` for private or self-signed CAs.
pub fn make_connector(root_cert: Option<&Path>) -> Result<MakeRustlsConnect, StoreError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = root_cert {
        let pem = fs::read(path).map_err(|e| {
            StoreError::Tls(format!("failed to read root certificate {}: {e}", path.display()))
        })?;
        let added = add_pem_certs(&mut roots, &pem)
            .map_err(|e| StoreError::Tls(format!("{}: {e}", path.display())))?;
        debug!("Loaded {} root certificate(s) from {}", added, path.display());
    }

    let config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| StoreError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(MakeRustlsConnect::new(config))
}

fn add_pem_certs(roots: &mut RootCertStore, pem: &[u8]) -> Result<usize, String> {
    let certs = rustls_pemfile::certs(&mut &*pem)
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| format!("invalid PEM: {e}"))?;

    if certs.is_empty() {
        return Err("no certificates found".to_string());
    }

    let (added, _ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err("no usable certificates".to_string());
    }
    Ok(added)
}
