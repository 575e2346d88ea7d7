//! TLS session setup for brokers that require it.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// Build a rustls client config from PEM files.
///
/// The CA bundle is mandatory. A client certificate and key are used for
/// mutual TLS when both are present.
pub fn client_config(tls: &TlsConfig) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&tls.ca_certs)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("bad CA certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            tls.ca_certs.display()
        )));
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| Error::Tls(format!("bad client certificate: {e}"))),
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// Run the TLS handshake over an established TCP stream.
pub async fn connect(
    tls: &TlsConfig,
    host: &str,
    stream: TcpStream,
) -> Result<TlsStream<TcpStream>> {
    let config = client_config(tls)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))?;
    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::Tls(format!("handshake with {host} failed: {e}")))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("reading {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("reading {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::Tls(format!("opening {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_ca_bundle_is_a_tls_error() {
        let tls = TlsConfig {
            ca_certs: PathBuf::from("/nonexistent/ca.pem"),
            cert_file: None,
            key_file: None,
        };
        assert!(matches!(client_config(&tls), Err(Error::Tls(_))));
    }

    #[test]
    fn empty_ca_bundle_is_rejected() {
        let path = std::env::temp_dir().join(format!("swf-empty-ca-{}.pem", std::process::id()));
        std::fs::write(&path, "").unwrap();
        let tls = TlsConfig {
            ca_certs: path.clone(),
            cert_file: None,
            key_file: None,
        };
        let err = client_config(&tls).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(err.to_string().contains("no certificates"));
    }
}
