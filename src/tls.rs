//! TLS wrapping for connections.
//!
//! Certificates are provisioned elsewhere; this module only loads PEM files
//! and builds `tokio-rustls` acceptors and connectors from them.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{ClientTlsConfig, ServerTlsConfig};
use crate::types::{Result, TetherError};

/// Read every certificate from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut rd).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(TetherError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(fs::File::open(path)?);
    rustls_pemfile::private_key(&mut rd)?.ok_or_else(|| {
        TetherError::Config(format!("no private key found in {}", path.display()))
    })
}

pub fn server_acceptor(config: &ServerTlsConfig) -> Result<TlsAcceptor> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;
    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(cfg)))
}

pub fn client_connector(config: &ClientTlsConfig) -> Result<(TlsConnector, ServerName<'static>)> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&config.ca_cert_path)? {
        roots.add(cert)?;
    }
    let cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let name = server_name_for(&config.server_name)?;
    Ok((TlsConnector::from(Arc::new(cfg)), name))
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|_| TetherError::Config(format!("invalid TLS server name: {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_names() {
        assert!(matches!(
            server_name_for("127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name_for("files.local").unwrap(),
            ServerName::DnsName(_)
        ));
        assert!(server_name_for("not a name!").is_err());
    }

    #[test]
    fn missing_material_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        fs::write(&empty, "").unwrap();

        assert!(matches!(load_certs(&empty), Err(TetherError::Config(_))));
        assert!(matches!(load_private_key(&empty), Err(TetherError::Config(_))));
        assert!(matches!(
            load_certs(&dir.path().join("absent.pem")),
            Err(TetherError::Io(_))
        ));
    }

    #[test]
    fn builds_from_generated_pair() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["files.local".to_string()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

        server_acceptor(&ServerTlsConfig {
            cert_path: cert_path.clone(),
            key_path,
        })
        .unwrap();
        client_connector(&ClientTlsConfig {
            ca_cert_path: cert_path,
            server_name: "files.local".into(),
        })
        .unwrap();
    }
}
