//! mTLS for the agent-facing API
//!
//! The server certificate and the client trust root both come from the
//! appliance CA; agents must present a certificate it issued.

use anyhow::{anyhow, Context, Result};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use warden_common::trust::IssuedCertificate;

fn parse_certs(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let parsed = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse {}", what))?;
    if parsed.is_empty() {
        return Err(anyhow!("No certificates found in {}", what));
    }
    Ok(parsed)
}

/// Build a rustls server config that requires CA-issued client certificates
pub fn server_config(server: &IssuedCertificate) -> Result<Arc<ServerConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in parse_certs(&server.ca_pem, "CA certificate")? {
        root_store
            .add(cert)
            .with_context(|| "Failed to add CA cert to root store")?;
    }

    let server_certs = parse_certs(&server.cert_pem, "server certificate")?;

    let mut key_reader = BufReader::new(server.key_pem.as_bytes());
    let mut keys = pkcs8_private_keys(&mut key_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| "Failed to parse server private key")?;
    if keys.is_empty() {
        return Err(anyhow!("No private keys found in server key"));
    }
    let private_key = PrivateKeyDer::Pkcs8(keys.remove(0));

    let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store))
        .build()
        .with_context(|| "Failed to build client verifier")?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(server_certs, private_key)
        .with_context(|| "Failed to build server config")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!("TLS server config loaded (mTLS enabled, SAN {})", server.san);
    Ok(Arc::new(config))
}

/// Accept TLS connections and serve `app` until shutdown
pub async fn serve_tls(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(config);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        // Open connections hold the router; they must close on shutdown too
        let mut stop = shutdown.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            let builder = Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(tls), TowerToHyperService::new(app));
            tokio::pin!(conn);
            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = stop.changed() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(e) = result {
                debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }
    info!("TLS listener stopped");
    Ok(())
}
