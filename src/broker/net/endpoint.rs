use std::{
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime},
};

use quinn::ConnectionError;
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    server::AllowAnyAuthenticatedClient,
    Certificate, PrivateKey, ServerName,
};
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{dispatch::Dispatcher, error::TransportError, link::answer};
use crate::broker::topology::TlsSection;

/// How the endpoint authenticates itself and its peers.
#[derive(Clone, Debug)]
pub enum TlsSettings {
    /// Certificates from PEM files. Both sides must present a certificate
    /// signed by the CA.
    Pem(TlsSection),
    /// A throwaway self-signed certificate for `server_name`; peers are not
    /// verified. Only for development federations.
    SelfSigned { server_name: String },
}

/// QUIC endpoint serving broker requests and dialling peer brokers.
pub struct Endpoint {
    ep: quinn::Endpoint,
}

impl Endpoint {
    /// Binds to `listen`. Outgoing connections share the same socket and TLS
    /// identity.
    pub fn bind(listen: SocketAddr, tls: &TlsSettings) -> Result<Self, TransportError> {
        let (client_tls, server_tls) = match tls {
            TlsSettings::Pem(files) => Self::pem_tls(files)?,
            TlsSettings::SelfSigned { server_name } => Self::self_signed_tls(server_name)?,
        };

        // shared by the server and client sides
        let mut transport_config = quinn::TransportConfig::default();
        let bbr_config = quinn::congestion::BbrConfig::default();
        transport_config.congestion_controller_factory(Arc::new(bbr_config));
        transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
        let transport_config = Arc::new(transport_config);

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(server_tls));
        server_config.transport_config(transport_config.clone());

        let mut client_config = quinn::ClientConfig::new(Arc::new(client_tls));
        client_config.transport_config(transport_config);

        let mut ep = quinn::Endpoint::server(server_config, listen)?;
        ep.set_default_client_config(client_config);
        info!(listen = %ep.local_addr()?, "endpoint bound");
        Ok(Self { ep })
    }

    /// Handle used by peer clients to dial out.
    pub fn handle(&self) -> quinn::Endpoint {
        self.ep.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.ep.local_addr()?)
    }

    /// Accepts connections until the endpoint is closed. Each connection and
    /// each stream on it gets its own task.
    pub async fn serve(&self, dispatcher: Arc<Dispatcher>) {
        while let Some(connecting) = self.ep.accept().await {
            let dispatcher = dispatcher.clone();
            let remote = connecting.remote_address();
            tokio::spawn(
                async move {
                    let conn = match connecting.await {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "handshake failed");
                            return;
                        }
                    };
                    debug!("peer connected");
                    loop {
                        match conn.accept_bi().await {
                            Ok((send, recv)) => {
                                let dispatcher = dispatcher.clone();
                                tokio::spawn(async move {
                                    if let Err(err) = answer(send, recv, &dispatcher).await {
                                        warn!(error = %err, "stream failed");
                                    }
                                });
                            }
                            Err(ConnectionError::ApplicationClosed(_))
                            | Err(ConnectionError::LocallyClosed) => {
                                debug!("peer disconnected");
                                break;
                            }
                            Err(err) => {
                                debug!(error = %err, "connection lost");
                                break;
                            }
                        }
                    }
                }
                .instrument(debug_span!("peer", remote = %remote)),
            );
        }
    }

    pub fn close(&self) {
        self.ep.close(0u32.into(), b"shutdown");
    }

    /// Client and server configurations from PEM files. Both sides validate
    /// each other against the CA.
    fn pem_tls(
        files: &TlsSection,
    ) -> Result<(rustls::ClientConfig, rustls::ServerConfig), TransportError> {
        let mut root_certs = rustls::RootCertStore::empty();
        for ca in read_certs(&files.ca_path)? {
            root_certs
                .add(&ca)
                .map_err(|e| TransportError::Certificate(e.to_string()))?;
        }
        let certs = read_certs(&files.cert_path)?;
        let key = read_key(&files.key_path)?;

        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_certs.clone())
            .with_client_auth_cert(certs.clone(), key.clone())?;

        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(root_certs).boxed())
            .with_single_cert(certs, key)?;

        Ok((client_config, server_config))
    }

    fn self_signed_tls(
        server_name: &str,
    ) -> Result<(rustls::ClientConfig, rustls::ServerConfig), TransportError> {
        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(|e| TransportError::Certificate(e.to_string()))?;
        let der = cert
            .serialize_der()
            .map_err(|e| TransportError::Certificate(e.to_string()))?;
        let key = PrivateKey(cert.serialize_private_key_der());
        warn!(server_name, "using a self-signed certificate, peers are not verified");

        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();

        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![Certificate(der)], key)?;

        Ok((client_config, server_config))
    }
}

fn read_certs(path: &Path) -> Result<Vec<Certificate>, TransportError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(TransportError::Certificate(format!(
            "no certificate in {}",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_key(path: &Path) -> Result<PrivateKey, TransportError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if keys.len() != 1 {
        return Err(TransportError::Certificate(format!(
            "expected exactly one private key in {}, found {}",
            path.display(),
            keys.len()
        )));
    }
    Ok(PrivateKey(keys.remove(0)))
}

/// Accepts any server certificate. Paired with self-signed endpoints.
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
