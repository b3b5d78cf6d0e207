//! TLS termination for intercepted CONNECT tunnels.

use super::{CertificateForge, Result};
use std::{io, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{rustls::server::Acceptor, server::TlsStream, LazyConfigAcceptor};

/// Terminates TLS with a certificate forged for the name the client asks for.
#[derive(Clone)]
pub struct MitmAcceptor {
    forge: CertificateForge,
    handshake_timeout: Duration,
}

impl MitmAcceptor {
    pub fn new(forge: CertificateForge, timeout: u64) -> Self {
        Self {
            forge,
            handshake_timeout: Duration::from_secs(timeout),
        }
    }

    /// Read the ClientHello, forge a leaf for its SNI name (or `fallback`
    /// when the client sent none) and complete the handshake.
    ///
    /// Returns the TLS stream and the name the leaf was issued for.
    pub async fn accept<IO>(&self, io: IO, fallback: &str) -> Result<(TlsStream<IO>, String)>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = async {
            let start = LazyConfigAcceptor::new(Acceptor::default(), io).await?;
            let server_name = start
                .client_hello()
                .server_name()
                .unwrap_or(fallback)
                .to_owned();

            let leaf = self.forge.issue(&server_name).await?;
            let config = Arc::new(leaf.server_config()?);
            let stream = start.into_stream(config).await?;
            Ok::<_, super::Error>((stream, server_name))
        };

        tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?
    }
}
