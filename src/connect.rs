use crate::http::error::Error;
use http::{uri::Authority, Request, Response};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{lookup_host, TcpStream},
    time::timeout,
};
use tokio_rustls::rustls::crypto::aws_lc_rs;

/// Upstream transport shared by every connection: raw TCP for tunnels and a
/// pooled HTTP/HTTPS client for forwarded requests.
#[derive(Clone)]
pub struct Connector {
    /// Connect timeout.
    connect_timeout: Duration,

    /// Pooled client, verifying origins against the webpki roots.
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
}

impl Connector {
    pub fn new(connect_timeout: u64) -> io::Result<Self> {
        let connect_timeout = Duration::from_secs(connect_timeout);

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(connect_timeout));

        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(Arc::new(aws_lc_rs::default_provider()))
            .map_err(io::Error::other)?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .timer(TokioTimer::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https);

        Ok(Connector {
            connect_timeout,
            client,
        })
    }

    #[inline(always)]
    pub fn tcp_connector(&self) -> TcpConnector<'_> {
        TcpConnector { inner: self }
    }

    /// Send `req` to the origin named by its absolute URI.
    pub async fn send_request(&self, req: Request<Incoming>) -> Result<Response<Incoming>, Error> {
        self.client.request(req).await.map_err(Into::into)
    }
}

/// Plain TCP connections bounded by the connect timeout.
pub struct TcpConnector<'a> {
    inner: &'a Connector,
}

impl TcpConnector<'_> {
    /// Try every resolved address in turn and return the first stream.
    pub async fn connect_with_addrs(
        &self,
        addrs: impl IntoIterator<Item = SocketAddr>,
    ) -> io::Result<TcpStream> {
        let mut last_err = None;

        for target_addr in addrs {
            match self.connect(target_addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            };
        }

        Err(error(last_err))
    }

    #[inline]
    pub async fn connect_with_authority(&self, authority: &Authority) -> io::Result<TcpStream> {
        let addrs = lookup_host(authority.as_str()).await?;
        self.connect_with_addrs(addrs).await
    }

    pub async fn connect(&self, target_addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = timeout(self.inner.connect_timeout, TcpStream::connect(target_addr)).await??;
        tracing::debug!("connect {} via {}", target_addr, stream.local_addr()?);
        Ok(stream)
    }
}

/// The last connect error, or `ConnectionAborted` when nothing resolved.
fn error(last_err: Option<io::Error>) -> io::Error {
    match last_err {
        Some(e) => {
            tracing::warn!("Failed to connect to any resolved address: {}", e);
            e
        }
        None => io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "Failed to connect to any resolved address",
        ),
    }
}
