use super::{error::Error, forward::Forwarder};
use crate::{
    cache::{
        body::{empty, ProxyBody},
        flight::SingleFlight,
    },
    serve::Context,
    tls::MitmAcceptor,
};
use http::{header, uri::Authority, HeaderValue, StatusCode};
use hyper::{
    body::Incoming, ext::ReasonPhrase, service::service_fn, upgrade::Upgraded, Method, Request,
    Response,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
};
use std::{convert::Infallible, io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};

/// HTTP proxy server.
pub struct Server {
    builder: Builder<TokioExecutor>,
    listener: TcpListener,
    http_proxy: Handler,
}

impl Server {
    /// Bind the listener described by `ctx`.
    pub fn new(ctx: Context) -> io::Result<Self> {
        let socket = if ctx.bind.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(ctx.bind)?;

        let listener = socket.listen(ctx.concurrent as u32)?;
        let mut builder = Builder::new(TokioExecutor::new());
        builder
            .http1()
            .title_case_headers(true)
            .preserve_header_case(true);
        let http_proxy = Handler::new(ctx, builder.clone());

        Ok(Self {
            builder,
            listener,
            http_proxy,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve the proxy.
    ///
    /// Never returns on a per-connection failure; every connection task
    /// logs its own error.
    pub async fn serve(self) -> crate::Result<()> {
        let mut incoming = self.listener;
        let builder = self.builder;
        let proxy = self.http_proxy;

        loop {
            let (tcp_stream, socket_addr) = accept(&mut incoming).await;

            let proxy = proxy.clone();
            let builder = builder.clone();

            tokio::spawn(async move {
                if let Err(err) = builder
                    .serve_connection_with_upgrades(
                        TokioIo::new(tcp_stream),
                        service_fn(|req| {
                            <Handler as Clone>::clone(&proxy).proxy(socket_addr, req)
                        }),
                    )
                    .await
                {
                    tracing::error!("Failed to serve connection {}: {:?}", socket_addr, err);
                }
            });
        }
    }
}

async fn accept(listener: &mut TcpListener) -> (TcpStream, SocketAddr) {
    loop {
        match listener.accept().await {
            Ok(value) => return value,
            Err(err) => {
                tracing::warn!("accept error: {}", err);
                tokio::time::sleep(Duration::from_millis(50)).await
            }
        }
    }
}

#[derive(Clone)]
struct Handler {
    inner: Arc<InnerHandler>,
}

struct InnerHandler {
    forwarder: Forwarder,
    connector: crate::connect::Connector,
    mitm: Option<MitmAcceptor>,
    builder: Builder<TokioExecutor>,
}

impl Handler {
    fn new(ctx: Context, builder: Builder<TokioExecutor>) -> Self {
        Handler {
            inner: Arc::new(InnerHandler {
                forwarder: Forwarder {
                    rewriter: ctx.rewriter,
                    store: ctx.store,
                    flights: SingleFlight::new(),
                    connector: ctx.connector.clone(),
                },
                connector: ctx.connector,
                mitm: ctx.mitm,
                builder,
            }),
        }
    }

    async fn proxy(
        self,
        socket: SocketAddr,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        tracing::debug!("Received request socket: {:?}, req: {:?}", socket, req);

        if Method::CONNECT == req.method() {
            return Ok(self.connect(req));
        }

        Ok(self
            .inner
            .forwarder
            .forward(req)
            .await
            .unwrap_or_else(|err| failed(socket, err)))
    }

    // The tunnel is reported as established before the target is contacted;
    // the upgraded stream is only available once this response is written.
    fn connect(self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            tracing::warn!("CONNECT host is not socket addr: {:?}", req.uri());
            return Error::BadRequest("CONNECT must be to a socket address").into_response();
        };

        tokio::task::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => match self.inner.mitm.clone() {
                    Some(mitm) => self.intercept(upgraded, authority, mitm).await,
                    None => {
                        if let Err(e) = self.tunnel(upgraded, &authority).await {
                            tracing::warn!("tunnel to {} failed: {}", authority, e);
                        }
                    }
                },
                Err(e) => tracing::warn!("upgrade error: {}", e),
            }
        });

        let mut res = Response::new(empty());
        res.extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection established"));
        res.headers_mut().insert(
            "proxy-agent",
            HeaderValue::from_static(env!("CARGO_PKG_NAME")),
        );
        res
    }

    // Splice the client with a raw connection to `authority`.
    async fn tunnel(&self, upgraded: Upgraded, authority: &Authority) -> io::Result<()> {
        let mut server = self
            .inner
            .connector
            .tcp_connector()
            .connect_with_authority(authority)
            .await?;

        match tokio::io::copy_bidirectional(&mut TokioIo::new(upgraded), &mut server).await {
            Ok((from_client, from_server)) => {
                tracing::debug!(
                    "client wrote {} bytes and received {} bytes",
                    from_client,
                    from_server
                );
            }
            Err(err) => {
                tracing::debug!("tunnel error: {}", err);
            }
        }

        Ok(())
    }

    // Terminate TLS locally and serve the decrypted requests through the
    // caching path as `https`.
    async fn intercept(self, upgraded: Upgraded, authority: Authority, mitm: MitmAcceptor) {
        let fallback = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();

        let (stream, server_name) = match mitm.accept(TokioIo::new(upgraded), &fallback).await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("TLS handshake for {} failed: {}", authority, err);
                return;
            }
        };
        tracing::debug!("intercepting {} as {}", authority, server_name);

        let builder = self.inner.builder.clone();
        let handler = self;
        if let Err(err) = builder
            .serve_connection(
                TokioIo::new(stream),
                service_fn(|req| {
                    <Handler as Clone>::clone(&handler).intercepted(authority.clone(), req)
                }),
            )
            .await
        {
            tracing::debug!("intercepted connection to {} closed: {:?}", authority, err);
        }
    }

    async fn intercepted(
        self,
        authority: Authority,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|host| host.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| authority.to_string());
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        match format!("https://{host}{path}").parse() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(_) => {
                return Ok(Error::BadRequest("invalid Host for intercepted request").into_response())
            }
        }

        Ok(self
            .inner
            .forwarder
            .forward(req)
            .await
            .unwrap_or_else(|err| failed(authority, err)))
    }
}

fn failed(peer: impl std::fmt::Display, err: Error) -> Response<ProxyBody> {
    if err.status() == StatusCode::BAD_REQUEST {
        tracing::debug!("bad request from {}: {}", peer, err);
    } else {
        tracing::warn!("request from {} failed: {}", peer, err);
    }
    err.into_response()
}
