//! The caching request path: rewrite, key, look up, coalesce, fetch and tee.

use super::error::Error;
use crate::{
    cache::{
        body::{self, BoxError, ProxyBody, TeeBody},
        flight::{Flight, FlightGuard, SingleFlight},
        CacheKey, CacheRecord, CacheStore, Metadata,
    },
    connect::Connector,
    rewrite::Rewriter,
};
use http::{header, HeaderValue, Method, Request, Response, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;

// Request headers that describe the client hop, not the origin request.
const HOP_BY_HOP: [&str; 6] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "upgrade",
];

pub(super) struct Forwarder {
    pub rewriter: Rewriter,
    pub store: CacheStore,
    pub flights: SingleFlight,
    pub connector: Connector,
}

impl Forwarder {
    /// Answer an absolute-form request from the cache, or fetch it from the
    /// rewritten URL while storing the response.
    pub async fn forward(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, Error> {
        let method = req.method().clone();
        let original = req.uri().to_string();
        let rewritten = self.rewriter.rewrite(&original);
        let uri: Uri = rewritten
            .parse()
            .map_err(|_| Error::BadRequest("rewritten URL is not a valid URI"))?;
        let key = CacheKey::new(&method, &uri)
            .ok_or(Error::BadRequest("request target must be an absolute URL"))?;

        if rewritten != original {
            tracing::debug!("rewrote {} to {}", original, rewritten);
        }
        prepare_upstream(&mut req, uri)?;

        loop {
            match self.store.lookup(&key).await {
                Ok(Some(record)) => return Ok(self.hit(&method, &original, record)),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        "cache lookup for {} failed, serving uncached: {}",
                        original,
                        err
                    );
                    return self.pass_through(req).await;
                }
            }

            match self.flights.acquire(&key) {
                Flight::Follower(waiter) => {
                    tracing::debug!(
                        "waiting on in-flight fetch for {:?} ({} active)",
                        key,
                        self.flights.len()
                    );
                    waiter.wait().await;
                }
                Flight::Leader(guard) => {
                    // Another writer may have committed between the lookup and
                    // the registration.
                    if let Ok(Some(record)) = self.store.lookup(&key).await {
                        drop(guard);
                        return Ok(self.hit(&method, &original, record));
                    }
                    return self.fetch(req, &key, guard, &original).await;
                }
            }
        }
    }

    fn hit(&self, method: &Method, url: &str, record: CacheRecord) -> Response<ProxyBody> {
        tracing::info!("Hit! {} {} {}", method, url, record.path.display());

        let body = match record.body {
            Some(file) => body::stored(file),
            None => body::empty(),
        };
        let mut res = Response::new(body);
        *res.status_mut() = record.metadata.status();
        *res.headers_mut() = record.metadata.header_map();
        res
    }

    /// Fetch as the single writer for `key`. The guard travels with the
    /// cache writer so waiters are released once the entry lands or is
    /// abandoned.
    async fn fetch(
        &self,
        req: Request<Incoming>,
        key: &CacheKey,
        guard: FlightGuard,
        url: &str,
    ) -> Result<Response<ProxyBody>, Error> {
        let method = req.method().clone();
        let res = self.connector.send_request(req).await?;
        let (parts, incoming) = res.into_parts();

        tracing::info!(
            "Miss {} {} {}",
            method,
            url,
            self.store.body_path(key).display()
        );

        let body = match self.store.begin_write(key).await {
            Ok(handle) => {
                let metadata = Metadata::new(parts.status, &parts.headers);
                TeeBody::new(incoming, handle, metadata, guard).boxed_unsync()
            }
            Err(err) => {
                tracing::warn!("cannot store {}, serving uncached: {}", url, err);
                drop(guard);
                incoming.map_err(BoxError::from).boxed_unsync()
            }
        };

        Ok(Response::from_parts(parts, body))
    }

    async fn pass_through(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, Error> {
        let res = self.connector.send_request(req).await?;
        Ok(res.map(|body| body.map_err(BoxError::from).boxed_unsync()))
    }
}

/// Point `req` at `uri` and drop client-hop headers.
fn prepare_upstream(req: &mut Request<Incoming>, uri: Uri) -> Result<(), Error> {
    let host = uri
        .authority()
        .map(|authority| HeaderValue::from_str(authority.as_str()))
        .transpose()
        .map_err(http::Error::from)?;

    let headers = req.headers_mut();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    if let Some(host) = host {
        headers.insert(header::HOST, host);
    }

    *req.uri_mut() = uri;
    Ok(())
}
