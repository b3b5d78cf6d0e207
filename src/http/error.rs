use crate::cache::body::{full, ProxyBody};
use http::{Response, StatusCode};

/// Failure of a single proxied request.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] http::Error),

    #[error(transparent)]
    HyperLegacy(#[from] hyper_util::client::legacy::Error),

    #[error("cache storage: {0}")]
    Storage(#[from] std::io::Error),

    #[error("{0}")]
    BadRequest(&'static str),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::HyperLegacy(_) => StatusCode::BAD_GATEWAY,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Http(_) | Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Terminal response for the one affected request.
    pub fn into_response(self) -> Response<ProxyBody> {
        let status = self.status();
        let mut res = Response::new(full(format!("{self}\n")));
        *res.status_mut() = status;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::BadRequest("absolute URL required").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Storage(std::io::Error::other("disk full")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_into_response_carries_message() {
        let res = Error::BadRequest("CONNECT must name host:port").into_response();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
