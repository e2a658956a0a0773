//! HTTP transport seam.
//!
//! The dispatcher talks to the wire through a
//! `tower::Service<http::Request<Bytes>>` yielding buffered
//! `http::Response<Bytes>` values, so tests can swap in a scripted
//! service. [`HttpTransport`] is the production implementation over
//! `reqwest`.
//!
//! A transport error means the exchange itself failed; a response with a
//! non-success status is still `Ok`, since judging status codes belongs
//! to the caller's response-header action.

use bytes::Bytes;
use futures::future::BoxFuture;
use snafu::Snafu;
use std::task::{Context, Poll};
use tower::Service;

/// A buffered HTTP request.
pub type HttpRequest = http::Request<Bytes>;
/// A buffered HTTP response.
pub type HttpResponse = http::Response<Bytes>;

/// Why an HTTP exchange failed.
#[derive(Debug, Snafu)]
pub enum TransportError {
    /// The request did not complete in time.
    #[snafu(display("request timed out"))]
    Timeout,

    /// The request's cancellation token fired.
    #[snafu(display("request canceled"))]
    Canceled,

    /// The connection could not be established.
    #[snafu(display("connect failed: {source}"))]
    Connect { source: crate::Error },

    /// The request could not be built for the wire.
    #[snafu(display("invalid request: {details}"))]
    InvalidRequest { details: String },

    /// Any other transport-level failure.
    #[snafu(display("transport failed: {source}"))]
    Other { source: crate::Error },
}

impl TransportError {
    /// Whether this error represents cancellation or a deadline rather
    /// than a connectivity problem.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Canceled)
    }
}

/// Lets scripted test services with boxed errors satisfy the dispatcher
/// bound; a boxed `TransportError` survives the round trip.
impl From<crate::Error> for TransportError {
    fn from(error: crate::Error) -> Self {
        match error.downcast::<TransportError>() {
            Ok(transport) => *transport,
            Err(error) => TransportError::Other { source: error },
        }
    }
}

/// `reqwest`-backed transport.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with a default `reqwest` client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport over a configured `reqwest` client (pools,
    /// TLS, proxies, timeouts).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Service<HttpRequest> for HttpTransport {
    type Response = HttpResponse;
    type Error = TransportError;
    type Future = BoxFuture<'static, Result<HttpResponse, TransportError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: HttpRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let (parts, body) = request.into_parts();

            let url = match reqwest::Url::parse(&parts.uri.to_string()) {
                Ok(url) => url,
                Err(error) => {
                    return InvalidRequestSnafu {
                        details: format!("invalid url {:?}: {error}", parts.uri.to_string()),
                    }
                    .fail()
                }
            };

            let mut builder = client.request(parts.method, url);
            for (name, value) in parts.headers.iter() {
                builder = builder.header(name, value);
            }
            if !body.is_empty() {
                builder = builder.body(body);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    let version = response.version();
                    let headers = response.headers().clone();
                    let body = match response.bytes().await {
                        Ok(body) => body,
                        Err(error) => {
                            return Err(TransportError::Other {
                                source: Box::new(error),
                            })
                        }
                    };

                    let mut out = http::Response::new(body);
                    *out.status_mut() = status;
                    *out.version_mut() = version;
                    *out.headers_mut() = headers;
                    Ok(out)
                }
                Err(error) if error.is_timeout() => Err(TransportError::Timeout),
                Err(error) if error.is_connect() => Err(TransportError::Connect {
                    source: Box::new(error),
                }),
                Err(error) => Err(TransportError::Other {
                    source: Box::new(error),
                }),
            }
        })
    }
}
