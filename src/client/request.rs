//! Instrumented requests.
//!
//! A [`Request`] wraps the raw HTTP pieces with the hooks the dispatcher
//! consults along the way: response transformers, a payload decoder or
//! writer sink, a response-header action, a cancellation action, and the
//! request's own deadline and cancellation token.

use std::any::Any;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::transport::HttpResponse;

/// What the dispatcher should do after an attempt.
///
/// Mirrors the next-upstream policy of a reverse proxy: keep the result,
/// retry the same endpoint, or move on to the next one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndpointAction {
    /// Keep the outcome as-is.
    #[default]
    None,
    /// Fail over to the next endpoint; resets the retry budget.
    NextEndpoint,
    /// Retry on the same endpoint under the configured backoff.
    Retrying,
}

/// Response transformer applied in order before decoding.
pub type Transformer =
    Arc<dyn Fn(HttpResponse) -> Result<HttpResponse, crate::Error> + Send + Sync>;

/// Decodes a response body into a typed payload.
pub type Decoder =
    Arc<dyn Fn(&Bytes) -> Result<Box<dyn Any + Send>, crate::Error> + Send + Sync>;

/// Judges a response by status and headers.
pub type HeaderAction = Arc<dyn Fn(StatusCode, &HeaderMap) -> EndpointAction + Send + Sync>;

/// Decides what to do when the request was canceled or timed out.
pub type CancelAction = Arc<dyn Fn() -> EndpointAction + Send + Sync>;

/// Built-in header action judging 5xx responses: 502 retries the same
/// endpoint, 500 and 503 fail over, anything else passes through.
pub fn on_status_5xx(status: StatusCode, _headers: &HeaderMap) -> EndpointAction {
    match status {
        StatusCode::BAD_GATEWAY => EndpointAction::Retrying,
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => {
            EndpointAction::NextEndpoint
        }
        _ => EndpointAction::None,
    }
}

/// Builds a decoder that deserializes the body as JSON into `T`.
pub fn json_decoder<T>() -> Decoder
where
    T: DeserializeOwned + Send + 'static,
{
    Arc::new(|bytes| {
        let value: T = serde_json::from_slice(bytes)?;
        Ok(Box::new(value) as Box<dyn Any + Send>)
    })
}

pub(super) enum Expect {
    /// Body is ignored (beyond the raw response).
    Ignore,
    /// Body is decoded into a typed payload.
    Decode(Decoder),
    /// Body is copied into a writer sink.
    Write(Arc<Mutex<Box<dyn Write + Send>>>),
}

/// An HTTP request plus dispatcher hooks.
///
/// The URI is relative to whichever endpoint the dispatcher picks: its
/// scheme, authority, and path prefix are spliced in per attempt and
/// reverted afterwards.
///
/// ```
/// use resilient_client::client::{json_decoder, on_status_5xx, Request};
///
/// let request = Request::get("/v1/status")?
///     .on_response_header(on_status_5xx)
///     .with_decoder(json_decoder::<serde_json::Value>());
/// # Ok::<(), http::Error>(())
/// ```
pub struct Request {
    pub(super) method: Method,
    pub(super) uri: Uri,
    pub(super) headers: HeaderMap,
    pub(super) body: Bytes,
    pub(super) transforms: Vec<Transformer>,
    pub(super) expect: Expect,
    pub(super) on_response_header: Option<HeaderAction>,
    pub(super) on_canceled: Option<CancelAction>,
    pub(super) timeout: Option<Duration>,
    pub(super) cancel: Option<CancellationToken>,
}

impl Request {
    /// Wraps a prepared `http::Request`.
    pub fn new(request: http::Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            transforms: Vec::new(),
            expect: Expect::Ignore,
            on_response_header: None,
            on_canceled: None,
            timeout: None,
            cancel: None,
        }
    }

    /// A bodyless GET of `uri` (usually a path; the endpoint supplies
    /// scheme and authority).
    pub fn get(uri: &str) -> Result<Self, http::Error> {
        Ok(Self::new(
            http::Request::get(uri).body(Bytes::new())?,
        ))
    }

    /// A POST of `uri` carrying `body`.
    pub fn post(uri: &str, body: impl Into<Bytes>) -> Result<Self, http::Error> {
        Ok(Self::new(http::Request::post(uri).body(body.into())?))
    }

    /// Appends a response transformer; transformers run in the order
    /// they were added.
    pub fn with_transform(
        mut self,
        transform: impl Fn(HttpResponse) -> Result<HttpResponse, crate::Error>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    /// Appends a batch of response transformers.
    pub fn with_transforms(mut self, transforms: impl IntoIterator<Item = Transformer>) -> Self {
        self.transforms.extend(transforms);
        self
    }

    /// Decodes the (transformed) body with `decoder`; the payload lands
    /// in [`Response::data`](super::Response::data).
    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.expect = Expect::Decode(decoder);
        self
    }

    /// Copies the (transformed) body into `writer` instead of decoding.
    pub fn with_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.expect = Expect::Write(Arc::new(Mutex::new(Box::new(writer))));
        self
    }

    /// Sets the action taken on the response status/headers before any
    /// body processing.
    pub fn on_response_header(
        mut self,
        action: impl Fn(StatusCode, &HeaderMap) -> EndpointAction + Send + Sync + 'static,
    ) -> Self {
        self.on_response_header = Some(Arc::new(action));
        self
    }

    /// Sets the action taken when the request is canceled or times out.
    /// Without one, cancellation neither retries nor fails over.
    pub fn on_ctx_canceled(
        mut self,
        action: impl Fn() -> EndpointAction + Send + Sync + 'static,
    ) -> Self {
        self.on_canceled = Some(Arc::new(action));
        self
    }

    /// Bounds each attempt by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Ties the request to `token`; a fired token aborts the attempt.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Builds the wire request for one attempt. The body is a cheap
    /// `Bytes` clone, so attempts do not consume the request.
    pub(super) fn to_http(&self) -> http::Request<Bytes> {
        let mut request = http::Request::new(self.body.clone());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("transforms", &self.transforms.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_status_5xx_judges_like_next_upstream() {
        let headers = HeaderMap::new();
        assert_eq!(
            on_status_5xx(StatusCode::BAD_GATEWAY, &headers),
            EndpointAction::Retrying
        );
        assert_eq!(
            on_status_5xx(StatusCode::INTERNAL_SERVER_ERROR, &headers),
            EndpointAction::NextEndpoint
        );
        assert_eq!(
            on_status_5xx(StatusCode::SERVICE_UNAVAILABLE, &headers),
            EndpointAction::NextEndpoint
        );
        assert_eq!(
            on_status_5xx(StatusCode::OK, &headers),
            EndpointAction::None
        );
        assert_eq!(
            on_status_5xx(StatusCode::NOT_FOUND, &headers),
            EndpointAction::None
        );
    }

    #[test]
    fn json_decoder_produces_typed_payload() {
        let decoder = json_decoder::<std::collections::HashMap<String, String>>();
        let body = Bytes::from_static(br#"{"a": "B", "c": "D"}"#);
        let payload = decoder(&body).unwrap();
        let map = payload
            .downcast_ref::<std::collections::HashMap<String, String>>()
            .unwrap();
        assert_eq!(map["a"], "B");
        assert_eq!(map["c"], "D");
    }

    #[test]
    fn json_decoder_surfaces_errors() {
        let decoder = json_decoder::<Vec<u32>>();
        assert!(decoder(&Bytes::from_static(b"not json")).is_err());
    }

    #[test]
    fn to_http_round_trips_the_parts() {
        let request = Request::post("/things", "payload").unwrap();
        let wire = request.to_http();
        assert_eq!(wire.method(), Method::POST);
        assert_eq!(wire.uri().path(), "/things");
        assert_eq!(wire.body().as_ref(), b"payload");

        // Attempts do not consume the request.
        let again = request.to_http();
        assert_eq!(again.body().as_ref(), b"payload");
    }
}
