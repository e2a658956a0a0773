//! Dispatcher error categories.

use snafu::Snafu;

use super::transport::TransportError;

/// Why a dispatched request failed.
///
/// Connection-class failures trigger failover inside the dispatcher;
/// decoding and transform failures indicate a successful exchange whose
/// payload could not be processed and are surfaced without failover.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum ClientError {
    /// The resolver chain has not produced any endpoint yet.
    #[snafu(display("no endpoints available"))]
    NoEndpoints,

    /// Every endpoint was tried without success.
    #[snafu(display("all endpoints are unavailable{detail}"))]
    EndpointsUnavailable { detail: String },

    /// The exchange with `authority` failed at the transport level.
    #[snafu(display("connection to {authority} failed: {source}"))]
    Connection {
        authority: String,
        source: TransportError,
    },

    /// The response body from `authority` failed to decode.
    #[snafu(display("decoding response from {authority} failed: {source}"))]
    Decoding {
        authority: String,
        source: crate::Error,
    },

    /// A transformer rejected the response from `authority`.
    #[snafu(display("transforming response from {authority} failed: {source}"))]
    Transform {
        authority: String,
        source: crate::Error,
    },

    /// The request's token fired or its deadline passed.
    #[snafu(display("request to {authority} canceled or timed out: {source}"))]
    RequestCtxCanceledOrTimeout {
        authority: String,
        source: TransportError,
    },

    /// The per-endpoint retry budget ran out.
    #[snafu(display("retried {authority} {attempts} times without success"))]
    RetryExhausted { authority: String, attempts: u32 },
}

impl ClientError {
    /// Whether this is a transport-level connection failure.
    pub fn is_connection(&self) -> bool {
        matches!(self, ClientError::Connection { .. })
    }

    /// Whether this is a body-decoding failure.
    pub fn is_decoding(&self) -> bool {
        matches!(self, ClientError::Decoding { .. })
    }

    /// Whether this is a transformer failure.
    pub fn is_transform(&self) -> bool {
        matches!(self, ClientError::Transform { .. })
    }

    /// Whether the request was canceled or timed out.
    pub fn is_canceled_or_timeout(&self) -> bool {
        matches!(self, ClientError::RequestCtxCanceledOrTimeout { .. })
    }
}
