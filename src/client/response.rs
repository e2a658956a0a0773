//! Dispatcher responses.

use std::any::Any;

use http::StatusCode;

use super::error::ClientError;
use super::transport::HttpResponse;

/// The outcome of a dispatched request: the raw response (if an exchange
/// completed), the decoded payload (if a decoder ran), and the
/// categorized error (if anything failed).
#[derive(Default)]
pub struct Response {
    raw: Option<HttpResponse>,
    data: Option<Box<dyn Any + Send>>,
    error: Option<ClientError>,
}

impl Response {
    /// The raw HTTP response, after transformers. Absent when no
    /// exchange completed or a header action cut processing short.
    pub fn raw(&self) -> Option<&HttpResponse> {
        self.raw.as_ref()
    }

    /// Response status, when an exchange completed.
    pub fn status(&self) -> Option<StatusCode> {
        self.raw.as_ref().map(|r| r.status())
    }

    /// Borrows the decoded payload as `T`.
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data.as_ref()?.downcast_ref()
    }

    /// Takes the decoded payload as `T`.
    pub fn into_data<T: 'static>(self) -> Option<Box<T>> {
        self.data?.downcast().ok()
    }

    /// The categorized error, if the request failed.
    pub fn error(&self) -> Option<&ClientError> {
        self.error.as_ref()
    }

    /// Converts into a `Result`, surfacing the error if any.
    pub fn into_result(self) -> Result<Response, ClientError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }

    /// Whether the failure was a transport-level connection error.
    pub fn is_connection_error(&self) -> bool {
        self.error.as_ref().is_some_and(ClientError::is_connection)
    }

    /// Whether the failure was a body-decoding error.
    pub fn is_decoding_error(&self) -> bool {
        self.error.as_ref().is_some_and(ClientError::is_decoding)
    }

    /// Whether the failure was a transformer error.
    pub fn is_transform_error(&self) -> bool {
        self.error.as_ref().is_some_and(ClientError::is_transform)
    }

    /// Whether the request was canceled or timed out.
    pub fn is_canceled_or_timeout(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(ClientError::is_canceled_or_timeout)
    }

    pub(super) fn reset(&mut self) {
        self.raw = None;
        self.data = None;
        self.error = None;
    }

    pub(super) fn set_raw(&mut self, raw: HttpResponse) {
        self.raw = Some(raw);
    }

    pub(super) fn set_data(&mut self, data: Box<dyn Any + Send>) {
        self.data = Some(data);
    }

    pub(super) fn set_error(&mut self, error: ClientError) {
        self.error = Some(error);
    }

    pub(super) fn take_error(&mut self) -> Option<ClientError> {
        self.error.take()
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status())
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .finish()
    }
}
