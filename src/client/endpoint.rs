//! Endpoint parsing and health dialing.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::net::TcpStream;
use url::Url;

use crate::breaker::CircuitBreaker;

/// Endpoint metadata supplied alongside the URL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMetadata {
    /// Relative weight; reserved for weighted balancers.
    #[serde(default)]
    pub weight: u32,
}

/// A raw endpoint as it appears in configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEndpoint {
    /// Endpoint URL, e.g. `https://api.example.com/v1`.
    pub url: String,
    /// Metadata attached to the endpoint.
    #[serde(default, rename = "meta")]
    pub metadata: EndpointMetadata,
}

/// An endpoint failed to parse.
#[derive(Debug, Snafu)]
pub enum EndpointError {
    /// The URL did not parse.
    #[snafu(display("invalid endpoint url {url:?}: {source}"))]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    /// The scheme maps to no known default port.
    #[snafu(display("unsupported endpoint scheme {scheme:?}"))]
    UnsupportedScheme { scheme: String },

    /// The URL carries no host.
    #[snafu(display("endpoint url {url:?} has no host"))]
    MissingHost { url: String },
}

/// Default port for a scheme the client understands.
fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "ftp" => Some(21),
        "ssh" => Some(22),
        "ftps" => Some(990),
        _ => None,
    }
}

/// A resolved endpoint: URL, metadata, and (once installed) its own
/// circuit breaker.
#[derive(Clone, Debug)]
pub struct Endpoint {
    url: Url,
    port: u16,
    metadata: EndpointMetadata,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl Endpoint {
    /// Parses a raw endpoint, resolving the default port from the
    /// scheme.
    pub fn parse(raw: &RawEndpoint) -> Result<Self, EndpointError> {
        let url = Url::parse(&raw.url).context(InvalidUrlSnafu { url: &raw.url })?;
        if url.host_str().is_none() {
            return MissingHostSnafu { url: &raw.url }.fail();
        }
        let Some(fallback) = default_port(url.scheme()) else {
            return UnsupportedSchemeSnafu {
                scheme: url.scheme(),
            }
            .fail();
        };
        let port = url.port().unwrap_or(fallback);
        Ok(Self {
            url,
            port,
            metadata: raw.metadata,
            breaker: None,
        })
    }

    /// The parsed URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The resolved port (explicit, or the scheme default).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Endpoint metadata.
    pub fn metadata(&self) -> EndpointMetadata {
        self.metadata
    }

    /// `host:port`, as used for dialing and request targeting.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.url.host_str().unwrap_or_default(), self.port)
    }

    /// The circuit breaker attached by the installer, if any.
    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub(crate) fn attach_breaker(&mut self, breaker: Arc<CircuitBreaker>) {
        self.breaker = Some(breaker);
    }

    pub(crate) fn can_request(&self) -> bool {
        self.breaker.as_ref().map_or(true, |b| b.can_request())
    }

    pub(crate) fn on_success(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.on_success();
        }
    }

    pub(crate) fn on_failure(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.on_failure();
        }
    }

    /// Dials the endpoint's TCP host, bounding the attempt by `timeout`
    /// when it is non-zero. Returns whether the connection succeeded.
    pub async fn dial(&self, timeout: Duration) -> bool {
        let host = match self.url.host_str() {
            Some(host) => host.to_owned(),
            None => return false,
        };
        let connect = TcpStream::connect((host, self.port));
        if timeout.is_zero() {
            connect.await.is_ok()
        } else {
            matches!(tokio::time::timeout(timeout, connect).await, Ok(Ok(_)))
        }
    }
}

/// Deep equality over the addressable identity: scheme, host, port,
/// userinfo, and metadata. The attached breaker is ignored.
impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.url.scheme() == other.url.scheme()
            && self.url.host_str() == other.url.host_str()
            && self.port == other.port
            && self.url.username() == other.url.username()
            && self.url.password() == other.url.password()
            && self.metadata == other.metadata
    }
}

impl Eq for Endpoint {}

/// An ordered collection of endpoints.
pub type Endpoints = Vec<Endpoint>;

/// Parses a batch of raw endpoints.
pub fn parse_endpoints(raws: &[RawEndpoint]) -> Result<Endpoints, EndpointError> {
    raws.iter().map(Endpoint::parse).collect()
}

/// Parses endpoints from bare URLs with default metadata.
pub fn endpoints_from_urls<I, S>(urls: I) -> Result<Endpoints, EndpointError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    urls.into_iter()
        .map(|url| {
            Endpoint::parse(&RawEndpoint {
                url: url.as_ref().to_owned(),
                metadata: EndpointMetadata::default(),
            })
        })
        .collect()
}
