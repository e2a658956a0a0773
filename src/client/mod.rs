//! Resilient, load-balanced HTTP client.
//!
//! The client strings together the crate's resilience components:
//!
//! 1. A [`Resolve`] chain discovers endpoint sets and pipes them through
//!    a TCP [`HealthChecker`] into the installer, which attaches a
//!    circuit breaker to every endpoint and publishes a fresh balancer.
//! 2. [`Client::dispatch`] picks an endpoint, gates the attempt on its
//!    breaker, splices the endpoint into the request URL, and executes
//!    it over the transport.
//! 3. The categorized outcome (plus the request's header and
//!    cancellation actions) decides between keeping the result, retrying
//!    the same endpoint under the configured backoff, and failing over
//!    to the next endpoint.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! use resilient_client::client::{
//!     endpoints_from_urls, json_decoder, on_status_5xx, Client, ClientConfig, Request,
//! };
//!
//! let endpoints = endpoints_from_urls(["http://10.0.0.1:8080", "http://10.0.0.2:8080"])?;
//! let client = Client::connect(ClientConfig::default(), endpoints).await?;
//!
//! let request = Request::get("/v1/status")?
//!     .on_response_header(on_status_5xx)
//!     .with_decoder(json_decoder::<serde_json::Value>());
//! let response = client.dispatch(request).await;
//! if let Some(status) = response.data::<serde_json::Value>() {
//!     println!("status: {status}");
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

mod balancer;
mod dispatch;
mod endpoint;
mod error;
mod health;
mod request;
mod resolver;
mod response;
mod transport;

pub use balancer::{Balance, BalancerKind, PickFirst, RoundRobin};
pub use dispatch::{Client, ClientBuildError, ClientConfig};
pub use endpoint::{
    endpoints_from_urls, parse_endpoints, Endpoint, EndpointError, EndpointMetadata, Endpoints,
    RawEndpoint,
};
pub use error::ClientError;
pub use health::HealthChecker;
pub use request::{
    json_decoder, on_status_5xx, CancelAction, Decoder, EndpointAction, HeaderAction, Request,
    Transformer,
};
pub use resolver::Resolve;
pub use response::Response;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
