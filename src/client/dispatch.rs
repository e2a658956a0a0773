//! Load-balanced request dispatcher.
//!
//! One `dispatch` call walks the installed endpoint set: the balancer
//! picks a starting endpoint, the endpoint's circuit breaker gates the
//! attempt, and the categorized outcome decides what happens next:
//! keep the result, retry the same endpoint under the backoff, or fail
//! over to the next endpoint. Retries stay on one endpoint; moving on
//! resets the retry budget. Errors seen along the way are accumulated
//! into the final failure.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use http::Uri;
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};

use crate::backoff::{Backoff, BackoffBuilder, BackoffError};
use crate::breaker::{CircuitBreakerConfig, ConfigError};

use super::balancer::BalancerKind;
use super::endpoint::{Endpoint, Endpoints};
use super::error::ClientError;
use super::health::HealthChecker;
use super::request::{EndpointAction, Expect, Request};
use super::resolver::{Installer, LbSlot, Resolve, ResolverChain};
use super::response::Response;
use super::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

/// Client construction failed.
#[derive(Debug, Snafu)]
pub enum ClientBuildError {
    /// Neither seed endpoints nor resolvers were provided.
    #[snafu(display("either seed endpoints or at least one resolver is required"))]
    NoEndpointsConfigured,

    /// The per-endpoint circuit breaker settings are invalid.
    #[snafu(display("invalid circuit breaker settings: {source}"))]
    InvalidBreaker { source: ConfigError },

    /// The retry backoff could not be built.
    #[snafu(display("invalid backoff: {source}"))]
    InvalidBackoff { source: BackoffError },
}

/// Client settings.
///
/// Everything has a default: round-robin balancing, the stock breaker
/// per endpoint, a 500ms/100ms health checker, and an exponential
/// backoff (50ms to 5s, multiplier 1.15, 10% jitter, 3 attempts).
#[derive(Builder)]
pub struct ClientConfig {
    /// How long `connect` waits for the resolver chain to produce the
    /// first endpoint set.
    #[builder(default = Duration::from_secs(5))]
    pub initialization_timeout: Duration,

    /// Discovery stages prepended to the health checker and installer,
    /// run in the order given.
    #[builder(default)]
    pub resolvers: Vec<Box<dyn Resolve>>,

    /// Interval between endpoint health checks.
    #[builder(default = HealthChecker::DEFAULT_INTERVAL)]
    pub health_check_interval: Duration,

    /// TCP dial timeout per health check.
    #[builder(default = HealthChecker::DEFAULT_TIMEOUT)]
    pub health_check_timeout: Duration,

    /// Which balancer the installer builds.
    #[builder(default)]
    pub balancer: BalancerKind,

    /// Circuit breaker settings applied to every installed endpoint.
    #[builder(default)]
    pub breaker: CircuitBreakerConfig,

    /// Retry backoff consulted on `Retrying` actions.
    pub backoff: Option<Arc<dyn Backoff>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_backoff() -> Result<Arc<dyn Backoff>, BackoffError> {
    BackoffBuilder::new()
        .base_spec("exponential=50:5000:1.15")
        .with_jitter(0.1)
        .with_limit(3)
        .build()
}

/// A resilient, load-balanced HTTP client.
///
/// Generic over the transport service so tests can substitute a
/// scripted one; production uses the `reqwest`-backed [`HttpTransport`].
pub struct Client<S = HttpTransport> {
    transport: S,
    slot: Arc<LbSlot>,
    chain: ResolverChain,
    backoff: Arc<dyn Backoff>,
}

impl Client<HttpTransport> {
    /// Builds a client over the default HTTP transport, starts the
    /// resolver chain, seeds it with `endpoints`, and waits up to the
    /// initialization timeout for the first resolution.
    pub async fn connect(
        config: ClientConfig,
        endpoints: Endpoints,
    ) -> Result<Self, ClientBuildError> {
        Self::with_transport(config, endpoints, HttpTransport::new()).await
    }
}

impl<S> Client<S>
where
    S: Service<HttpRequest, Response = HttpResponse> + Clone + Send + Sync + 'static,
    S::Error: Into<TransportError> + Send,
    S::Future: Send,
{
    /// Builds a client over a custom transport service.
    pub async fn with_transport(
        mut config: ClientConfig,
        endpoints: Endpoints,
        transport: S,
    ) -> Result<Self, ClientBuildError> {
        if endpoints.is_empty() && config.resolvers.is_empty() {
            return NoEndpointsConfiguredSnafu.fail();
        }
        config.breaker.validate().context(InvalidBreakerSnafu)?;
        let backoff = match config.backoff.take() {
            Some(backoff) => backoff,
            None => default_backoff().context(InvalidBackoffSnafu)?,
        };

        let slot = Arc::new(LbSlot::new());
        let mut resolvers = config.resolvers;
        resolvers.push(Box::new(HealthChecker::new(
            config.health_check_interval,
            config.health_check_timeout,
        )));
        resolvers.push(Box::new(Installer::new(
            Arc::clone(&slot),
            config.breaker.clone(),
            config.balancer,
        )));
        let chain = ResolverChain::new(resolvers);

        if !endpoints.is_empty() {
            chain.push(endpoints).await;
        }
        if !chain.wait(config.initialization_timeout).await {
            warn!(
                timeout = ?config.initialization_timeout,
                "no endpoints resolved within the initialization timeout; \
                 requests fail with NoEndpoints until resolution succeeds"
            );
        }

        Ok(Self {
            transport,
            slot,
            chain,
            backoff,
        })
    }

    /// Waits until the resolver chain has installed endpoints at least
    /// once, or `timeout` elapses.
    pub async fn ready(&self, timeout: Duration) -> bool {
        self.chain.wait(timeout).await
    }

    /// Feeds a new endpoint set into the resolver chain, as an external
    /// discovery source would. Returns whether the chain accepted it.
    pub async fn push_endpoints(&self, endpoints: Endpoints) -> bool {
        self.chain.push(endpoints).await
    }

    /// Shuts down the resolver chain and its health-check workers.
    pub async fn close(&self) {
        self.chain.close().await;
    }

    /// Dispatches a request: pick an endpoint, gate on its breaker,
    /// execute, then retry or fail over as the outcome dictates.
    pub async fn dispatch(&self, mut request: Request) -> Response {
        let mut response = Response::default();

        let state = self.slot.state.load();
        if state.endpoints.is_empty() {
            response.set_error(ClientError::NoEndpoints);
            return response;
        }

        let picked = state.balancer.pick();
        let need = self
            .instrument(&state.endpoints[picked], &mut request, &mut response)
            .await;
        if need != EndpointAction::None {
            self.judge(need, &state.endpoints, picked, &mut request, &mut response)
                .await;
        }
        response
    }

    /// Retry/failover loop after a non-`None` first outcome.
    async fn judge(
        &self,
        mut need: EndpointAction,
        endpoints: &Endpoints,
        picked: usize,
        request: &mut Request,
        response: &mut Response,
    ) {
        let n = endpoints.len();
        let mut index = picked;
        let mut retry_count: u32 = 0;
        let mut accumulated: Vec<ClientError> = Vec::new();

        loop {
            match need {
                EndpointAction::None => return,
                EndpointAction::Retrying => {
                    retry_count += 1;
                    let delay = self.backoff.next_delay_millis(retry_count);
                    if delay >= 0 {
                        if delay > 0 {
                            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                        }
                        debug!(
                            authority = %endpoints[index].authority(),
                            retry = retry_count,
                            delay_ms = delay,
                            "retrying request on the same endpoint"
                        );
                        response.reset();
                        need = self
                            .instrument(&endpoints[index], request, response)
                            .await;
                    } else {
                        if response.error().is_none() {
                            response.set_error(ClientError::RetryExhausted {
                                authority: endpoints[index].authority(),
                                attempts: retry_count,
                            });
                        }
                        return;
                    }
                }
                EndpointAction::NextEndpoint => {
                    retry_count = 0;
                    index = (index + 1) % n;
                    if let Some(error) = response.take_error() {
                        accumulated.push(error);
                    }
                    if index != picked {
                        debug!(
                            authority = %endpoints[index].authority(),
                            "failing over to the next endpoint"
                        );
                        response.reset();
                        need = self
                            .instrument(&endpoints[index], request, response)
                            .await;
                    } else {
                        // Looped over every endpoint without success.
                        let detail = if accumulated.is_empty() {
                            String::from(" or every circuit breaker is open")
                        } else {
                            let summary: Vec<String> =
                                accumulated.iter().map(ToString::to_string).collect();
                            format!("; last errors: [{}]", summary.join("; "))
                        };
                        response.reset();
                        response.set_error(ClientError::EndpointsUnavailable { detail });
                        return;
                    }
                }
            }
        }
    }

    /// One gated attempt against `endpoint`: breaker check, URL splice,
    /// execution, URL revert.
    async fn instrument(
        &self,
        endpoint: &Endpoint,
        request: &mut Request,
        response: &mut Response,
    ) -> EndpointAction {
        if !endpoint.can_request() {
            debug!(
                authority = %endpoint.authority(),
                "circuit breaker refused the request"
            );
            return EndpointAction::NextEndpoint;
        }
        let original = match inject_target(endpoint, request) {
            Ok(original) => original,
            Err(error) => {
                response.set_error(ClientError::Connection {
                    authority: endpoint.authority(),
                    source: TransportError::InvalidRequest {
                        details: error.to_string(),
                    },
                });
                return EndpointAction::NextEndpoint;
            }
        };
        let action = self.exec(endpoint, request, response).await;
        request.uri = original;
        action
    }

    /// Executes one wire exchange and categorizes the outcome.
    async fn exec(
        &self,
        endpoint: &Endpoint,
        request: &Request,
        response: &mut Response,
    ) -> EndpointAction {
        let authority = endpoint.authority();
        let outcome = call_transport(
            self.transport.clone(),
            request.to_http(),
            request.timeout,
            request.cancel.as_ref(),
        )
        .await;

        match outcome {
            Ok(raw) => {
                // The exchange completed; the breaker judges
                // connectivity, not status codes.
                endpoint.on_success();

                if let Some(judge) = &request.on_response_header {
                    let action = judge(raw.status(), raw.headers());
                    if action != EndpointAction::None {
                        return action;
                    }
                }

                let mut current = raw;
                for transform in &request.transforms {
                    match transform(current) {
                        Ok(next) => current = next,
                        Err(source) => {
                            response.set_error(ClientError::Transform { authority, source });
                            return EndpointAction::None;
                        }
                    }
                }

                match &request.expect {
                    Expect::Ignore => {}
                    Expect::Decode(decoder) => match decoder(current.body()) {
                        Ok(data) => response.set_data(data),
                        Err(source) => {
                            response.set_error(ClientError::Decoding {
                                authority: authority.clone(),
                                source,
                            });
                        }
                    },
                    Expect::Write(writer) => {
                        let result = writer
                            .lock()
                            .map_err(|_| "writer sink poisoned".into())
                            .and_then(|mut sink| {
                                sink.write_all(current.body()).map_err(crate::Error::from)
                            });
                        if let Err(source) = result {
                            response.set_error(ClientError::Decoding {
                                authority: authority.clone(),
                                source,
                            });
                        }
                    }
                }
                response.set_raw(current);
                EndpointAction::None
            }
            Err(error) if error.is_cancellation() => {
                response.set_error(ClientError::RequestCtxCanceledOrTimeout {
                    authority,
                    source: error,
                });
                match &request.on_canceled {
                    Some(action) => action(),
                    None => EndpointAction::None,
                }
            }
            Err(error) => {
                endpoint.on_failure();
                warn!(
                    authority = %endpoint.authority(),
                    %error,
                    "transport failure; trying the next endpoint"
                );
                response.set_error(ClientError::Connection {
                    authority,
                    source: error,
                });
                EndpointAction::NextEndpoint
            }
        }
    }
}

impl<S> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// Runs the wire exchange under the request's deadline and token.
async fn call_transport<S>(
    transport: S,
    request: HttpRequest,
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> Result<HttpResponse, TransportError>
where
    S: Service<HttpRequest, Response = HttpResponse> + Send + 'static,
    S::Error: Into<TransportError> + Send,
    S::Future: Send,
{
    if let Some(token) = cancel {
        if token.is_cancelled() {
            return Err(TransportError::Canceled);
        }
    }

    let exchange = async move {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, transport.oneshot(request)).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(TransportError::Timeout),
            },
            None => transport.oneshot(request).await.map_err(Into::into),
        }
    };

    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(TransportError::Canceled),
            result = exchange => result,
        },
        None => exchange.await,
    }
}

/// Points the request at `endpoint`, returning the original URI for the
/// revert after the attempt.
fn inject_target(endpoint: &Endpoint, request: &mut Request) -> Result<Uri, http::Error> {
    let original = request.uri.clone();
    let path = join_paths(endpoint.url().path(), original.path());
    let path_and_query = match original.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let uri = Uri::builder()
        .scheme(endpoint.url().scheme())
        .authority(endpoint.authority())
        .path_and_query(path_and_query)
        .build()?;
    request.uri = uri;
    Ok(original)
}

/// Joins the endpoint's path prefix with the request path.
fn join_paths(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    if prefix.is_empty() {
        if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        }
    } else if path == "/" {
        prefix.to_owned()
    } else if path.starts_with('/') {
        format!("{prefix}{path}")
    } else {
        format!("{prefix}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::endpoint::endpoints_from_urls;

    #[test]
    fn join_paths_handles_prefixes() {
        assert_eq!(join_paths("/", "/v1/x"), "/v1/x");
        assert_eq!(join_paths("", "/v1/x"), "/v1/x");
        assert_eq!(join_paths("/api", "/v1/x"), "/api/v1/x");
        assert_eq!(join_paths("/api/", "/v1/x"), "/api/v1/x");
        assert_eq!(join_paths("/api", "/"), "/api");
        assert_eq!(join_paths("", ""), "/");
        assert_eq!(join_paths("/api", "v1"), "/api/v1");
    }

    #[test]
    fn inject_and_revert_round_trip() {
        let endpoints = endpoints_from_urls(["https://api.example.com:8443/base"]).unwrap();
        let mut request = Request::get("/v1/items?page=2").unwrap();

        let original = inject_target(&endpoints[0], &mut request).unwrap();
        assert_eq!(
            request.uri.to_string(),
            "https://api.example.com:8443/base/v1/items?page=2"
        );

        request.uri = original;
        assert_eq!(request.uri.to_string(), "/v1/items?page=2");
    }
}
