//! Resolver chain: discovery stages wired by bounded pipes.
//!
//! A resolver consumes endpoint sets from its input channel and produces
//! refined sets on its output channel; stages run as independent tasks
//! connected by capacity-1 pipes. The chain terminates in the *installer*,
//! which rebuilds the load balancer, attaches a fresh circuit breaker to
//! every endpoint, and publishes the result for the dispatcher.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::sync::AtomicRef;

use super::balancer::{Balance, BalancerKind, PickFirst};
use super::endpoint::Endpoints;

/// A stage of the resolver chain.
///
/// `run` must consume `input` until it closes, pushing refined endpoint
/// sets into `output`; dropping `output` on return closes the next
/// stage's input.
pub trait Resolve: Send + 'static {
    /// Runs the stage to completion.
    fn run(
        self: Box<Self>,
        input: mpsc::Receiver<Endpoints>,
        output: mpsc::Sender<Endpoints>,
    ) -> BoxFuture<'static, ()>;
}

/// The endpoints and balancer the dispatcher currently works against.
pub(super) struct LbState {
    pub(super) endpoints: Endpoints,
    pub(super) balancer: Box<dyn Balance>,
}

impl LbState {
    fn empty() -> Self {
        Self {
            endpoints: Vec::new(),
            balancer: Box::new(PickFirst),
        }
    }
}

/// Shared slot holding the installed [`LbState`].
pub(super) struct LbSlot {
    pub(super) state: AtomicRef<LbState>,
    installed_once: AtomicBool,
}

impl LbSlot {
    pub(super) fn new() -> Self {
        Self {
            state: AtomicRef::new(Arc::new(LbState::empty())),
            installed_once: AtomicBool::new(false),
        }
    }
}

/// Terminal chain stage: builds breakers and the balancer, publishes the
/// new state when the endpoint set actually changed, and signals
/// readiness exactly once.
pub(super) struct Installer {
    slot: Arc<LbSlot>,
    breaker_config: CircuitBreakerConfig,
    kind: BalancerKind,
}

impl Installer {
    pub(super) fn new(
        slot: Arc<LbSlot>,
        breaker_config: CircuitBreakerConfig,
        kind: BalancerKind,
    ) -> Self {
        Self {
            slot,
            breaker_config,
            kind,
        }
    }
}

impl Resolve for Installer {
    fn run(
        self: Box<Self>,
        mut input: mpsc::Receiver<Endpoints>,
        output: mpsc::Sender<Endpoints>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            while let Some(endpoints) = input.recv().await {
                if endpoints.is_empty() {
                    continue;
                }
                let current = self.slot.state.load();
                if current.endpoints == endpoints {
                    continue;
                }

                let mut installed = endpoints;
                let mut built = true;
                for endpoint in &mut installed {
                    match CircuitBreaker::new(self.breaker_config.clone()) {
                        Ok(breaker) => endpoint.attach_breaker(Arc::new(breaker)),
                        Err(error) => {
                            // Config was validated at client build time;
                            // refuse the set rather than install half of it.
                            error!(%error, "failed to build endpoint circuit breaker");
                            built = false;
                            break;
                        }
                    }
                }
                if !built {
                    continue;
                }

                let balancer = self.kind.build(installed.len());
                info!(endpoints = installed.len(), "installing resolved endpoints");
                self.slot.state.store(Arc::new(LbState {
                    endpoints: installed,
                    balancer,
                }));

                if self
                    .slot
                    .installed_once
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    // First publication: signal chain readiness.
                    let _ = output.send(Vec::new()).await;
                }
            }
        })
    }
}

const WAIT_IDLE: u8 = 0;
const WAIT_IN_FLIGHT: u8 = 1;
const WAIT_READY: u8 = 2;

/// Runtime for a chain of resolvers.
pub(super) struct ResolverChain {
    first: tokio::sync::Mutex<Option<mpsc::Sender<Endpoints>>>,
    last: tokio::sync::Mutex<Option<mpsc::Receiver<Endpoints>>>,
    ready: AtomicU8,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ResolverChain {
    /// Wires `resolvers` with capacity-1 pipes and spawns each stage.
    pub(super) fn new(resolvers: Vec<Box<dyn Resolve>>) -> Self {
        let (first_tx, mut prev_rx) = mpsc::channel(1);
        let mut handles = Vec::with_capacity(resolvers.len());
        for resolver in resolvers {
            let (tx, rx) = mpsc::channel(1);
            handles.push(tokio::spawn(resolver.run(prev_rx, tx)));
            prev_rx = rx;
        }
        Self {
            first: tokio::sync::Mutex::new(Some(first_tx)),
            last: tokio::sync::Mutex::new(Some(prev_rx)),
            ready: AtomicU8::new(WAIT_IDLE),
            handles: std::sync::Mutex::new(handles),
        }
    }

    /// Feeds an endpoint set into the head of the chain. Returns whether
    /// the chain is still accepting input.
    pub(super) async fn push(&self, endpoints: Endpoints) -> bool {
        let guard = self.first.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(endpoints).await.is_ok(),
            None => false,
        }
    }

    /// Waits until the chain signals readiness or `timeout` elapses.
    ///
    /// One-shot latch: the first caller blocks on the chain's tail;
    /// concurrent and later callers observe the cached readiness. A
    /// timed-out wait re-arms the latch.
    pub(super) async fn wait(&self, timeout: Duration) -> bool {
        match self.ready.compare_exchange(
            WAIT_IDLE,
            WAIT_IN_FLIGHT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let mut guard = self.last.lock().await;
                let Some(rx) = guard.as_mut() else {
                    self.ready.store(WAIT_IDLE, Ordering::Release);
                    return false;
                };
                match tokio::time::timeout(timeout, rx.recv()).await {
                    Ok(Some(_)) => {
                        self.ready.store(WAIT_READY, Ordering::Release);
                        true
                    }
                    _ => {
                        self.ready.store(WAIT_IDLE, Ordering::Release);
                        false
                    }
                }
            }
            Err(observed) => observed == WAIT_READY,
        }
    }

    /// Closes the head of the chain and joins every stage.
    pub(super) async fn close(&self) {
        drop(self.first.lock().await.take());
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::endpoint::endpoints_from_urls;
    use futures::FutureExt;

    /// Forwards endpoint sets, tagging how many passed through.
    struct Passthrough {
        seen: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Resolve for Passthrough {
        fn run(
            self: Box<Self>,
            mut input: mpsc::Receiver<Endpoints>,
            output: mpsc::Sender<Endpoints>,
        ) -> BoxFuture<'static, ()> {
            async move {
                while let Some(endpoints) = input.recv().await {
                    self.seen.fetch_add(1, Ordering::Relaxed);
                    if output.send(endpoints).await.is_err() {
                        return;
                    }
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn chain_pipes_endpoint_sets_through_stages() {
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let slot = Arc::new(LbSlot::new());
        let chain = ResolverChain::new(vec![
            Box::new(Passthrough {
                seen: Arc::clone(&seen),
            }),
            Box::new(Installer::new(
                Arc::clone(&slot),
                CircuitBreakerConfig::default(),
                BalancerKind::PickFirst,
            )),
        ]);

        let endpoints = endpoints_from_urls(["http://a.example.com", "http://b.example.com"]).unwrap();
        assert!(chain.push(endpoints.clone()).await);
        assert!(chain.wait(Duration::from_secs(1)).await);

        assert_eq!(seen.load(Ordering::Relaxed), 1);
        let state = slot.state.load();
        assert_eq!(state.endpoints, endpoints);
        // The installer attached a breaker to every endpoint.
        assert!(state.endpoints.iter().all(|e| e.breaker().is_some()));

        chain.close().await;
    }

    #[tokio::test]
    async fn wait_times_out_and_rearms() {
        let slot = Arc::new(LbSlot::new());
        let chain = ResolverChain::new(vec![Box::new(Installer::new(
            Arc::clone(&slot),
            CircuitBreakerConfig::default(),
            BalancerKind::RoundRobin,
        ))]);

        // Nothing pushed: the first wait times out and re-arms.
        assert!(!chain.wait(Duration::from_millis(20)).await);

        let endpoints = endpoints_from_urls(["http://a.example.com"]).unwrap();
        assert!(chain.push(endpoints).await);
        assert!(chain.wait(Duration::from_secs(1)).await);
        // Cached readiness for later callers.
        assert!(chain.wait(Duration::from_millis(1)).await);

        chain.close().await;
    }

    #[tokio::test]
    async fn unchanged_endpoint_sets_do_not_reinstall() {
        let slot = Arc::new(LbSlot::new());
        let chain = ResolverChain::new(vec![Box::new(Installer::new(
            Arc::clone(&slot),
            CircuitBreakerConfig::default(),
            BalancerKind::PickFirst,
        ))]);

        let endpoints = endpoints_from_urls(["http://a.example.com"]).unwrap();
        chain.push(endpoints.clone()).await;
        assert!(chain.wait(Duration::from_secs(1)).await);
        let installed = slot.state.load();

        // The same set again: the installer must keep the state (and its
        // breakers, which hold accumulated counts) untouched.
        chain.push(endpoints.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(Arc::ptr_eq(&installed, &slot.state.load()));

        chain.close().await;
    }

    #[tokio::test]
    async fn push_after_close_reports_closed() {
        let slot = Arc::new(LbSlot::new());
        let chain = ResolverChain::new(vec![Box::new(Installer::new(
            Arc::clone(&slot),
            CircuitBreakerConfig::default(),
            BalancerKind::PickFirst,
        ))]);
        chain.close().await;
        let endpoints = endpoints_from_urls(["http://a.example.com"]).unwrap();
        assert!(!chain.push(endpoints).await);
    }
}
