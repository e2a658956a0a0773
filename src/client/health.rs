//! Health-checking resolver stage.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::pool::{PoolConfig, Task, TaskOutput, WorkerPool};

use super::endpoint::Endpoints;
use super::resolver::Resolve;

/// Filters endpoint sets down to the hosts that accept a TCP connection.
///
/// Checks run through a worker pool (one dial task per endpoint, fanned
/// in over a channel) whenever a new endpoint set arrives and on every
/// interval tick. Surviving endpoints are forwarded in their original
/// order; an all-dead check forwards nothing, keeping the last healthy
/// set installed downstream.
pub struct HealthChecker {
    interval: Duration,
    timeout: Duration,
    pool: WorkerPool,
}

impl HealthChecker {
    /// Default interval between checks.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
    /// Default dial timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

    /// Creates a checker dialing every `interval` with `timeout` per
    /// dial. A zero interval falls back to twice the timeout, or 200ms.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let interval = if interval.is_zero() {
            let fallback = timeout * 2;
            if fallback.is_zero() {
                Duration::from_millis(200)
            } else {
                fallback
            }
        } else {
            interval
        };
        Self {
            interval,
            timeout,
            pool: WorkerPool::new(PoolConfig::default()),
        }
    }

    /// Dials every endpoint through the pool and returns the live subset
    /// in input order.
    async fn check(&self, endpoints: &Endpoints) -> Endpoints {
        let (results_tx, mut results_rx) = mpsc::channel::<Option<usize>>(8);
        for (index, endpoint) in endpoints.iter().enumerate() {
            let endpoint = endpoint.clone();
            let results = results_tx.clone();
            let timeout = self.timeout;
            let (task, _outcome) = Task::new(move |_cancel| async move {
                let healthy = endpoint.dial(timeout).await;
                let _ = results.send(healthy.then_some(index)).await;
                Ok(Box::new(()) as TaskOutput)
            });
            self.pool.dispatch(task).await;
        }
        drop(results_tx);

        let mut alive = vec![false; endpoints.len()];
        while let Some(result) = results_rx.recv().await {
            if let Some(index) = result {
                alive[index] = true;
            }
        }
        endpoints
            .iter()
            .zip(alive)
            .filter_map(|(endpoint, ok)| ok.then(|| endpoint.clone()))
            .collect()
    }

    async fn check_and_forward(&self, endpoints: &Endpoints, output: &mpsc::Sender<Endpoints>) {
        if endpoints.is_empty() {
            return;
        }
        let alive = self.check(endpoints).await;
        if alive.len() < endpoints.len() {
            warn!(
                alive = alive.len(),
                total = endpoints.len(),
                "some endpoints failed their health check"
            );
        }
        if !alive.is_empty() {
            let _ = output.send(alive).await;
        }
    }
}

impl Resolve for HealthChecker {
    fn run(
        self: Box<Self>,
        mut input: mpsc::Receiver<Endpoints>,
        output: mpsc::Sender<Endpoints>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut endpoints: Endpoints = Vec::new();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    received = input.recv() => match received {
                        Some(set) => {
                            if !set.is_empty() {
                                endpoints = set;
                                self.check_and_forward(&endpoints, &output).await;
                            }
                        }
                        None => {
                            self.pool.stop().await;
                            return;
                        }
                    },
                    _ = ticker.tick() => {
                        self.check_and_forward(&endpoints, &output).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::endpoint::endpoints_from_urls;
    use tokio::net::TcpListener;

    async fn listening_endpoint() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        (listener, url)
    }

    #[tokio::test]
    async fn forwards_only_live_endpoints_in_order() {
        let (live_a, url_a) = listening_endpoint().await;
        let (dead, dead_url) = listening_endpoint().await;
        drop(dead);
        let (live_b, url_b) = listening_endpoint().await;

        let endpoints = endpoints_from_urls([&url_a, &dead_url, &url_b]).unwrap();
        let checker = HealthChecker::new(Duration::from_secs(60), Duration::from_millis(200));

        let alive = checker.check(&endpoints).await;
        assert_eq!(alive.len(), 2);
        assert_eq!(alive[0], endpoints[0]);
        assert_eq!(alive[1], endpoints[2]);

        checker.pool.stop().await;
        drop((live_a, live_b));
    }

    #[tokio::test]
    async fn all_dead_forwards_nothing() {
        let (dead, dead_url) = listening_endpoint().await;
        drop(dead);
        let endpoints = endpoints_from_urls([&dead_url]).unwrap();

        let checker = HealthChecker::new(Duration::from_secs(60), Duration::from_millis(100));
        let (out_tx, mut out_rx) = mpsc::channel(1);
        checker.check_and_forward(&endpoints, &out_tx).await;
        drop(out_tx);
        assert!(out_rx.recv().await.is_none());

        checker.pool.stop().await;
    }

    #[tokio::test]
    async fn rechecks_on_interval() {
        let (listener, url) = listening_endpoint().await;
        let endpoints = endpoints_from_urls([&url]).unwrap();

        let checker = HealthChecker::new(Duration::from_millis(50), Duration::from_millis(200));
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let handle = tokio::spawn(Box::new(checker).run(in_rx, out_tx));

        in_tx.send(endpoints.clone()).await.unwrap();
        // Arrival check plus at least one interval recheck.
        assert_eq!(out_rx.recv().await.unwrap(), endpoints);
        assert_eq!(out_rx.recv().await.unwrap(), endpoints);

        drop(in_tx);
        // Draining lets the stage finish its pending send, then exit.
        while out_rx.recv().await.is_some() {}
        handle.await.unwrap();
        drop(listener);
    }

    #[test]
    fn zero_interval_falls_back() {
        let checker = HealthChecker::new(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(checker.interval, Duration::from_millis(200));

        let checker = HealthChecker::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(checker.interval, Duration::from_millis(200));
    }
}
