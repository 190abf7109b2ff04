//! Constant-arrival-rate executor.
//!
//! Iterations are started at a fixed rate, independent of how long each iteration takes.
//! The `i`-th arrival is scheduled `i * time_unit / rate` after the executor started. At
//! each arrival a free [`VirtualUser`] is taken from the pool; if none is free a new one is
//! allocated, up to `max_vus`. An arrival that finds no free virtual user once `max_vus`
//! are allocated is dropped.
//!
//! Each iteration runs on its own Tokio task. An iteration that fails or panics is
//! counted as failed, and its virtual user returns to the pool.
//!
//! Arrivals stop when the duration expires, when the optional iteration limit is
//! reached, or on ctrl-c. Iterations still running then get `graceful_stop` to finish,
//! after which they're aborted and counted as interrupted.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use crate::client::HttpClient;
use crate::config::LoadTestConfiguration;
use crate::metrics::LoadTestMetric;
use crate::scenario::{Scenario, VirtualUser};
use crate::util;

/// Counters collected by the executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorSummary {
    /// Iterations started.
    pub started: usize,
    /// Iterations that succeeded.
    pub completed: usize,
    /// Iterations that returned an error or panicked.
    pub failed: usize,
    /// Arrivals without a free virtual user.
    pub dropped: usize,
    /// Iterations aborted after the graceful stop expired.
    pub interrupted: usize,
    /// Virtual users allocated.
    pub vus_allocated: usize,
}

/// Starts iterations at a constant rate.
#[derive(Debug, Clone)]
pub struct ConstantArrivalRate {
    /// Iterations started per `time_unit`.
    pub rate: usize,
    pub time_unit: time::Duration,
    /// How long iterations are started for.
    pub duration: time::Duration,
    pub pre_allocated_vus: usize,
    pub max_vus: usize,
    /// Optionally stop after starting this many iterations.
    pub iterations: Option<usize>,
    /// How long in-flight iterations may run after the last arrival.
    pub graceful_stop: time::Duration,
}
impl ConstantArrivalRate {
    pub fn from_configuration(configuration: &LoadTestConfiguration) -> Self {
        ConstantArrivalRate {
            rate: configuration.rate(),
            time_unit: configuration.rate_period(),
            duration: configuration.run_time(),
            pre_allocated_vus: configuration.pre_allocated_vus(),
            max_vus: configuration.max_vus(),
            iterations: configuration.iterations,
            graceful_stop: configuration.graceful_stop_time(),
        }
    }

    /// When the given arrival is due, relative to the start of the executor.
    fn arrival_offset(&self, arrival: usize) -> time::Duration {
        self.time_unit
            .mul_f64(arrival as f64 / self.rate as f64)
    }

    /// Start iterations until the duration expires, then wait for in-flight iterations.
    pub async fn run<S: Scenario>(
        &self,
        scenario: Arc<S>,
        context: Arc<S::Context>,
        client: Arc<dyn HttpClient>,
        metrics: Option<flume::Sender<LoadTestMetric>>,
    ) -> ExecutorSummary {
        let mut summary = ExecutorSummary::default();
        if self.rate == 0 {
            warn!("rate is 0, no iterations started");
            return summary;
        }

        // Idle virtual users wait in this channel.
        let (idle_tx, idle_rx) = flume::unbounded::<VirtualUser>();
        for id in 1..=self.pre_allocated_vus {
            let _ = idle_tx.send(VirtualUser::new(id, client.clone(), metrics.clone()));
        }
        summary.vus_allocated = self.pre_allocated_vus;

        info!(
            "{}: starting {} iterations per {:?} for {:?} ({} pre-allocated VUs, {} max VUs)...",
            scenario.name(),
            self.rate,
            self.time_unit,
            self.duration,
            self.pre_allocated_vus,
            self.max_vus
        );

        let mut tasks: JoinSet<bool> = JoinSet::new();
        let started = Instant::now();
        let mut arrival: usize = 0;
        loop {
            let offset = self.arrival_offset(arrival);
            if offset >= self.duration {
                debug!("duration expired after {} arrivals", arrival);
                break;
            }
            if let Some(limit) = self.iterations {
                if summary.started >= limit {
                    info!("started {} iterations, stopping", limit);
                    break;
                }
            }

            // Late arrivals fire immediately.
            tokio::time::sleep_until(started + offset).await;
            if util::canceled() {
                info!("canceled, no more iterations will start");
                break;
            }
            arrival += 1;

            // Reap finished iterations.
            while let Some(result) = tasks.try_join_next() {
                reap(&mut summary, result);
            }

            let user = match idle_rx.try_recv() {
                Ok(user) => user,
                Err(_) if summary.vus_allocated < self.max_vus => {
                    summary.vus_allocated += 1;
                    debug!(
                        "no free VU, allocating VU {} of {}",
                        summary.vus_allocated, self.max_vus
                    );
                    VirtualUser::new(summary.vus_allocated, client.clone(), metrics.clone())
                }
                Err(_) => {
                    summary.dropped += 1;
                    if summary.dropped == 1 {
                        warn!(
                            "all {} VUs are busy, dropping iterations",
                            summary.vus_allocated
                        );
                    }
                    continue;
                }
            };

            summary.started += 1;
            tasks.spawn(run_iteration(
                scenario.clone(),
                context.clone(),
                user,
                idle_tx.clone(),
            ));
        }

        // Give in-flight iterations time to finish.
        if !tasks.is_empty() {
            info!(
                "waiting up to {:?} for {} running iterations...",
                self.graceful_stop,
                tasks.len()
            );
        }
        let deadline = Instant::now() + self.graceful_stop;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(result)) => reap(&mut summary, result),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "graceful stop expired, interrupting {} iterations",
                        tasks.len()
                    );
                    tasks.abort_all();
                    while let Some(result) = tasks.join_next().await {
                        reap(&mut summary, result);
                    }
                    break;
                }
            }
        }

        info!(
            "{}: {} iterations started, {} completed, {} failed, {} dropped, {} interrupted",
            scenario.name(),
            summary.started,
            summary.completed,
            summary.failed,
            summary.dropped,
            summary.interrupted
        );
        summary
    }
}

/// Run one iteration, then return the virtual user to the pool.
///
/// Returns `true` if the iteration succeeded.
async fn run_iteration<S: Scenario>(
    scenario: Arc<S>,
    context: Arc<S::Context>,
    mut user: VirtualUser,
    idle: flume::Sender<VirtualUser>,
) -> bool {
    let started = time::Instant::now();
    let result = AssertUnwindSafe(scenario.iteration(&context, &user))
        .catch_unwind()
        .await;
    let error = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            debug!("[VU {}] iteration {} failed: {}", user.id, user.iteration, e);
            Some(e.to_string())
        }
        Err(_) => {
            error!("[VU {}] iteration {} panicked", user.id, user.iteration);
            Some("iteration panicked".to_string())
        }
    };
    let success = error.is_none();
    user.finish_iteration(started, error);
    let _ = idle.send(user);
    success
}

fn reap(summary: &mut ExecutorSummary, result: Result<bool, JoinError>) {
    match result {
        Ok(true) => summary.completed += 1,
        Ok(false) => summary.failed += 1,
        Err(e) if e.is_cancelled() => summary.interrupted += 1,
        Err(e) => {
            warn!("iteration task failed: {}", e);
            summary.failed += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{HttpRequest, HttpResponse};
    use crate::scenario::{IterationError, IterationResult};
    use crate::LoadTestError;
    use async_trait::async_trait;

    struct NoClient;

    #[async_trait]
    impl HttpClient for NoClient {
        async fn send(&self, request: HttpRequest) -> HttpResponse {
            HttpResponse {
                url: request.url,
                status: 200,
                ..Default::default()
            }
        }
    }

    /// Sleeps, and optionally fails or panics on a VU's first iteration.
    struct Sleeper {
        sleep: time::Duration,
        fail_first: bool,
        panic_first: bool,
    }

    #[async_trait]
    impl Scenario for Sleeper {
        type Context = ();

        fn name(&self) -> &str {
            "sleeper"
        }

        async fn setup(&self, _client: &dyn HttpClient) -> Result<(), LoadTestError> {
            Ok(())
        }

        async fn iteration(&self, _context: &(), user: &VirtualUser) -> IterationResult {
            if self.panic_first && user.iteration == 0 {
                panic!("first iteration");
            }
            tokio::time::sleep(self.sleep).await;
            if self.fail_first && user.iteration == 0 {
                return Err(IterationError::InvalidResponse {
                    url: "http://localhost/".to_string(),
                    detail: "first iteration".to_string(),
                });
            }
            Ok(())
        }
    }

    fn executor(rate: usize, duration_ms: u64, pre: usize, max: usize) -> ConstantArrivalRate {
        ConstantArrivalRate {
            rate,
            time_unit: time::Duration::from_secs(1),
            duration: time::Duration::from_millis(duration_ms),
            pre_allocated_vus: pre,
            max_vus: max,
            iterations: None,
            graceful_stop: time::Duration::from_secs(5),
        }
    }

    fn sleeper(sleep_ms: u64) -> Arc<Sleeper> {
        Arc::new(Sleeper {
            sleep: time::Duration::from_millis(sleep_ms),
            fail_first: false,
            panic_first: false,
        })
    }

    #[test]
    fn from_configuration() {
        let configuration = LoadTestConfiguration {
            rate: Some(50),
            duration: "1m".to_string(),
            time_unit: "2s".to_string(),
            graceful_stop: "10s".to_string(),
            ..Default::default()
        };
        let executor = ConstantArrivalRate::from_configuration(&configuration);
        assert_eq!(executor.rate, 50);
        assert_eq!(executor.duration, time::Duration::from_secs(60));
        assert_eq!(executor.pre_allocated_vus, 50);
        assert_eq!(executor.max_vus, 250);
        assert_eq!(executor.graceful_stop, time::Duration::from_secs(10));
        assert_eq!(executor.arrival_offset(0), time::Duration::from_secs(0));
        assert_eq!(executor.arrival_offset(25), time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn constant_rate() {
        let summary = executor(20, 1000, 5, 10)
            .run(sleeper(10), Arc::new(()), Arc::new(NoClient), None)
            .await;
        // Arrivals at 0, 50, ... 950ms.
        assert_eq!(summary.started, 20);
        assert_eq!(summary.completed, 20);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.dropped, 0);
        assert_eq!(summary.interrupted, 0);
        assert_eq!(summary.vus_allocated, 5);
    }

    #[tokio::test]
    async fn drops_without_free_vus() {
        // One VU busy for 250ms, arrivals every 100ms.
        let summary = executor(10, 1000, 1, 1)
            .run(sleeper(250), Arc::new(()), Arc::new(NoClient), None)
            .await;
        assert_eq!(summary.vus_allocated, 1);
        assert_eq!(summary.started + summary.dropped, 10);
        assert!(summary.dropped >= 4);
        assert_eq!(summary.completed, summary.started);
    }

    #[tokio::test]
    async fn allocates_up_to_max_vus() {
        let summary = executor(10, 500, 1, 3)
            .run(sleeper(2000), Arc::new(()), Arc::new(NoClient), None)
            .await;
        // 5 arrivals, never more than 3 VUs.
        assert_eq!(summary.vus_allocated, 3);
        assert_eq!(summary.started, 3);
        assert_eq!(summary.dropped, 2);
    }

    #[tokio::test]
    async fn iteration_limit() {
        let mut executor = executor(100, 10_000, 5, 5);
        executor.iterations = Some(3);
        let summary = executor
            .run(sleeper(1), Arc::new(()), Arc::new(NoClient), None)
            .await;
        assert_eq!(summary.started, 3);
        assert_eq!(summary.completed, 3);
    }

    #[tokio::test]
    async fn graceful_stop_interrupts() {
        let mut executor = executor(2, 1000, 2, 2);
        executor.graceful_stop = time::Duration::from_millis(100);
        let summary = executor
            .run(sleeper(10_000), Arc::new(()), Arc::new(NoClient), None)
            .await;
        assert_eq!(summary.started, 2);
        assert_eq!(summary.interrupted, 2);
        assert_eq!(summary.completed, 0);
    }

    #[tokio::test]
    async fn failures_are_contained() {
        let (tx, rx) = flume::unbounded();
        let scenario = Arc::new(Sleeper {
            sleep: time::Duration::from_millis(1),
            fail_first: true,
            panic_first: false,
        });
        let summary = executor(10, 1000, 1, 1)
            .run(scenario, Arc::new(()), Arc::new(NoClient), Some(tx))
            .await;
        assert_eq!(summary.started, 10);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 9);

        // Every iteration was recorded, the VU counter advanced after the failure.
        let iterations: Vec<usize> = rx
            .drain()
            .filter_map(|m| match m {
                LoadTestMetric::Iteration(i) => Some(i.iteration),
                _ => None,
            })
            .collect();
        assert_eq!(iterations, (0..10).collect::<Vec<usize>>());
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let scenario = Arc::new(Sleeper {
            sleep: time::Duration::from_millis(1),
            fail_first: false,
            panic_first: true,
        });
        let summary = executor(10, 1000, 1, 1)
            .run(scenario, Arc::new(()), Arc::new(NoClient), None)
            .await;
        // The VU returned to the pool after panicking.
        assert_eq!(summary.started, 10);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 9);
    }
}
