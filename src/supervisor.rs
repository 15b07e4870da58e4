use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;

/// Upper bound on coordinated shutdown; whatever has not resolved by
/// then is abandoned with a warning.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a single registered health check.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub detail: Value,
}

impl HealthReport {
    pub fn healthy(detail: Value) -> Self {
        Self {
            healthy: true,
            detail,
        }
    }

    pub fn unhealthy(detail: Value) -> Self {
        Self {
            healthy: false,
            detail,
        }
    }
}

/// Aggregate shipped to the UI as the `health_status` event payload.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub healthy: bool,
    pub services: Vec<String>,
    pub checks: Value,
}

type CheckFn = Box<dyn Fn() -> BoxFuture<'static, HealthReport> + Send + Sync>;
type ShutdownFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type JobFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Job {
    name: String,
    period: Duration,
    run: JobFn,
}

/// Named registries of long-lived services, health checks and periodic
/// maintenance jobs, plus the coordinated-shutdown path.
#[derive(Default)]
pub struct Supervisor {
    services: Mutex<Vec<(String, ShutdownFn)>>,
    checks: Mutex<Vec<(String, std::sync::Arc<CheckFn>)>>,
    jobs: Mutex<Vec<Job>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a long-lived service's shutdown routine, invoked once
    /// during coordinated shutdown.
    pub fn register_service<F, Fut>(&self, name: &str, shutdown: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let routine: ShutdownFn = Box::new(move || {
            let fut: BoxFuture<'static, ()> = Box::pin(shutdown());
            fut
        });
        self.services
            .lock()
            .unwrap()
            .push((name.to_string(), routine));
    }

    pub fn register_health_check<F, Fut>(&self, name: &str, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HealthReport> + Send + 'static,
    {
        let check: CheckFn = Box::new(move || {
            let fut: BoxFuture<'static, HealthReport> = Box::pin(check());
            fut
        });
        self.checks
            .lock()
            .unwrap()
            .push((name.to_string(), std::sync::Arc::new(check)));
    }

    pub fn register_job<F, Fut>(&self, name: &str, period: Duration, run: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let run: JobFn = Box::new(move || {
            let fut: BoxFuture<'static, ()> = Box::pin(run());
            fut
        });
        self.jobs.lock().unwrap().push(Job {
            name: name.to_string(),
            period,
            run,
        });
    }

    /// Runs every registered check, isolating each so one panicking
    /// check cannot mask the others, and aggregates an overall boolean.
    pub async fn run_health_checks(&self) -> HealthSummary {
        let checks: Vec<_> = self
            .checks
            .lock()
            .unwrap()
            .iter()
            .map(|(name, f)| (name.clone(), f.clone()))
            .collect();

        let mut healthy = true;
        let mut services = Vec::with_capacity(checks.len());
        let mut detail = serde_json::Map::new();

        for (name, check) in checks {
            let report = match tokio::spawn(check()).await {
                Ok(report) => report,
                Err(e) => HealthReport::unhealthy(json!({ "panic": e.to_string() })),
            };
            healthy &= report.healthy;
            detail.insert(
                name.clone(),
                json!({ "healthy": report.healthy, "detail": report.detail }),
            );
            services.push(name);
        }

        HealthSummary {
            healthy,
            services,
            checks: Value::Object(detail),
        }
    }

    /// Spawns one timer task per registered job. Jobs stop when the
    /// shutdown flag flips.
    pub fn spawn_jobs(&self, shutdown: watch::Receiver<bool>) {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap());
        for job in jobs {
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(job.period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick fires immediately; skip it so jobs run
                // one full period after startup.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            info!(target: "Supervisor", "Running job '{}'", job.name);
                            (job.run)().await;
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    }

    /// Invokes every registered service's shutdown routine and waits
    /// for all of them, bounded by [`SHUTDOWN_TIMEOUT`].
    pub async fn shutdown(&self) {
        let services = std::mem::take(&mut *self.services.lock().unwrap());
        if services.is_empty() {
            return;
        }
        let names: Vec<String> = services.iter().map(|(n, _)| n.clone()).collect();
        info!(target: "Supervisor", "Shutting down services: {names:?}");

        let all = futures_util::future::join_all(
            services.into_iter().map(|(name, f)| async move {
                f().await;
                info!(target: "Supervisor", "Service '{name}' stopped");
            }),
        );
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, all).await.is_err() {
            warn!(target: "Supervisor", "Shutdown timed out after {SHUTDOWN_TIMEOUT:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn aggregates_check_results() {
        let sup = Supervisor::new();
        sup.register_health_check("store", || async {
            HealthReport::healthy(json!({ "chats": 3 }))
        });
        sup.register_health_check("connection", || async {
            HealthReport::unhealthy(json!({ "state": "closed" }))
        });

        let summary = sup.run_health_checks().await;
        assert!(!summary.healthy);
        assert_eq!(summary.services, vec!["store", "connection"]);
        assert_eq!(summary.checks["store"]["healthy"], true);
        assert_eq!(summary.checks["connection"]["healthy"], false);
    }

    #[tokio::test]
    async fn panicking_check_does_not_mask_others() {
        let sup = Supervisor::new();
        sup.register_health_check("broken", || async { panic!("boom") });
        sup.register_health_check("fine", || async { HealthReport::healthy(json!({})) });

        let summary = sup.run_health_checks().await;
        assert!(!summary.healthy);
        assert_eq!(summary.checks["fine"]["healthy"], true);
        assert_eq!(summary.checks["broken"]["healthy"], false);
    }

    #[tokio::test]
    async fn shutdown_runs_every_registered_routine() {
        let sup = Supervisor::new();
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));

        let flag = first.clone();
        sup.register_service("relay", move || async move {
            flag.store(true, Ordering::SeqCst);
        });
        let flag = second.clone();
        sup.register_service("connection", move || async move {
            flag.store(true, Ordering::SeqCst);
        });

        sup.shutdown().await;
        assert!(first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }
}
