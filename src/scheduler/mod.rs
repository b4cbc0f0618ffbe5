//! Scheduler: owns per-check execution lifecycles and reconciles them
//! against repository state.
//!
//! Every enabled check runs in exactly one of three shapes: a periodic
//! ticker, a realtime back-to-back loop, or a persistent TLS session.
//! A reconcile task re-reads the repository on a fixed period and
//! reshapes or tears down whatever changed; no stale in-memory schedule
//! outlives one reconcile period. Loops receive their stop handle and
//! collaborators at spawn and never reach back into scheduler state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};

use crate::limiter::RateLimiter;
use crate::models::{Check, CheckType};
use crate::storage::{CheckRepository, DomainRepository};
use crate::worker::{CheckJob, WorkerPool};

/// The execution shape a check is currently scheduled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Ticker,
    Realtime,
    Tls,
}

struct SchedulerState {
    running: bool,
    /// Per-check stop handles, one map per execution shape.
    tickers: HashMap<i64, broadcast::Sender<()>>,
    realtime_loops: HashMap<i64, broadcast::Sender<()>>,
    tls_loops: HashMap<i64, broadcast::Sender<()>>,
    rate_limiters: HashMap<i64, Arc<RateLimiter>>,
    /// Scheduler-wide stop signal; recreated on every start.
    stop: broadcast::Sender<()>,
}

impl SchedulerState {
    fn shape_of(&self, check_id: i64) -> Option<Shape> {
        if self.tls_loops.contains_key(&check_id) {
            Some(Shape::Tls)
        } else if self.realtime_loops.contains_key(&check_id) {
            Some(Shape::Realtime)
        } else if self.tickers.contains_key(&check_id) {
            Some(Shape::Ticker)
        } else {
            None
        }
    }
}

/// Owns check lifecycles; hands jobs to the worker pool.
pub struct Scheduler {
    check_repo: Arc<dyn CheckRepository>,
    domain_repo: Arc<dyn DomainRepository>,
    pool: Arc<WorkerPool>,
    global_limiter: Option<Arc<RateLimiter>>,
    reconcile_interval: Duration,
    state: RwLock<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        check_repo: Arc<dyn CheckRepository>,
        domain_repo: Arc<dyn DomainRepository>,
        pool: Arc<WorkerPool>,
        global_rate_limit_per_minute: u32,
        reconcile_interval: Duration,
    ) -> Self {
        let global_limiter = if global_rate_limit_per_minute > 0 {
            Some(Arc::new(RateLimiter::new(global_rate_limit_per_minute, 0)))
        } else {
            None
        };
        let (stop, _) = broadcast::channel(1);

        Self {
            check_repo,
            domain_repo,
            pool,
            global_limiter,
            reconcile_interval,
            state: RwLock::new(SchedulerState {
                running: false,
                tickers: HashMap::new(),
                realtime_loops: HashMap::new(),
                tls_loops: HashMap::new(),
                rate_limiters: HashMap::new(),
                stop,
            }),
        }
    }

    /// Load all enabled checks, schedule each, and spawn the reconcile
    /// task. Idempotent.
    pub async fn start(self: Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if state.running {
                return;
            }
            state.running = true;
            let (stop, _) = broadcast::channel(1);
            state.stop = stop;
        }
        tracing::info!("scheduler started");

        self.load_and_schedule().await;

        let scheduler = self.clone();
        let mut stop_rx = self.state.read().await.stop.subscribe();
        let period = self.reconcile_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the immediate first tick; startup already scheduled
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => return,
                    _ = ticker.tick() => scheduler.reconcile().await,
                }
            }
        });
    }

    /// Signal every loop to stop, clear all state, stop the pool.
    /// Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if !state.running {
                return;
            }
            state.running = false;
            let _ = state.stop.send(());
            // Dropping a stop sender closes its loop's receiver.
            state.tickers.clear();
            state.realtime_loops.clear();
            state.tls_loops.clear();
            state.rate_limiters.clear();
        }

        self.pool.stop().await;
        tracing::info!("scheduler stopped");
    }

    async fn load_and_schedule(&self) {
        let checks = match self.check_repo.list_all(None) {
            Ok(checks) => checks,
            Err(e) => {
                tracing::error!(error = %e, "failed to load checks");
                return;
            }
        };

        let mut state = self.state.write().await;
        for check in checks {
            if check.enabled {
                self.schedule_check(&mut state, check);
            }
        }
    }

    /// One reconcile pass: diff repository state against the in-memory
    /// schedule, reshaping, disabling and cleaning up as needed.
    pub async fn reconcile(&self) {
        let checks = match self.check_repo.list_all(None) {
            Ok(checks) => checks,
            Err(e) => {
                tracing::error!(error = %e, "failed to reload checks");
                return;
            }
        };

        let mut state = self.state.write().await;
        if !state.running {
            return;
        }

        let mut seen = HashSet::new();
        for check in checks {
            seen.insert(check.id);
            if check.enabled {
                if needs_reschedule(&state, &check) {
                    self.schedule_check(&mut state, check);
                }
            } else {
                unschedule(&mut state, check.id);
            }
        }

        let known: Vec<i64> = state
            .tickers
            .keys()
            .chain(state.realtime_loops.keys())
            .chain(state.tls_loops.keys())
            .copied()
            .collect();
        for check_id in known {
            if !seen.contains(&check_id) {
                unschedule(&mut state, check_id);
            }
        }
    }

    /// Install the execution shape for one enabled check, tearing down
    /// whatever shape it had before.
    fn schedule_check(&self, state: &mut SchedulerState, check: Check) {
        unschedule(state, check.id);

        if check.check_type == CheckType::Tls {
            self.schedule_tls(state, check);
            return;
        }

        if check.realtime_mode {
            self.schedule_realtime(state, check);
        } else {
            self.schedule_ticker(state, check);
        }
    }

    fn schedule_tls(&self, state: &mut SchedulerState, check: Check) {
        let domain = match self.domain_repo.get_by_id(check.domain_id) {
            Ok(domain) => domain,
            Err(e) => {
                tracing::warn!(check_id = check.id, error = %e, "domain not found for TLS check");
                return;
            }
        };
        let Some(port) = check.params.port.filter(|p| *p > 0) else {
            tracing::warn!(check_id = check.id, "invalid port for TLS check");
            return;
        };

        let (stop_tx, stop_rx) = broadcast::channel(1);
        state.tls_loops.insert(check.id, stop_tx);

        let timeout = check.params.timeout();
        let pool = self.pool.clone();
        let host = domain.name.clone();
        let job = CheckJob { check, domain };
        tokio::spawn(async move {
            crate::probe::run_tls_persistent_loop(
                host,
                port,
                timeout,
                move |result| pool.submit_tls_event(job.clone(), result),
                stop_rx,
            )
            .await;
        });
    }

    fn schedule_realtime(&self, state: &mut SchedulerState, check: Check) {
        // The previous limiter (if any) was discarded by the unschedule in
        // schedule_check; a changed rate takes effect from the next probe.
        let check_limiter = if check.rate_limit_per_minute > 0 {
            let limiter = Arc::new(RateLimiter::per_check(check.rate_limit_per_minute));
            state.rate_limiters.insert(check.id, limiter.clone());
            Some(limiter)
        } else {
            None
        };

        let (stop_tx, stop_rx) = broadcast::channel(1);
        state.realtime_loops.insert(check.id, stop_tx);

        tokio::spawn(run_realtime_loop(
            check,
            self.domain_repo.clone(),
            self.pool.clone(),
            self.global_limiter.clone(),
            check_limiter,
            stop_rx,
            state.stop.subscribe(),
        ));
    }

    fn schedule_ticker(&self, state: &mut SchedulerState, check: Check) {
        let (stop_tx, stop_rx) = broadcast::channel(1);
        state.tickers.insert(check.id, stop_tx);

        tokio::spawn(run_ticker_loop(
            check,
            self.domain_repo.clone(),
            self.pool.clone(),
            stop_rx,
            state.stop.subscribe(),
        ));
    }

    #[cfg(test)]
    async fn scheduled_shape(&self, check_id: i64) -> Option<Shape> {
        self.state.read().await.shape_of(check_id)
    }
}

/// A check needs rescheduling when its observed shape no longer matches
/// `{enabled, type, realtime_mode}`.
fn needs_reschedule(state: &SchedulerState, check: &Check) -> bool {
    let wanted = if check.check_type == CheckType::Tls {
        Shape::Tls
    } else if check.realtime_mode {
        Shape::Realtime
    } else {
        Shape::Ticker
    };
    state.shape_of(check.id) != Some(wanted)
}

/// Drop the check's stop handles and limiter; dropping a sender signals
/// its loop. An acquisition already in flight against the old limiter is
/// honoured.
fn unschedule(state: &mut SchedulerState, check_id: i64) {
    state.tickers.remove(&check_id);
    state.realtime_loops.remove(&check_id);
    state.tls_loops.remove(&check_id);
    state.rate_limiters.remove(&check_id);
}

/// Resolve the check's domain and hand the pool one job.
fn submit_check(check: &Check, domain_repo: &Arc<dyn DomainRepository>, pool: &WorkerPool) {
    let domain = match domain_repo.get_by_id(check.domain_id) {
        Ok(domain) => domain,
        Err(e) => {
            tracing::warn!(check_id = check.id, error = %e, "domain not found for check");
            return;
        }
    };
    pool.submit(CheckJob {
        check: check.clone(),
        domain,
    });
}

/// Back-to-back probe loop, paced only by the global and per-check rate
/// limiters.
async fn run_realtime_loop(
    check: Check,
    domain_repo: Arc<dyn DomainRepository>,
    pool: Arc<WorkerPool>,
    global_limiter: Option<Arc<RateLimiter>>,
    check_limiter: Option<Arc<RateLimiter>>,
    mut stop_rx: broadcast::Receiver<()>,
    mut global_stop: broadcast::Receiver<()>,
) {
    loop {
        if !matches!(stop_rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
            return;
        }
        if !matches!(global_stop.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
            return;
        }

        if let Some(limiter) = &global_limiter {
            limiter.acquire().await;
        }
        if let Some(limiter) = &check_limiter {
            limiter.acquire().await;
        }

        submit_check(&check, &domain_repo, &pool);
    }
}

/// Fixed-interval probe loop. The first tick fires immediately; ticks do
/// not coalesce with queued jobs (the pool drops on overflow).
async fn run_ticker_loop(
    check: Check,
    domain_repo: Arc<dyn DomainRepository>,
    pool: Arc<WorkerPool>,
    mut stop_rx: broadcast::Receiver<()>,
    mut global_stop: broadcast::Receiver<()>,
) {
    let period = Duration::from_secs(check.interval_seconds.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = global_stop.recv() => return,
            _ = ticker.tick() => submit_check(&check, &domain_repo, &pool),
        }
    }
}
