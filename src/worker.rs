//! Bounded worker pool: consumes check jobs, runs probes, persists
//! results, tracks per-check metrics and fans out notifications.
//!
//! Producers never block: `submit` drops the job with a warning when the
//! queue is full, and the scheduler will submit again on its next tick.
//! A separate single-consumer lane carries TLS lifecycle events so that
//! persistent-loop backpressure cannot starve periodic jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::models::{Check, CheckRecord, CheckResult, Domain};
use crate::notify::{Notifier, NotificationMessage};
use crate::probe;
use crate::storage::{NotificationRepository, ResultRepository};

const JOB_QUEUE_CAPACITY: usize = 100;
const TLS_EVENT_QUEUE_CAPACITY: usize = 50;
/// How long an idle worker waits before re-checking the target size.
const IDLE_POLL: Duration = Duration::from_millis(500);

const OVERLOAD_ERROR_STREAK: u32 = 5;
const OVERLOAD_AVG_DURATION: Duration = Duration::from_secs(5);

/// One scheduled probe execution: the check plus its resolved domain.
#[derive(Debug, Clone)]
pub struct CheckJob {
    pub check: Check,
    pub domain: Domain,
}

struct TlsEvent {
    job: CheckJob,
    result: CheckResult,
}

/// Per-check rolling state, used only to surface overload warnings.
#[derive(Debug, Default)]
struct CheckMetrics {
    consecutive_errors: u32,
    last_error_at: Option<Instant>,
    average_duration: Duration,
    sample_count: u32,
    last_check_at: Option<Instant>,
}

impl CheckMetrics {
    fn record(&mut self, duration: Duration, is_error: bool) {
        let now = Instant::now();
        if is_error {
            self.consecutive_errors += 1;
            self.last_error_at = Some(now);
        } else {
            self.consecutive_errors = 0;
        }
        self.last_check_at = Some(now);

        // Arithmetic mean for the first ten samples, EWMA after.
        if self.sample_count < 10 {
            self.sample_count += 1;
            let n = self.sample_count;
            self.average_duration = (self.average_duration * (n - 1) + duration) / n;
        } else {
            const ALPHA: f64 = 0.2;
            self.average_duration = Duration::from_secs_f64(
                self.average_duration.as_secs_f64() * (1.0 - ALPHA)
                    + duration.as_secs_f64() * ALPHA,
            );
        }
    }

    fn overloaded(&self) -> bool {
        self.consecutive_errors >= OVERLOAD_ERROR_STREAK
            || self.average_duration > OVERLOAD_AVG_DURATION
    }
}

struct PoolShared {
    result_repo: Arc<dyn ResultRepository>,
    notification_repo: Arc<dyn NotificationRepository>,
    notifier: Arc<dyn Notifier>,
    job_rx: tokio::sync::Mutex<mpsc::Receiver<CheckJob>>,
    /// Desired parallelism; workers above this retire at their next idle turn.
    target_workers: AtomicUsize,
    /// Workers currently running.
    live_workers: AtomicUsize,
    metrics: RwLock<HashMap<i64, Arc<Mutex<CheckMetrics>>>>,
}

/// Fixed-parallelism probe executor with hot resizing.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    job_tx: Mutex<Option<mpsc::Sender<CheckJob>>>,
    tls_tx: Mutex<Option<mpsc::Sender<TlsEvent>>>,
    tls_rx: Mutex<Option<mpsc::Receiver<TlsEvent>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        result_repo: Arc<dyn ResultRepository>,
        notification_repo: Arc<dyn NotificationRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let (tls_tx, tls_rx) = mpsc::channel(TLS_EVENT_QUEUE_CAPACITY);

        Self {
            shared: Arc::new(PoolShared {
                result_repo,
                notification_repo,
                notifier,
                job_rx: tokio::sync::Mutex::new(job_rx),
                target_workers: AtomicUsize::new(workers.max(1)),
                live_workers: AtomicUsize::new(0),
                metrics: RwLock::new(HashMap::new()),
            }),
            job_tx: Mutex::new(Some(job_tx)),
            tls_tx: Mutex::new(Some(tls_tx)),
            tls_rx: Mutex::new(Some(tls_rx)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers and the TLS event consumer. Idempotent per pool.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if !handles.is_empty() {
            return;
        }

        let count = self.shared.target_workers.load(Ordering::Relaxed);
        for _ in 0..count {
            self.shared.live_workers.fetch_add(1, Ordering::Relaxed);
            let shared = self.shared.clone();
            handles.push(tokio::spawn(worker_loop(shared)));
        }

        if let Some(mut tls_rx) = self
            .tls_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let shared = self.shared.clone();
            handles.push(tokio::spawn(async move {
                while let Some(event) = tls_rx.recv().await {
                    // TLS events arrive pre-shaped; no probe dispatch needed.
                    save_and_notify(&shared, &event.job, event.result, Duration::ZERO).await;
                }
            }));
        }
    }

    /// Non-blocking enqueue. A full queue drops the job: the scheduler
    /// submits a fresh one on the next tick.
    pub fn submit(&self, job: CheckJob) {
        let tx = self.job_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            return; // pool stopped
        };
        if let Err(mpsc::error::TrySendError::Full(job)) = tx.try_send(job) {
            tracing::warn!(
                check_id = job.check.id,
                "worker pool queue full, dropping job"
            );
        }
    }

    /// Non-blocking enqueue of one TLS lifecycle event.
    pub fn submit_tls_event(&self, job: CheckJob, result: CheckResult) {
        let tx = self.tls_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(event)) =
            tx.try_send(TlsEvent { job, result })
        {
            tracing::warn!(
                check_id = event.job.check.id,
                "tls event queue full, dropping event"
            );
        }
    }

    /// Adjust parallelism. Growth spawns workers immediately; shrinking
    /// marks excess workers for exit on their next idle turn. Floor is 1.
    pub fn resize(&self, count: usize) {
        let count = count.max(1);
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.shared.target_workers.swap(count, Ordering::Relaxed);

        if !handles.is_empty() {
            let live = self.shared.live_workers.load(Ordering::Relaxed);
            for _ in live..count {
                self.shared.live_workers.fetch_add(1, Ordering::Relaxed);
                let shared = self.shared.clone();
                handles.push(tokio::spawn(worker_loop(shared)));
            }
        }
        if count != previous {
            tracing::info!(from = previous, to = count, "worker pool resized");
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.target_workers.load(Ordering::Relaxed)
    }

    /// Close both queues and wait for the workers to drain them.
    pub async fn stop(&self) {
        self.job_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.tls_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        // Retire when the pool shrank below the live count. The CAS keeps
        // concurrent retirements from overshooting.
        let live = shared.live_workers.load(Ordering::Relaxed);
        if live > shared.target_workers.load(Ordering::Relaxed) {
            if shared
                .live_workers
                .compare_exchange(live, live - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            continue;
        }

        let received = {
            let mut rx = shared.job_rx.lock().await;
            tokio::time::timeout(IDLE_POLL, rx.recv()).await
        };

        match received {
            Err(_) => continue, // idle turn: re-check the target size
            Ok(None) => {
                // Queue closed and drained.
                shared.live_workers.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            Ok(Some(job)) => execute_job(&shared, job).await,
        }
    }
}

async fn execute_job(shared: &Arc<PoolShared>, job: CheckJob) {
    let started = Instant::now();
    let timeout = job.check.params.timeout();

    let Some(result) = run_check_by_type(&job, timeout).await else {
        return;
    };

    save_and_notify(shared, &job, result, started.elapsed()).await;
}

/// Dispatch on the probe family. Returns None when the check is
/// misconfigured (missing port); no result is written in that case.
async fn run_check_by_type(job: &CheckJob, timeout: Duration) -> Option<CheckResult> {
    use crate::models::CheckType::*;

    let check = &job.check;
    let host = job.domain.name.as_str();

    let port = || match check.params.port {
        Some(port) if port > 0 => Some(port),
        _ => {
            tracing::warn!(
                check_id = check.id,
                check_type = %check.check_type,
                "invalid port, skipping check"
            );
            None
        }
    };

    let result = match check.check_type {
        Http => {
            let url = probe::build_http_url(host, &check.params);
            probe::run_http_check(
                &url,
                check.params.method(),
                check.params.body.as_deref().unwrap_or(""),
                &check.params.headers,
                timeout,
            )
            .await
        }
        Icmp => probe::run_icmp_check(host, timeout).await,
        Tcp => probe::run_tcp_check(host, port()?, check.params.payload(), timeout).await,
        Udp => probe::run_udp_check(host, port()?, check.params.payload(), timeout).await,
        Tls => probe::run_tls_check(host, port()?, timeout).await,
    };
    Some(result)
}

async fn save_and_notify(
    shared: &Arc<PoolShared>,
    job: &CheckJob,
    result: CheckResult,
    probe_duration: Duration,
) {
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let record = CheckRecord {
        id: 0,
        check_id: job.check.id,
        status: result.status,
        status_code: result.status_code,
        duration_ms: result.duration_ms,
        outcome: result.outcome,
        error_message: result.error_message.clone(),
        created_at: created_at.clone(),
    };

    // A persistence failure loses one observation; the next probe will
    // produce a fresh one.
    if let Err(e) = shared.result_repo.add(&record) {
        tracing::error!(check_id = job.check.id, error = %e, "failed to save result");
    }

    update_metrics(shared, job.check.id, probe_duration, result.status.is_failure());

    send_notifications(shared, job, &result, &created_at).await;
}

fn update_metrics(shared: &Arc<PoolShared>, check_id: i64, duration: Duration, is_error: bool) {
    let metrics = {
        let read = shared.metrics.read().unwrap_or_else(|e| e.into_inner());
        read.get(&check_id).cloned()
    };
    let metrics = match metrics {
        Some(m) => m,
        None => {
            let mut write = shared.metrics.write().unwrap_or_else(|e| e.into_inner());
            write
                .entry(check_id)
                .or_insert_with(|| Arc::new(Mutex::new(CheckMetrics::default())))
                .clone()
        }
    };

    let mut metrics = metrics.lock().unwrap_or_else(|e| e.into_inner());
    metrics.record(duration, is_error);
    if metrics.overloaded() {
        tracing::warn!(
            check_id,
            consecutive_errors = metrics.consecutive_errors,
            average_duration_ms = metrics.average_duration.as_millis() as u64,
            last_error_age_s = metrics.last_error_at.map(|t| t.elapsed().as_secs()),
            last_check_age_s = metrics.last_check_at.map(|t| t.elapsed().as_secs()),
            "check overload detected, consider increasing the interval"
        );
    }
}

async fn send_notifications(
    shared: &Arc<PoolShared>,
    job: &CheckJob,
    result: &CheckResult,
    created_at: &str,
) {
    let settings_list = match shared.notification_repo.list_enabled() {
        Ok(list) => list,
        Err(e) => {
            tracing::error!(error = %e, "failed to load notification settings");
            return;
        }
    };
    if settings_list.is_empty() {
        return;
    }

    let is_failure = result.status.is_failure();
    let message = NotificationMessage {
        check_id: job.check.id,
        domain_name: job.domain.name.clone(),
        check_type: job.check.check_type.to_string(),
        status: result.status.to_string(),
        error_message: result.error_message.clone(),
        duration_ms: result.duration_ms,
        created_at: created_at.to_string(),
    };

    for settings in &settings_list {
        let notify_primary = (is_failure && settings.notify_on_failure)
            || (!is_failure && settings.notify_on_success);
        let notify_slow = settings.notify_on_slow_response
            && settings.slow_response_threshold_ms > 0
            && result.duration_ms >= settings.slow_response_threshold_ms;

        if notify_primary {
            if let Err(e) = shared.notifier.send(settings, &message).await {
                tracing::warn!(
                    check_id = job.check.id,
                    settings_id = settings.id,
                    error = %e,
                    "notification dispatch failed"
                );
            }
        }

        if notify_slow {
            let mut slow = message.clone();
            slow.status = "slow_response".to_string();
            slow.error_message = format!(
                "Response time {} ms exceeds threshold of {} ms",
                result.duration_ms, settings.slow_response_threshold_ms
            );
            if let Err(e) = shared.notifier.send(settings, &slow).await {
                tracing::warn!(
                    check_id = job.check.id,
                    settings_id = settings.id,
                    error = %e,
                    "slow-response notification dispatch failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CheckParams, CheckStatus, CheckType, NotificationChannel, NotificationSettings, Outcome,
    };
    use crate::notify::NotifyError;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;

    struct RecordingNotifier {
        sent: Mutex<Vec<NotificationMessage>>,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<NotificationMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            _settings: &NotificationSettings,
            message: &NotificationMessage,
        ) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn tcp_check(id: i64, port: u16) -> CheckJob {
        CheckJob {
            check: Check {
                id,
                domain_id: 1,
                check_type: CheckType::Tcp,
                interval_seconds: 60,
                params: CheckParams {
                    port: Some(port),
                    timeout_ms: Some(500),
                    ..Default::default()
                },
                enabled: true,
                realtime_mode: false,
                rate_limit_per_minute: 0,
            },
            domain: Domain {
                id: 1,
                name: "127.0.0.1".to_string(),
            },
        }
    }

    fn settings(
        failure: bool,
        success: bool,
        slow_threshold_ms: u64,
    ) -> NotificationSettings {
        NotificationSettings {
            id: 1,
            channel: NotificationChannel::Telegram,
            enabled: true,
            token: "t".to_string(),
            chat_id: "c".to_string(),
            webhook_url: String::new(),
            notify_on_failure: failure,
            notify_on_success: success,
            notify_on_slow_response: slow_threshold_ms > 0,
            slow_response_threshold_ms: slow_threshold_ms,
        }
    }

    fn pool_with(
        workers: usize,
        store: &Arc<MemoryStore>,
        notifier: &Arc<RecordingNotifier>,
    ) -> WorkerPool {
        WorkerPool::new(
            workers,
            store.clone() as Arc<dyn ResultRepository>,
            store.clone() as Arc<dyn NotificationRepository>,
            notifier.clone() as Arc<dyn Notifier>,
        )
    }

    #[tokio::test]
    async fn test_burst_over_capacity_drops_tail_but_executes_first_hundred() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = pool_with(1, &store, &notifier);

        // Queue up before any worker runs: capacity is 100, the rest drop.
        for i in 0..150 {
            pool.submit(tcp_check(i, port));
        }
        pool.start();
        pool.stop().await;

        assert_eq!(store.result_count(), 100);
    }

    #[tokio::test]
    async fn test_invalid_port_skips_without_result() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = pool_with(1, &store, &notifier);

        let mut job = tcp_check(1, 1);
        job.check.params.port = None;
        pool.start();
        pool.submit(job);
        pool.stop().await;

        assert_eq!(store.result_count(), 0);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_slow_success_sends_exactly_one_slow_message() {
        let store = Arc::new(MemoryStore::new());
        NotificationRepository::add(&*store, &settings(true, false, 100)).unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = pool_with(1, &store, &notifier);

        // 150 ms success against a 100 ms threshold: the primary predicate
        // stays quiet (notify_on_success is off), only the slow path fires.
        let job = tcp_check(7, 80);
        let result = CheckResult {
            status: CheckStatus::Success,
            status_code: None,
            duration_ms: 150,
            outcome: Outcome::Success,
            error_message: String::new(),
            headers: None,
        };
        save_and_notify(&pool.shared, &job, result, Duration::from_millis(150)).await;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, "slow_response");
        assert_eq!(
            sent[0].error_message,
            "Response time 150 ms exceeds threshold of 100 ms"
        );
        assert_eq!(store.results_for_check(7).len(), 1);
    }

    #[tokio::test]
    async fn test_fast_error_sends_exactly_one_primary_message() {
        let store = Arc::new(MemoryStore::new());
        NotificationRepository::add(&*store, &settings(true, false, 100)).unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = pool_with(1, &store, &notifier);

        let job = tcp_check(7, 80);
        let result = CheckResult::error("connection refused", 40);
        save_and_notify(&pool.shared, &job, result, Duration::from_millis(40)).await;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, "error");
    }

    #[tokio::test]
    async fn test_failure_sends_primary_message() {
        let store = Arc::new(MemoryStore::new());
        NotificationRepository::add(&*store, &settings(true, false, 100)).unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = pool_with(1, &store, &notifier);

        pool.start();
        pool.submit(tcp_check(9, 1)); // closed port -> error under 100 ms
        pool.stop().await;

        let records = store.results_for_check(9);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CheckStatus::Error);
        assert_eq!(records[0].outcome, Outcome::Error);
        assert!(records[0].error_message.contains("connection"));

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, "error");
    }

    #[tokio::test]
    async fn test_success_without_predicates_sends_nothing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let store = Arc::new(MemoryStore::new());
        NotificationRepository::add(&*store, &settings(true, false, 0)).unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = pool_with(2, &store, &notifier);

        pool.start();
        pool.submit(tcp_check(3, port));
        pool.stop().await;

        assert_eq!(store.result_count(), 1);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_resize_grows_and_shrinks() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = pool_with(2, &store, &notifier);

        pool.start();
        pool.resize(4);
        assert_eq!(pool.worker_count(), 4);

        pool.resize(0); // clamped to the floor of 1
        assert_eq!(pool.worker_count(), 1);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_shrink_does_not_drop_queued_work() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = pool_with(4, &store, &notifier);

        for i in 0..20 {
            pool.submit(tcp_check(i, port));
        }
        pool.start();
        pool.resize(1);
        pool.stop().await;

        assert_eq!(store.result_count(), 20);
    }

    #[test]
    fn test_metrics_mean_then_ewma() {
        let mut metrics = CheckMetrics::default();
        for _ in 0..10 {
            metrics.record(Duration::from_millis(100), false);
        }
        assert_eq!(metrics.average_duration, Duration::from_millis(100));

        // Eleventh sample blends via EWMA: 100 * 0.8 + 600 * 0.2 = 200.
        metrics.record(Duration::from_millis(600), false);
        let avg_ms = metrics.average_duration.as_millis();
        assert!((199..=201).contains(&avg_ms));
    }

    #[test]
    fn test_metrics_error_streak_resets_on_success() {
        let mut metrics = CheckMetrics::default();
        for _ in 0..5 {
            metrics.record(Duration::from_millis(10), true);
        }
        assert!(metrics.overloaded());

        metrics.record(Duration::from_millis(10), false);
        assert_eq!(metrics.consecutive_errors, 0);
        assert!(!metrics.overloaded());
    }
}
