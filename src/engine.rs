//! Engine façade wiring the worker pool and scheduler together.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::notify::Notifier;
use crate::scheduler::Scheduler;
use crate::storage::{
    CheckRepository, DomainRepository, NotificationRepository, ResultRepository,
};
use crate::worker::WorkerPool;

/// The probing engine: owns the worker pool and the scheduler.
pub struct Engine {
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        check_repo: Arc<dyn CheckRepository>,
        domain_repo: Arc<dyn DomainRepository>,
        result_repo: Arc<dyn ResultRepository>,
        notification_repo: Arc<dyn NotificationRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(
            config.worker_count,
            result_repo,
            notification_repo,
            notifier,
        ));
        let scheduler = Arc::new(Scheduler::new(
            check_repo,
            domain_repo,
            pool.clone(),
            config.global_rate_limit_per_minute,
            config.reconcile_interval,
        ));
        Self { pool, scheduler }
    }

    /// Boot the worker pool, then the scheduler.
    pub async fn start(&self) {
        self.pool.start();
        self.scheduler.clone().start().await;
    }

    /// Hot-adjust probe parallelism.
    pub fn set_worker_count(&self, count: usize) {
        self.pool.resize(count);
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Stop the scheduler, which stops the pool.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }
}
