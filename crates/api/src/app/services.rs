//! Service wiring: queue store, collaborators, and the per-lane workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::info;

use larder_ai::{InferenceService, LocalInference};
use larder_infra::handlers::{AiAnalysisHandler, AuditHandler, ImageOcrHandler};
use larder_infra::jobs::{
    InMemoryQueueStore, JobHandler, PostgresQueueStore, QueueStore, Worker, WorkerConfig,
    WorkerHandle,
};
use larder_infra::storage::{
    AuditLog, InMemoryAuditLog, InMemoryInventoryStore, InMemoryObjectStore, InventoryStore,
    ObjectStore,
};

use crate::config::ApiConfig;

/// Everything the routes need.
pub struct AppServices {
    pub queue: Arc<dyn QueueStore>,
    pub inventory: Arc<dyn InventoryStore>,
    pub audit: Arc<dyn AuditLog>,
    pub objects: Arc<dyn ObjectStore>,
    pub inference: Arc<dyn InferenceService>,
    /// Budget for endpoints that wait on a job inline.
    pub wait_timeout: Duration,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl AppServices {
    /// All-in-memory wiring around the given queue store and inference.
    pub fn in_memory(queue: Arc<dyn QueueStore>, inference: Arc<dyn InferenceService>) -> Self {
        Self {
            queue,
            inventory: Arc::new(InMemoryInventoryStore::new()),
            audit: Arc::new(InMemoryAuditLog::new()),
            objects: Arc::new(InMemoryObjectStore::new()),
            inference,
            wait_timeout: Duration::from_secs(30),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// One handler per lane.
    pub fn handlers(&self) -> Vec<Arc<dyn JobHandler>> {
        vec![
            Arc::new(ImageOcrHandler::new(self.inference.clone(), self.audit.clone())),
            Arc::new(AiAnalysisHandler::new(self.inference.clone(), self.audit.clone())),
            Arc::new(AuditHandler::new(self.audit.clone())),
        ]
    }

    /// Spawn one in-process worker per lane.
    pub fn start_workers(&self, config: &WorkerConfig) {
        let mut workers = self.workers.lock();
        for handler in self.handlers() {
            let queue = handler.queue();
            let config = config.clone().with_name(format!("{queue}-worker"));
            workers.push(Worker::new(self.queue.clone(), handler, config).spawn());
        }
        info!(workers = workers.len(), "job workers started");
    }

    /// Stop every worker and wait for in-flight jobs.
    pub async fn shutdown_workers(&self) {
        let workers: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.shutdown().await;
        }
    }
}

/// Build services from configuration.
///
/// The inference collaborator is the in-process [`LocalInference`]; vendor
/// clients plug in through [`InferenceService`].
pub async fn build_services(config: &ApiConfig) -> Result<AppServices> {
    let queue: Arc<dyn QueueStore> = match &config.database_url {
        Some(url) => {
            info!("using postgres queue store");
            Arc::new(PostgresQueueStore::connect(url).await?)
        }
        None => {
            info!("using in-memory queue store");
            Arc::new(InMemoryQueueStore::new())
        }
    };

    Ok(AppServices::in_memory(queue, Arc::new(LocalInference::new()))
        .with_wait_timeout(config.wait_timeout))
}
