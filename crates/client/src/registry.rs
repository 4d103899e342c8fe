//! Background job registry.
//!
//! Tracks every job the caller handed off, polls all active remote handles
//! together on one shared tick, and emits one [`JobNotification`] per
//! handle when it reaches a terminal status. Local `task-` handles are
//! settled by their own task and never cause a network request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use larder_core::{InventoryId, JobId, SharedClock, SystemClock};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{JobStatusTransport, TransportError};
use crate::types::{
    BatchOutcome, HandleId, HandleOrigin, HandleStatus, JobHandle, JobNotification,
    JobStatusResponse, RemoteJobState,
};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub tick_interval: Duration,
    /// How long a finished handle stays visible before it is pruned.
    pub grace_period: Duration,
    /// Remote handles still active after this long are failed locally.
    pub stale_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            grace_period: Duration::from_secs(5),
            stale_after: Duration::from_secs(600),
        }
    }
}

impl RegistryConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Set of in-flight handles. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BackgroundJobRegistry {
    handles: Arc<Mutex<BTreeMap<HandleId, JobHandle>>>,
    transport: Arc<dyn JobStatusTransport>,
    clock: SharedClock,
    config: RegistryConfig,
    notifications: mpsc::UnboundedSender<JobNotification>,
}

impl BackgroundJobRegistry {
    /// A registry and the receiving end of its notifications.
    pub fn new(
        transport: Arc<dyn JobStatusTransport>,
        config: RegistryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<JobNotification>) {
        Self::with_clock(transport, config, SystemClock::shared())
    }

    pub fn with_clock(
        transport: Arc<dyn JobStatusTransport>,
        config: RegistryConfig,
        clock: SharedClock,
    ) -> (Self, mpsc::UnboundedReceiver<JobNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            handles: Arc::new(Mutex::new(BTreeMap::new())),
            transport,
            clock,
            config,
            notifications: tx,
        };
        (registry, rx)
    }

    /// Track a server job. Registering the same job twice keeps the
    /// existing handle.
    pub fn register_remote(
        &self,
        queue: impl Into<String>,
        job_id: JobId,
        owner_context: Option<InventoryId>,
    ) -> HandleId {
        let id = HandleId::remote(job_id);
        let handle = JobHandle::new(
            id.clone(),
            HandleOrigin::Remote { queue: queue.into() },
            owner_context,
            self.clock.now(),
        );
        self.handles.lock().entry(id.clone()).or_insert(handle);
        debug!(handle = %id, "registered remote job");
        id
    }

    /// Track work running in this process under a fresh `task-` id.
    pub fn register_local(&self, owner_context: Option<InventoryId>) -> HandleId {
        let id = HandleId::local();
        let handle = JobHandle::new(id.clone(), HandleOrigin::Local, owner_context, self.clock.now());
        self.handles.lock().insert(id.clone(), handle);
        debug!(handle = %id, "registered local task");
        id
    }

    /// Stop tracking a handle. No further polls or notifications for it.
    pub fn remove(&self, id: &HandleId) -> Option<JobHandle> {
        self.handles.lock().remove(id)
    }

    pub fn get(&self, id: &HandleId) -> Option<JobHandle> {
        self.handles.lock().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<JobHandle> {
        self.handles.lock().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|h| h.status == HandleStatus::Active)
            .count()
    }

    /// Settle a local task with its batch counts.
    pub fn complete_local(&self, id: &HandleId, outcome: BatchOutcome) -> bool {
        self.settle(id, HandleStatus::Completed, Some(outcome.to_value()), None)
    }

    pub fn fail_local(&self, id: &HandleId, reason: impl Into<String>) -> bool {
        self.settle(id, HandleStatus::Failed, None, Some(reason.into()))
    }

    /// Returns whether a notification was sent.
    fn settle(&self, id: &HandleId, status: HandleStatus, result: Option<Value>, error: Option<String>) -> bool {
        let now = self.clock.now();
        let notification = {
            let mut handles = self.handles.lock();
            handles
                .get_mut(id)
                .and_then(|h| h.settle(status, result, error, now))
        };
        match notification {
            Some(n) => {
                self.dispatch(n);
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, notification: JobNotification) {
        info!(handle = %notification.id, status = ?notification.status, "job ready");
        if self.notifications.send(notification).is_err() {
            debug!("notification receiver dropped");
        }
    }

    /// One polling round: prune expired handles, fail stale ones, then query
    /// every active remote handle concurrently and apply the answers.
    pub async fn tick(&self) {
        let now = self.clock.now();
        let stale = self.prune_and_expire(now);
        for n in stale {
            self.dispatch(n);
        }

        let targets: Vec<(HandleId, String, JobId)> = {
            let handles = self.handles.lock();
            handles
                .values()
                .filter(|h| h.is_pollable())
                .filter_map(|h| match (&h.origin, h.id.job_id()) {
                    (HandleOrigin::Remote { queue }, Some(job_id)) => Some((h.id.clone(), queue.clone(), job_id)),
                    _ => None,
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let responses = join_all(targets.iter().map(|(_, queue, job_id)| {
            let transport = self.transport.clone();
            async move { transport.job_status(queue, *job_id).await }
        }))
        .await;

        let now = self.clock.now();
        let notifications: Vec<JobNotification> = {
            let mut handles = self.handles.lock();
            targets
                .into_iter()
                .zip(responses)
                .filter_map(|((id, _, _), response)| {
                    // Removed while the request was in flight.
                    let handle = handles.get_mut(&id)?;
                    apply_response(handle, response, now)
                })
                .collect()
        };

        for n in notifications {
            self.dispatch(n);
        }
    }

    fn prune_and_expire(&self, now: DateTime<Utc>) -> Vec<JobNotification> {
        let grace = chrono_duration(self.config.grace_period);
        let stale_after = chrono_duration(self.config.stale_after);
        let mut handles = self.handles.lock();

        handles.retain(|id, h| {
            let keep = match h.terminal_at {
                Some(at) => now < at + grace,
                None => true,
            };
            if !keep {
                debug!(handle = %id, "pruned finished handle");
            }
            keep
        });

        handles
            .values_mut()
            .filter(|h| h.is_pollable() && now >= h.created_at + stale_after)
            .filter_map(|h| {
                warn!(handle = %h.id, "job status unknown for too long, giving up");
                h.settle(
                    HandleStatus::Failed,
                    None,
                    Some("no result before the client gave up waiting".to_string()),
                    now,
                )
            })
            .collect()
    }

    /// Run [`tick`](Self::tick) every `tick_interval` until stopped.
    pub fn start(&self) -> RegistryHandle {
        let registry = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            info!("background job registry started");
            let mut ticks = tokio::time::interval(registry.config.tick_interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; handles get one interval first.
            ticks.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => registry.tick().await,
                }
            }
            info!("background job registry stopped");
        });

        RegistryHandle { cancel, join }
    }
}

fn apply_response(
    handle: &mut JobHandle,
    response: Result<JobStatusResponse, TransportError>,
    now: DateTime<Utc>,
) -> Option<JobNotification> {
    match response {
        Ok(status) => {
            if handle.owner_context.is_none() {
                handle.owner_context = status.owner_context;
            }
            match status.status {
                RemoteJobState::Completed => handle.settle(HandleStatus::Completed, status.result, None, now),
                RemoteJobState::Failed => handle.settle(
                    HandleStatus::Failed,
                    None,
                    Some(status.error.unwrap_or_else(|| "job failed".to_string())),
                    now,
                ),
                RemoteJobState::Waiting | RemoteJobState::Active => None,
            }
        }
        Err(e @ (TransportError::Forbidden | TransportError::Unauthenticated | TransportError::NotFound)) => {
            warn!(handle = %handle.id, error = %e, "job can no longer be followed");
            handle.settle(HandleStatus::Failed, None, Some(e.to_string()), now)
        }
        Err(e) => {
            debug!(handle = %handle.id, error = %e, "status poll failed, retrying next tick");
            None
        }
    }
}

pub struct RegistryHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl RegistryHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "registry task ended abnormally");
        }
    }
}
