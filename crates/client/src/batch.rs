//! Fire-and-forget batch of reviewed items.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use larder_core::InventoryId;
use tracing::{info, warn};

use crate::registry::BackgroundJobRegistry;
use crate::review::AddItemRequest;
use crate::transport::ItemWriter;
use crate::types::{BatchOutcome, HandleId};

/// Write `items` to `inventory` one at a time on a detached task.
///
/// Returns the local handle id immediately. There is no error path back to
/// the caller: per-item failures are counted, and the final
/// [`BatchOutcome`] arrives as the handle's completion notification.
pub fn spawn_batch(
    registry: &BackgroundJobRegistry,
    writer: Arc<dyn ItemWriter>,
    inventory: InventoryId,
    items: Vec<AddItemRequest>,
) -> HandleId {
    let id = registry.register_local(Some(inventory));
    let registry = registry.clone();
    let task_id = id.clone();

    tokio::spawn(async move {
        let mut guard = SettleGuard::new(registry.clone(), task_id.clone());
        let mut outcome = BatchOutcome::default();

        for (index, item) in items.iter().enumerate() {
            match AssertUnwindSafe(writer.add_item(inventory, item)).catch_unwind().await {
                Ok(Ok(())) => outcome.success_count += 1,
                Ok(Err(e)) => {
                    warn!(handle = %task_id, index, item = %item.name, error = %e, "failed to add item");
                    outcome.fail_count += 1;
                }
                Err(_) => {
                    warn!(handle = %task_id, index, item = %item.name, "item writer panicked");
                    outcome.fail_count += 1;
                }
            }
        }

        info!(
            handle = %task_id,
            inventory_id = %inventory,
            success = outcome.success_count,
            failed = outcome.fail_count,
            "batch finished"
        );
        registry.complete_local(&task_id, outcome);
        guard.disarm();
    });

    id
}

/// Fails the handle if the batch task ends without settling it.
struct SettleGuard {
    registry: BackgroundJobRegistry,
    id: HandleId,
    armed: bool,
}

impl SettleGuard {
    fn new(registry: BackgroundJobRegistry, id: HandleId) -> Self {
        Self { registry, id, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if self.armed && self.registry.fail_local(&self.id, "batch task ended before reporting") {
            warn!(handle = %self.id, "batch task ended before reporting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::transport::{JobStatusTransport, TransportError};
    use crate::types::{HandleStatus, JobStatusResponse};
    use async_trait::async_trait;
    use larder_core::JobId;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NoNetwork;

    #[async_trait]
    impl JobStatusTransport for NoNetwork {
        async fn job_status(&self, _queue: &str, _job_id: JobId) -> Result<JobStatusResponse, TransportError> {
            panic!("local tasks must not be polled");
        }
    }

    /// Records writes in order; fails the items whose names are listed.
    struct RecordingWriter {
        fail_names: Vec<String>,
        written: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl RecordingWriter {
        fn failing(names: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fail_names: names.iter().map(|n| n.to_string()).collect(),
                written: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ItemWriter for RecordingWriter {
        async fn add_item(&self, _inventory: InventoryId, item: &AddItemRequest) -> Result<(), TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.written.lock().push(item.name.clone());
            if self.fail_names.contains(&item.name) {
                return Err(TransportError::Api(500, "insert failed".into()));
            }
            Ok(())
        }
    }

    /// Panics on the named item instead of answering.
    struct PanickingWriter {
        panic_on: String,
        written: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ItemWriter for PanickingWriter {
        async fn add_item(&self, _inventory: InventoryId, item: &AddItemRequest) -> Result<(), TransportError> {
            if item.name == self.panic_on {
                panic!("writer blew up on {}", item.name);
            }
            self.written.lock().push(item.name.clone());
            Ok(())
        }
    }

    fn items(n: usize) -> Vec<AddItemRequest> {
        (1..=n)
            .map(|i| AddItemRequest {
                name: format!("item-{i}"),
                quantity: 1.0,
                unit: "pcs".into(),
                notes: None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_does_not_stop_the_batch() {
        let (registry, mut rx) = BackgroundJobRegistry::new(Arc::new(NoNetwork), RegistryConfig::default());
        let writer = RecordingWriter::failing(&["item-3"]);
        let inventory = InventoryId::new();

        let id = spawn_batch(&registry, writer.clone(), inventory, items(5));
        assert!(id.is_local());
        assert_eq!(registry.get(&id).unwrap().status, HandleStatus::Active);

        let n = rx.recv().await.unwrap();
        assert_eq!(n.id, id);
        assert_eq!(n.status, HandleStatus::Completed);
        assert_eq!(n.owner_context, Some(inventory));
        assert_eq!(
            BatchOutcome::from_value(n.result.as_ref().unwrap()),
            Some(BatchOutcome { success_count: 4, fail_count: 1 })
        );
        assert_eq!(
            *writer.written.lock(),
            vec!["item-1", "item-2", "item-3", "item-4", "item-5"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn items_are_written_sequentially() {
        let (registry, mut rx) = BackgroundJobRegistry::new(Arc::new(NoNetwork), RegistryConfig::default());
        let writer = RecordingWriter::failing(&[]);

        spawn_batch(&registry, writer.clone(), InventoryId::new(), items(4));
        rx.recv().await.unwrap();

        assert_eq!(writer.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_survives_registry_ticks() {
        let (registry, mut rx) = BackgroundJobRegistry::new(Arc::new(NoNetwork), RegistryConfig::default());
        let handle = registry.start();

        spawn_batch(&registry, RecordingWriter::failing(&["item-1", "item-2"]), InventoryId::new(), items(2));
        let n = rx.recv().await.unwrap();
        assert_eq!(
            BatchOutcome::from_value(n.result.as_ref().unwrap()),
            Some(BatchOutcome { success_count: 0, fail_count: 2 })
        );

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_completes_immediately() {
        let (registry, mut rx) = BackgroundJobRegistry::new(Arc::new(NoNetwork), RegistryConfig::default());
        spawn_batch(&registry, RecordingWriter::failing(&[]), InventoryId::new(), Vec::new());

        let n = rx.recv().await.unwrap();
        assert_eq!(BatchOutcome::from_value(n.result.as_ref().unwrap()), Some(BatchOutcome::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn writer_panic_counts_as_a_failed_item() {
        let (registry, mut rx) = BackgroundJobRegistry::new(Arc::new(NoNetwork), RegistryConfig::default());
        let writer = Arc::new(PanickingWriter {
            panic_on: "item-2".into(),
            written: Mutex::new(Vec::new()),
        });

        let id = spawn_batch(&registry, writer.clone(), InventoryId::new(), items(3));
        let n = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();

        assert_eq!(n.id, id);
        assert_eq!(n.status, HandleStatus::Completed);
        assert_eq!(
            BatchOutcome::from_value(n.result.as_ref().unwrap()),
            Some(BatchOutcome { success_count: 2, fail_count: 1 })
        );
        assert_eq!(*writer.written.lock(), vec!["item-1", "item-3"]);
    }

    #[tokio::test]
    async fn unsettled_task_fails_its_handle_on_drop() {
        let (registry, mut rx) = BackgroundJobRegistry::new(Arc::new(NoNetwork), RegistryConfig::default());
        let id = registry.register_local(None);

        drop(SettleGuard::new(registry.clone(), id.clone()));

        let n = rx.recv().await.unwrap();
        assert_eq!(n.id, id);
        assert_eq!(n.status, HandleStatus::Failed);
        assert_eq!(n.error.as_deref(), Some("batch task ended before reporting"));
        assert_eq!(registry.get(&id).unwrap().status, HandleStatus::Failed);
    }

    #[tokio::test]
    async fn disarmed_guard_leaves_completed_handle_alone() {
        let (registry, mut rx) = BackgroundJobRegistry::new(Arc::new(NoNetwork), RegistryConfig::default());
        let id = registry.register_local(None);

        let mut guard = SettleGuard::new(registry.clone(), id.clone());
        registry.complete_local(&id, BatchOutcome::default());
        guard.disarm();
        drop(guard);

        assert_eq!(rx.recv().await.unwrap().status, HandleStatus::Completed);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.get(&id).unwrap().status, HandleStatus::Completed);
    }
}
