use crate::error::Result;
use crate::ids::*;
use crate::retry::BackoffPolicy;
use crate::store::{Store, Tx, TxScope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// A durable unit of deferred work. `item_type` names the registered
/// handler; `data` is an opaque payload the handler decodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub item_type: String,
    pub data: String,
    /// Items sharing a key share one state row and execute strictly
    /// serialized, in submission order.
    pub concurrency_key: Option<String>,
    pub state_id: WorkItemStateId,
    pub status: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub etag: Etag,
}

/// Scheduling state shared by all work items with the same concurrency
/// key (or owned by a single item when the key is empty).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItemState {
    pub id: WorkItemStateId,
    pub concurrency_key: Option<String>,
    pub attempts_so_far: u32,
    /// Earliest eligibility; carries the retry back-off.
    pub not_before: Option<DateTime<Utc>>,
    pub allocated_to: Option<String>,
    pub allocated_at: Option<DateTime<Utc>>,
    /// Lease expiry. A dead processor's items become allocatable again
    /// once this passes.
    pub allocated_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub etag: Etag,
}

impl WorkItemState {
    pub fn fresh(concurrency_key: Option<String>) -> Self {
        let at = now();
        Self {
            id: WorkItemStateId::new(),
            concurrency_key,
            attempts_so_far: 0,
            not_before: None,
            allocated_to: None,
            allocated_at: None,
            allocated_until: None,
            created_at: at,
            updated_at: at,
            etag: Etag::mint(),
        }
    }

    /// Eligibility of this state row for allocation at `at`.
    pub fn allocatable_at(&self, at: DateTime<Utc>) -> bool {
        let lease_free = match (&self.allocated_to, self.allocated_until) {
            (None, _) => true,
            (Some(_), Some(until)) => until < at,
            (Some(_), None) => false,
        };
        let due = self.not_before.map(|nb| nb <= at).unwrap_or(true);
        lease_free && due
    }
}

/// Handler failure: `can_retry` decides between back-off rescheduling and
/// completion-with-failure.
#[derive(Debug)]
pub struct HandlerError {
    pub can_retry: bool,
    pub message: String,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            can_retry: true,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            can_retry: false,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A registered processor for one work-item type. The engine is the
/// scheduling authority; handlers must be idempotent with respect to
/// external side effects, since a lease can expire mid-flight and the
/// item re-run elsewhere. The registered timeout cancels the handler
/// future, so handlers must tolerate being dropped at any await point.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> std::result::Result<(), HandlerError>;
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn WorkHandler>,
    timeout: Duration,
    policy: BackoffPolicy,
    keep_failed: bool,
    keep_successful: bool,
}

/// Durable work-queue engine: queues typed work items, allocates them to
/// this processor under a lease, runs the registered handler and applies
/// the retry policy.
pub struct WorkQueue {
    store: Arc<dyn Store>,
    registrations: RwLock<HashMap<String, Registration>>,
    lease: chrono::Duration,
    poll_interval: Duration,
    processor_id: String,
    shutdown: watch::Sender<bool>,
}

pub const DEFAULT_LEASE_SECS: i64 = 60;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl WorkQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            registrations: RwLock::new(HashMap::new()),
            lease: chrono::Duration::seconds(DEFAULT_LEASE_SECS),
            poll_interval: DEFAULT_POLL_INTERVAL,
            processor_id: format!("processor:{}", Uuid::now_v7()),
            shutdown,
        }
    }

    pub fn with_lease(mut self, lease: chrono::Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn processor_id(&self) -> &str {
        &self.processor_id
    }

    /// Register the handler for a work-item type.
    pub fn register(
        &self,
        item_type: impl Into<String>,
        handler: Arc<dyn WorkHandler>,
        timeout: Duration,
        policy: BackoffPolicy,
        keep_failed: bool,
        keep_successful: bool,
    ) {
        self.registrations.write().expect("registration lock").insert(
            item_type.into(),
            Registration {
                handler,
                timeout,
                policy,
                keep_failed,
                keep_successful,
            },
        );
    }

    /// Submit a work item. Items with the same concurrency key share a
    /// state row and therefore never run concurrently.
    pub async fn add(
        &self,
        tx: Option<&mut Tx>,
        item_type: &str,
        data: String,
        concurrency_key: Option<String>,
    ) -> Result<WorkItem> {
        let store = self.store.as_ref();
        let mut scope = TxScope::enter(store, tx).await?;
        let state = store
            .get_or_create_work_item_state(Some(scope.tx()), concurrency_key.as_deref())
            .await?;
        let at = now();
        let item = WorkItem {
            id: WorkItemId::new(),
            item_type: item_type.to_string(),
            data,
            concurrency_key,
            state_id: state.id,
            status: "queued".to_string(),
            completed_at: None,
            created_at: at,
            updated_at: at,
            etag: Etag::mint(),
        };
        store.create_work_item(Some(scope.tx()), &item).await?;
        scope.commit(store).await?;
        tracing::debug!(work_item_type = item.item_type, work_item = %item.id, "queued work item");
        Ok(item)
    }

    /// Allocate and run at most one work item. Returns false when nothing
    /// was eligible.
    pub async fn process_one(&self) -> Result<bool> {
        let types: Vec<String> = {
            let regs = self.registrations.read().expect("registration lock");
            regs.keys().cloned().collect()
        };
        if types.is_empty() {
            return Ok(false);
        }

        let store = self.store.as_ref();
        let mut tx = store.begin().await?;
        let found = store
            .find_queued_work_item(&mut tx, &types, now(), self.lease, &self.processor_id)
            .await?;
        store.commit(tx).await?;

        let Some((item, state)) = found else {
            return Ok(false);
        };
        let reg = {
            let regs = self.registrations.read().expect("registration lock");
            regs.get(&item.item_type).cloned()
        };
        let Some(reg) = reg else {
            // Type was deregistered between selection and dispatch.
            return Ok(false);
        };

        tracing::debug!(
            work_item_type = item.item_type,
            work_item = %item.id,
            attempt = state.attempts_so_far,
            "processing work item"
        );

        let outcome = match tokio::time::timeout(reg.timeout, reg.handler.handle(&item)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::retryable("handler timed out")),
        };

        match outcome {
            Ok(()) => {
                self.complete(item, state, None, reg.keep_successful).await?;
            }
            Err(err) if err.can_retry && state.attempts_so_far < reg.policy.max_attempts => {
                self.reschedule(item, state, &reg.policy, err).await?;
            }
            Err(err) => {
                tracing::warn!(
                    work_item_type = item.item_type,
                    work_item = %item.id,
                    error = %err,
                    "work item failed permanently"
                );
                self.complete(item, state, Some(err.message), reg.keep_failed)
                    .await?;
            }
        }
        Ok(true)
    }

    async fn complete(
        &self,
        mut item: WorkItem,
        mut state: WorkItemState,
        failure: Option<String>,
        keep: bool,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let mut scope = TxScope::enter(store, None).await?;
        item.status = match &failure {
            None => "succeeded".to_string(),
            Some(msg) => format!("failed: {msg}"),
        };
        item.completed_at = Some(now());
        let item = store.update_work_item(Some(scope.tx()), &item).await?;
        state.allocated_to = None;
        state.allocated_at = None;
        state.allocated_until = None;
        store
            .update_work_item_state(Some(scope.tx()), &state)
            .await?;
        if !keep {
            store.delete_work_item(Some(scope.tx()), item.id).await?;
        }
        scope.commit(store).await
    }

    async fn reschedule(
        &self,
        mut item: WorkItem,
        mut state: WorkItemState,
        policy: &BackoffPolicy,
        err: HandlerError,
    ) -> Result<()> {
        let delay = policy.delay_for(state.attempts_so_far);
        let not_before =
            now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
        tracing::warn!(
            work_item_type = item.item_type,
            work_item = %item.id,
            attempt = state.attempts_so_far,
            retry_at = %not_before,
            error = %err,
            "work item failed, scheduling retry"
        );
        let store = self.store.as_ref();
        let mut scope = TxScope::enter(store, None).await?;
        item.status = format!("retrying: {}", err.message);
        store.update_work_item(Some(scope.tx()), &item).await?;
        state.not_before = Some(not_before);
        state.allocated_to = None;
        state.allocated_at = None;
        state.allocated_until = None;
        store
            .update_work_item_state(Some(scope.tx()), &state)
            .await?;
        scope.commit(store).await
    }

    /// Poll-and-process until shutdown. Run on its own task; several
    /// copies may run concurrently against the same store.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.process_one().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "work-queue processing error");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
        can_retry: bool,
    }

    #[async_trait]
    impl WorkHandler for CountingHandler {
        async fn handle(&self, _item: &WorkItem) -> std::result::Result<(), HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                if self.can_retry {
                    Err(HandlerError::retryable(format!("transient failure {n}")))
                } else {
                    Err(HandlerError::terminal("permanent failure"))
                }
            } else {
                Ok(())
            }
        }
    }

    fn queue_with(
        store: Arc<dyn Store>,
        handler: Arc<dyn WorkHandler>,
        policy: BackoffPolicy,
    ) -> WorkQueue {
        let q = WorkQueue::new(store);
        q.register(
            "test-work",
            handler,
            Duration::from_secs(5),
            policy,
            true,
            true,
        );
        q
    }

    #[tokio::test]
    async fn processes_queued_item() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
            can_retry: true,
        });
        let q = queue_with(store.clone(), handler.clone(), BackoffPolicy::default());

        let item = q.add(None, "test-work", "{}".into(), None).await.unwrap();
        assert!(q.process_one().await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let done = store.work_item(None, item.id).await.unwrap();
        assert_eq!(done.status, "succeeded");
        assert!(done.completed_at.is_some());

        // Nothing left to do.
        assert!(!q.process_one().await.unwrap());
    }

    #[tokio::test]
    async fn backs_off_and_retries_in_order() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 3,
            can_retry: true,
        });
        let policy = BackoffPolicy::new(3, Duration::from_secs(1), Duration::from_secs(60))
            .with_jitter(0.0);
        let q = queue_with(store.clone(), handler.clone(), policy);

        let item = q.add(None, "test-work", "{}".into(), None).await.unwrap();

        // First failure: attempts 1, not_before ≈ now + 1s.
        let before = now();
        assert!(q.process_one().await.unwrap());
        let state = store.work_item_state(None, item.state_id).await.unwrap();
        assert_eq!(state.attempts_so_far, 1);
        let nb = state.not_before.unwrap();
        assert!(nb >= before + chrono::Duration::seconds(1));
        assert!(nb <= now() + chrono::Duration::seconds(2));
        assert!(state.allocated_to.is_none());

        // Not yet eligible: the item must not be allocated again.
        assert!(!q.process_one().await.unwrap());

        // Force eligibility and fail again: attempts 2, delay doubles.
        let mut state = store.work_item_state(None, item.state_id).await.unwrap();
        state.not_before = Some(now() - chrono::Duration::seconds(1));
        let state = store.update_work_item_state(None, &state).await.unwrap();
        let before = now();
        assert!(q.process_one().await.unwrap());
        let state2 = store.work_item_state(None, state.id).await.unwrap();
        assert_eq!(state2.attempts_so_far, 2);
        assert!(state2.not_before.unwrap() >= before + chrono::Duration::seconds(2));

        // Third failure exhausts max_attempts: completed with failure.
        let mut state2 = state2;
        state2.not_before = Some(now() - chrono::Duration::seconds(1));
        store.update_work_item_state(None, &state2).await.unwrap();
        assert!(q.process_one().await.unwrap());
        let done = store.work_item(None, item.id).await.unwrap();
        assert!(done.status.starts_with("failed:"), "{}", done.status);
        assert!(done.completed_at.is_some());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_failure_completes_immediately() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 10,
            can_retry: false,
        });
        let q = queue_with(store.clone(), handler.clone(), BackoffPolicy::default());

        let item = q.add(None, "test-work", "{}".into(), None).await.unwrap();
        assert!(q.process_one().await.unwrap());
        let done = store.work_item(None, item.id).await.unwrap();
        assert!(done.status.starts_with("failed:"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrency_key_serializes_items() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
            can_retry: true,
        });
        let q = queue_with(store.clone(), handler.clone(), BackoffPolicy::default());

        let a = q
            .add(None, "test-work", "a".into(), Some("repo-1".into()))
            .await
            .unwrap();
        let b = q
            .add(None, "test-work", "b".into(), Some("repo-1".into()))
            .await
            .unwrap();
        // Same key ⇒ same state row.
        assert_eq!(a.state_id, b.state_id);

        // Simulate a live lease held by another processor: neither item
        // may be allocated.
        let mut state = store.work_item_state(None, a.state_id).await.unwrap();
        state.allocated_to = Some("processor:other".into());
        state.allocated_until = Some(now() + chrono::Duration::seconds(60));
        store.update_work_item_state(None, &state).await.unwrap();
        assert!(!q.process_one().await.unwrap());

        // Expired lease frees the key; submission order is preserved.
        let mut state = store.work_item_state(None, a.state_id).await.unwrap();
        state.allocated_until = Some(now() - chrono::Duration::seconds(1));
        store.update_work_item_state(None, &state).await.unwrap();
        assert!(q.process_one().await.unwrap());
        let first_done = store.work_item(None, a.id).await.unwrap();
        assert_eq!(first_done.status, "succeeded");
        let second = store.work_item(None, b.id).await.unwrap();
        assert_eq!(second.status, "queued");
    }

    #[tokio::test]
    async fn empty_key_items_have_distinct_state() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
            can_retry: true,
        });
        let q = queue_with(store.clone(), handler, BackoffPolicy::default());
        let a = q.add(None, "test-work", "a".into(), None).await.unwrap();
        let b = q.add(None, "test-work", "b".into(), None).await.unwrap();
        assert_ne!(a.state_id, b.state_id);
    }
}
