//! Worker pool abstraction and the in-process pool
//!
//! A pool hosts a fixed number of worker slots. `scatter` serializes a value
//! once and gives every slot its own deserialized copy, so no slot ever sees
//! another slot's state. `map` dispatches one task per item; each task must
//! acquire the slot resources named by its [`ResourceTag`] before it runs.
//! With the default `process = 1` resource this admits at most one
//! simulation per slot at a time.

use super::stats::{SlotGauge, TaskStats};
use crate::errors::{FwiError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Resource every simulation task consumes on its worker slot
pub const PROCESS_RESOURCE: &str = "process";

/// Named resource amount a task holds while it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTag {
    pub name: String,
    pub amount: u32,
}

impl ResourceTag {
    /// One unit of the `process` resource
    pub fn process() -> Self {
        Self {
            name: PROCESS_RESOURCE.to_string(),
            amount: 1,
        }
    }
}

/// Opaque reference to a scattered value
pub struct BroadcastHandle<T> {
    id: Uuid,
    _value: PhantomData<fn() -> T>,
}

impl<T> BroadcastHandle<T> {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            _value: PhantomData,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<T> Clone for BroadcastHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BroadcastHandle<T> {}

impl<T> fmt::Debug for BroadcastHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHandle").field("id", &self.id).finish()
    }
}

/// A dispatched task, tied to its position in scatter order
pub struct TaskFuture<R> {
    pub partition_index: usize,
    pub worker_id: usize,
    handle: JoinHandle<Result<R>>,
}

/// Join every task, returning outcomes in partition order.
async fn settle<R>(mut futures: Vec<TaskFuture<R>>) -> Vec<(usize, usize, Result<R>)> {
    futures.sort_by_key(|f| f.partition_index);
    let meta: Vec<(usize, usize)> = futures
        .iter()
        .map(|f| (f.partition_index, f.worker_id))
        .collect();
    let joined = join_all(futures.into_iter().map(|f| f.handle)).await;

    meta.into_iter()
        .zip(joined)
        .map(|((partition, worker), outcome)| {
            let result = outcome.unwrap_or_else(|e| {
                Err(FwiError::Cluster(format!(
                    "partition {} on worker {} did not finish: {}",
                    partition, worker, e
                )))
            });
            (partition, worker, result)
        })
        .collect()
}

/// Primitives the orchestrator needs from a compute cluster
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Number of worker slots
    fn size(&self) -> usize;

    /// Distribute `value`. With `broadcast` every slot receives a copy now,
    /// otherwise slots fetch it on first use.
    async fn scatter<T>(&self, value: &T, broadcast: bool) -> Result<BroadcastHandle<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Run `task` once per item against the slot-local copy of `shared`.
    async fn map<T, I, R, F>(
        &self,
        task: Arc<F>,
        items: Vec<I>,
        shared: &BroadcastHandle<T>,
        resource: ResourceTag,
    ) -> Result<Vec<TaskFuture<R>>>
    where
        T: Send + Sync + 'static,
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(I, &T) -> Result<R> + Send + Sync + 'static;

    /// Wait for every task; fail with the first error in partition order.
    async fn gather<R: Send + 'static>(&self, futures: Vec<TaskFuture<R>>) -> Result<Vec<R>> {
        let mut results = Vec::with_capacity(futures.len());
        let mut first_error = None;

        for (partition, worker, outcome) in settle(futures).await {
            match outcome {
                Ok(value) => results.push(value),
                Err(e) => {
                    error!(partition, worker, error = %e, "Partition task failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Wait for every task and return each outcome in partition order.
    async fn gather_settled<R: Send + 'static>(&self, futures: Vec<TaskFuture<R>>) -> Vec<Result<R>> {
        settle(futures)
            .await
            .into_iter()
            .map(|(_, _, outcome)| outcome)
            .collect()
    }

    /// Grow or shrink the number of worker slots.
    async fn scale(&self, n_workers: usize) -> Result<()>;

    /// Release all slots. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

type SharedValue = Arc<dyn Any + Send + Sync>;
type Decoder = Arc<dyn Fn(&[u8]) -> Result<SharedValue> + Send + Sync>;

struct Broadcast {
    bytes: Arc<Vec<u8>>,
    decode: Decoder,
    eager: bool,
}

type BroadcastTable = Arc<RwLock<HashMap<Uuid, Broadcast>>>;

struct WorkerSlot {
    id: usize,
    permits: Arc<Semaphore>,
    capacity: HashMap<String, u32>,
    store: RwLock<HashMap<Uuid, SharedValue>>,
    gauge: SlotGauge,
}

impl WorkerSlot {
    fn new(id: usize) -> Self {
        let mut capacity = HashMap::new();
        capacity.insert(PROCESS_RESOURCE.to_string(), 1);
        Self {
            id,
            permits: Arc::new(Semaphore::new(1)),
            capacity,
            store: RwLock::new(HashMap::new()),
            gauge: SlotGauge::default(),
        }
    }

    /// Slot-local copy of a broadcast, decoded on first use.
    async fn fetch<T: Send + Sync + 'static>(&self, id: Uuid, table: &BroadcastTable) -> Result<Arc<T>> {
        let cached = self.store.read().await.get(&id).cloned();
        let value = match cached {
            Some(value) => value,
            None => {
                let (bytes, decode) = {
                    let table = table.read().await;
                    let entry = table.get(&id).ok_or_else(|| {
                        FwiError::Cluster(format!("broadcast {} is not available", id))
                    })?;
                    (entry.bytes.clone(), entry.decode.clone())
                };
                let value = (*decode)(bytes.as_slice())?;
                debug!(worker = self.id, broadcast_id = %id, "Broadcast fetched on demand");
                self.store.write().await.entry(id).or_insert(value).clone()
            }
        };
        value
            .downcast::<T>()
            .map_err(|_| FwiError::Cluster(format!("broadcast {} has a different type", id)))
    }
}

/// Worker pool backed by tokio tasks in this process
pub struct LocalPool {
    slots: RwLock<Vec<Arc<WorkerSlot>>>,
    broadcasts: BroadcastTable,
    size: AtomicUsize,
    closed: AtomicBool,
    stats: Arc<TaskStats>,
}

impl LocalPool {
    /// Start a pool with `n_workers` slots.
    pub fn new(n_workers: usize) -> Result<Self> {
        if n_workers == 0 {
            return Err(FwiError::Cluster(
                "a worker pool needs at least one worker".to_string(),
            ));
        }
        let slots = (0..n_workers).map(|id| Arc::new(WorkerSlot::new(id))).collect();
        info!(workers = n_workers, "Local worker pool started");

        Ok(Self {
            slots: RwLock::new(slots),
            broadcasts: Arc::new(RwLock::new(HashMap::new())),
            size: AtomicUsize::new(n_workers),
            closed: AtomicBool::new(false),
            stats: Arc::new(TaskStats::new()),
        })
    }

    pub fn stats(&self) -> Arc<TaskStats> {
        self.stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently running tasks seen per slot
    pub async fn peak_concurrency(&self) -> Vec<usize> {
        self.slots.read().await.iter().map(|s| s.gauge.peak()).collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FwiError::Cluster("worker pool is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerPool for LocalPool {
    fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    async fn scatter<T>(&self, value: &T, broadcast: bool) -> Result<BroadcastHandle<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.ensure_open()?;

        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)
            .map_err(|e| FwiError::Cluster(format!("failed to serialize broadcast: {}", e)))?;
        let decode: Decoder = Arc::new(|raw: &[u8]| -> Result<SharedValue> {
            let copy: T = ciborium::from_reader(raw)
                .map_err(|e| FwiError::Cluster(format!("failed to decode broadcast: {}", e)))?;
            Ok(Arc::new(copy) as SharedValue)
        });

        let id = Uuid::new_v4();
        let slots = self.slots.read().await.clone();
        if broadcast {
            for slot in &slots {
                let copy = (*decode)(bytes.as_slice())?;
                slot.store.write().await.insert(id, copy);
            }
        }

        let size_bytes = bytes.len();
        self.broadcasts.write().await.insert(
            id,
            Broadcast {
                bytes: Arc::new(bytes),
                decode,
                eager: broadcast,
            },
        );
        self.stats.record_broadcast();

        info!(
            broadcast_id = %id,
            size_bytes,
            workers = slots.len(),
            eager = broadcast,
            "Value scattered"
        );
        Ok(BroadcastHandle::new(id))
    }

    async fn map<T, I, R, F>(
        &self,
        task: Arc<F>,
        items: Vec<I>,
        shared: &BroadcastHandle<T>,
        resource: ResourceTag,
    ) -> Result<Vec<TaskFuture<R>>>
    where
        T: Send + Sync + 'static,
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(I, &T) -> Result<R> + Send + Sync + 'static,
    {
        self.ensure_open()?;

        let slots = self.slots.read().await.clone();
        if slots.is_empty() {
            return Err(FwiError::Cluster("worker pool has no workers".to_string()));
        }
        for slot in &slots {
            let available = slot.capacity.get(&resource.name).copied().unwrap_or(0);
            if resource.amount == 0 || resource.amount > available {
                return Err(FwiError::Cluster(format!(
                    "worker {} cannot provide {} x '{}'",
                    slot.id, resource.amount, resource.name
                )));
            }
        }
        if !self.broadcasts.read().await.contains_key(&shared.id) {
            return Err(FwiError::Cluster(format!(
                "broadcast {} is not available",
                shared.id
            )));
        }

        let mut futures = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let slot = slots[index % slots.len()].clone();
            let worker_id = slot.id;
            let task = task.clone();
            let table = self.broadcasts.clone();
            let stats = self.stats.clone();
            let broadcast_id = shared.id;
            let amount = resource.amount;

            let handle = tokio::spawn(async move {
                let _permit = slot
                    .permits
                    .clone()
                    .acquire_many_owned(amount)
                    .await
                    .map_err(|e| FwiError::Cluster(format!("worker {} closed: {}", slot.id, e)))?;
                let value: Arc<T> = slot.fetch(broadcast_id, &table).await?;

                slot.gauge.enter();
                stats.start_task();
                let started = Instant::now();
                let outcome = tokio::task::spawn_blocking(move || (*task)(item, value.as_ref())).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                stats.finish_task();
                slot.gauge.exit();

                match outcome {
                    Ok(Ok(result)) => {
                        stats.record_success(elapsed_ms);
                        debug!(partition = index, worker = slot.id, elapsed_ms, "Task finished");
                        Ok(result)
                    }
                    Ok(Err(e)) => {
                        stats.record_failure(elapsed_ms);
                        warn!(partition = index, worker = slot.id, error = %e, "Task failed");
                        Err(e)
                    }
                    Err(e) => {
                        stats.record_failure(elapsed_ms);
                        Err(FwiError::Cluster(format!(
                            "task for partition {} panicked on worker {}: {}",
                            index, slot.id, e
                        )))
                    }
                }
            });

            futures.push(TaskFuture {
                partition_index: index,
                worker_id,
                handle,
            });
        }

        debug!(
            tasks = futures.len(),
            workers = slots.len(),
            resource = %resource.name,
            "Tasks dispatched"
        );
        Ok(futures)
    }

    async fn scale(&self, n_workers: usize) -> Result<()> {
        self.ensure_open()?;
        if n_workers == 0 {
            return Err(FwiError::Cluster("cannot scale to zero workers".to_string()));
        }

        let mut slots = self.slots.write().await;
        let current = slots.len();
        if n_workers > current {
            let table = self.broadcasts.read().await;
            for id in current..n_workers {
                let slot = WorkerSlot::new(id);
                {
                    let mut store = slot.store.write().await;
                    for (broadcast_id, entry) in table.iter().filter(|(_, b)| b.eager) {
                        store.insert(*broadcast_id, (*entry.decode)(entry.bytes.as_slice())?);
                    }
                }
                slots.push(Arc::new(slot));
            }
        } else {
            slots.truncate(n_workers);
        }
        self.size.store(n_workers, Ordering::SeqCst);

        info!(from = current, to = n_workers, "Worker pool scaled");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Worker pool already closed");
            return Ok(());
        }

        for slot in self.slots.read().await.iter() {
            slot.store.write().await.clear();
            slot.permits.close();
        }
        self.broadcasts.write().await.clear();

        self.stats.print_summary();
        info!("Worker pool closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Offset {
        value: i64,
    }

    #[tokio::test]
    async fn test_scatter_map_gather() {
        let pool = LocalPool::new(3).unwrap();
        let handle = pool.scatter(&Offset { value: 10 }, true).await.unwrap();

        let task = Arc::new(|item: i64, shared: &Offset| -> Result<i64> { Ok(item + shared.value) });
        let futures = pool
            .map(task, vec![1, 2, 3, 4, 5], &handle, ResourceTag::process())
            .await
            .unwrap();
        let workers: Vec<usize> = futures.iter().map(|f| f.worker_id).collect();
        assert_eq!(workers, vec![0, 1, 2, 0, 1]);

        let results = pool.gather(futures).await.unwrap();
        assert_eq!(results, vec![11, 12, 13, 14, 15]);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lazy_scatter_is_fetched() {
        let pool = LocalPool::new(2).unwrap();
        let handle = pool.scatter(&Offset { value: -1 }, false).await.unwrap();

        let task = Arc::new(|item: i64, shared: &Offset| -> Result<i64> { Ok(item * shared.value) });
        let futures = pool
            .map(task, vec![3, 4], &handle, ResourceTag::process())
            .await
            .unwrap();
        assert_eq!(pool.gather(futures).await.unwrap(), vec![-3, -4]);
    }

    #[tokio::test]
    async fn test_unknown_resource_rejected() {
        let pool = LocalPool::new(1).unwrap();
        let handle = pool.scatter(&Offset { value: 0 }, true).await.unwrap();
        let task = Arc::new(|item: i64, _: &Offset| -> Result<i64> { Ok(item) });

        let tag = ResourceTag {
            name: "gpu".to_string(),
            amount: 1,
        };
        let result = pool.map(task, vec![1], &handle, tag).await;
        assert!(matches!(result, Err(FwiError::Cluster(_))));
    }

    #[tokio::test]
    async fn test_gather_settled_keeps_every_outcome() {
        let pool = LocalPool::new(2).unwrap();
        let handle = pool.scatter(&Offset { value: 0 }, true).await.unwrap();
        let task = Arc::new(|item: i64, _: &Offset| -> Result<i64> {
            if item % 2 == 1 {
                Err(FwiError::Solver(format!("odd item {}", item)))
            } else {
                Ok(item)
            }
        });

        let futures = pool
            .map(task, vec![0, 1, 2, 3], &handle, ResourceTag::process())
            .await
            .unwrap();
        let outcomes = pool.gather_settled(futures).await;
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_err());
        assert!(outcomes[2].is_ok());
        assert!(outcomes[3].is_err());
    }

    #[tokio::test]
    async fn test_panicking_task_reports_cluster_error() {
        let pool = LocalPool::new(1).unwrap();
        let handle = pool.scatter(&Offset { value: 0 }, true).await.unwrap();
        let task = Arc::new(|item: i64, _: &Offset| -> Result<i64> {
            if item == 1 {
                panic!("boom");
            }
            Ok(item)
        });

        let futures = pool
            .map(task, vec![0, 1], &handle, ResourceTag::process())
            .await
            .unwrap();
        let result = pool.gather(futures).await;
        assert!(matches!(result, Err(FwiError::Cluster(_))));
        assert_eq!(pool.stats().tasks_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_work() {
        let pool = LocalPool::new(1).unwrap();
        pool.close().await.unwrap();
        pool.close().await.unwrap();
        assert!(pool.is_closed());
        assert!(pool.scatter(&Offset { value: 0 }, true).await.is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(LocalPool::new(0).is_err());
    }
}
