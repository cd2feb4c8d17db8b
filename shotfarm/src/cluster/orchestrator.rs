//! Cluster orchestrator
//!
//! Owns the worker pool for the lifetime of a run and is the only code that
//! talks to it. Every dispatch is tagged with the `process` resource so a
//! worker slot never runs two simulations at once.

use super::pool::{BroadcastHandle, LocalPool, ResourceTag, TaskFuture, WorkerPool};
use crate::config::ClusterConfig;
use crate::errors::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, info, warn};

pub struct ClusterOrchestrator<P: WorkerPool = LocalPool> {
    pool: P,
    config: ClusterConfig,
    closed: AtomicBool,
}

impl ClusterOrchestrator<LocalPool> {
    /// Start a local pool sized from the cluster configuration.
    ///
    /// Batch-scheduler settings are honoured for sizing only: the pool
    /// runs `n_workers * processes` slots on this host.
    pub fn start(config: &ClusterConfig) -> Result<Self> {
        if !config.use_local_cluster {
            warn!(
                queue = %config.queue,
                project = %config.project,
                n_workers = config.n_workers,
                processes = config.processes,
                "Batch scheduler not available, emulating the job layout locally"
            );
        }
        check_host_memory(config);

        let pool = LocalPool::new(config.worker_slots())?;
        info!(
            slots = config.worker_slots(),
            local = config.use_local_cluster,
            "Cluster started"
        );
        Ok(Self::with_pool(pool, config.clone()))
    }
}

impl<P: WorkerPool> ClusterOrchestrator<P> {
    pub fn with_pool(pool: P, config: ClusterConfig) -> Self {
        Self {
            pool,
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Worker slots currently available for partitions
    pub fn slots(&self) -> usize {
        self.pool.size()
    }

    pub async fn scatter<T>(&self, value: &T, broadcast: bool) -> Result<BroadcastHandle<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.pool.scatter(value, broadcast).await
    }

    /// Dispatch one task per item, each holding one `process` unit.
    pub async fn map<T, I, R, F>(
        &self,
        task: F,
        items: Vec<I>,
        shared: &BroadcastHandle<T>,
    ) -> Result<Vec<TaskFuture<R>>>
    where
        T: Send + Sync + 'static,
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(I, &T) -> Result<R> + Send + Sync + 'static,
    {
        self.pool
            .map(Arc::new(task), items, shared, ResourceTag::process())
            .await
    }

    pub async fn gather<R: Send + 'static>(&self, futures: Vec<TaskFuture<R>>) -> Result<Vec<R>> {
        self.pool.gather(futures).await
    }

    pub async fn gather_settled<R: Send + 'static>(&self, futures: Vec<TaskFuture<R>>) -> Vec<Result<R>> {
        self.pool.gather_settled(futures).await
    }

    pub async fn scale(&self, n_workers: usize) -> Result<()> {
        self.pool.scale(n_workers).await
    }

    /// Release the pool. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Cluster already closed");
            return Ok(());
        }
        self.pool.close().await?;
        info!("Cluster closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn check_host_memory(config: &ClusterConfig) {
    let mut sys = System::new();
    sys.refresh_memory();
    let total_gb = sys.total_memory() / (1024 * 1024 * 1024);

    let requested_gb = if config.use_local_cluster {
        config.memory_gb
    } else {
        config.memory_gb * config.n_workers as u64
    };
    if total_gb > 0 && requested_gb > total_gb {
        warn!(
            requested_gb,
            available_gb = total_gb,
            "Requested worker memory exceeds this host"
        );
    }
}
