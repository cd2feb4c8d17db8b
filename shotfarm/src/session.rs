//! Run sessions
//!
//! [`ForwardRun`] generates synthetic shot files in one scatter/map/gather
//! round. [`InversionSession`] is the stateful objective handed to an
//! optimizer: the shared context and the partitioning are computed on the
//! first evaluation and reused, and every evaluation publishes the
//! iterate to the model slot before dispatching work.

use crate::broadcast::{SharedContext, SharedStateBroadcaster};
use crate::catalog::ShotCatalog;
use crate::cluster::{BroadcastHandle, ClusterOrchestrator, LocalPool, WorkerPool};
use crate::config::{RunConfig, RunMode};
use crate::errors::{FwiError, Result};
use crate::field::Field;
use crate::optim::{self, Objective};
use crate::partition::{partition, Partition};
use crate::reducer::{GlobalResult, ResultReducer};
use crate::store::{self, GridMetadata, ModelSlot};
use crate::worker::{PartialResult, TaskOutput, WorkerTask};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Shots written by a forward run
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardSummary {
    pub shot_ids: Vec<u32>,
    pub partitions: usize,
}

pub struct ForwardRun<'a, P: WorkerPool = LocalPool> {
    cluster: &'a ClusterOrchestrator<P>,
    config: &'a RunConfig,
}

impl<'a, P: WorkerPool> ForwardRun<'a, P> {
    pub fn new(cluster: &'a ClusterOrchestrator<P>, config: &'a RunConfig) -> Self {
        Self { cluster, config }
    }

    /// Simulate every shot of the acquisition and write it to disk.
    ///
    /// Fails with [`FwiError::ShotsFailed`] naming the shots left without
    /// output: the shot that failed in each failing partition plus the
    /// ones queued after it.
    pub async fn run(&self) -> Result<ForwardSummary> {
        self.config.require_mode(RunMode::Forward)?;

        let catalog = ShotCatalog::build(self.config)?;
        let partitions = partition(catalog.tasks(), self.cluster.slots())?;
        let handle = SharedStateBroadcaster::new(self.config)
            .broadcast(self.cluster)
            .await?;

        let assigned: Vec<Vec<u32>> = partitions.iter().map(Partition::shot_ids).collect();
        let npartitions = partitions.len();
        let futures = self
            .cluster
            .map(
                |p: Partition, ctx: &SharedContext| WorkerTask::Forward.run(&p, ctx),
                partitions,
                &handle,
            )
            .await?;
        let outcomes = self.cluster.gather_settled(futures).await;

        let mut written = Vec::with_capacity(catalog.len());
        let mut failed = Vec::new();
        for (index, (outcome, shots)) in outcomes.into_iter().zip(&assigned).enumerate() {
            match outcome {
                Ok(PartialResult {
                    output: TaskOutput::Written { shot_ids },
                    ..
                }) => written.extend(shot_ids),
                Ok(other) => {
                    return Err(FwiError::Cluster(format!(
                        "partition {} returned {:?} from a forward task",
                        index, other.output
                    )))
                }
                Err(e) => {
                    let missing = unwritten_shots(&e, shots);
                    error!(partition = index, shots = ?missing, error = %e, "Forward partition failed");
                    failed.extend(missing);
                }
            }
        }

        if !failed.is_empty() {
            return Err(FwiError::ShotsFailed { shot_ids: failed });
        }
        info!(shots = written.len(), partitions = npartitions, "Forward modeling finished");
        Ok(ForwardSummary {
            shot_ids: written,
            partitions: npartitions,
        })
    }
}

/// Shots of a failed partition that produced no output
fn unwritten_shots(error: &FwiError, assigned: &[u32]) -> Vec<u32> {
    match error.failed_shots().first() {
        Some(first) => match assigned.iter().position(|id| id == first) {
            Some(pos) => assigned[pos..].to_vec(),
            None => vec![*first],
        },
        // transport failure, nothing is known about individual shots
        None => assigned.to_vec(),
    }
}

/// Stateful misfit/gradient evaluator over the cluster
pub struct InversionSession<'a, P: WorkerPool = LocalPool> {
    cluster: &'a ClusterOrchestrator<P>,
    config: RunConfig,
    grid: GridMetadata,
    start_velocity: Field,
    slot: ModelSlot,
    reducer: ResultReducer,
    iteration_count: u64,
    broadcast: Option<BroadcastHandle<SharedContext>>,
    partitions: Option<Vec<Partition>>,
}

impl<'a, P: WorkerPool> InversionSession<'a, P> {
    /// Load the starting model; no cluster work happens until the first
    /// evaluation.
    pub fn new(cluster: &'a ClusterOrchestrator<P>, config: &RunConfig) -> Result<Self> {
        config.require_mode(RunMode::Inversion)?;
        let params = &config.solver_params;
        let (start_velocity, grid) = store::read_model(&params.start_model_path(), "vp_start")?;

        Ok(Self {
            cluster,
            slot: ModelSlot::new(config.model_slot_path()),
            reducer: ResultReducer::new(config.mute_depth),
            config: config.clone(),
            grid,
            start_velocity,
            iteration_count: 0,
            broadcast: None,
            partitions: None,
        })
    }

    pub fn grid(&self) -> &GridMetadata {
        &self.grid
    }

    /// Evaluations dispatched so far
    pub fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    /// Starting point `1 / vp_start^2`
    pub fn initial_slowness(&self) -> Result<Field> {
        optim::velocity_to_slowness(&self.start_velocity)
    }

    /// Box constraints on squared slowness
    pub fn bounds(&self) -> Result<(f32, f32)> {
        self.config.slowness_bounds()
    }

    /// Pad the iterate, convert it to velocity and publish it to the slot.
    pub fn publish(&self, x: &[f32]) -> Result<()> {
        let slowness = Field::new(x.to_vec(), self.grid.shape.clone())?;
        let velocity = optim::slowness_to_velocity(&slowness)?;
        let padded = velocity.expand(self.config.solver_params.nbl);
        self.slot.publish(self.iteration_count, &padded)
    }

    /// Broadcast the context and partition the shots on first use.
    async fn prepare(&mut self) -> Result<(BroadcastHandle<SharedContext>, Vec<Partition>)> {
        let handle = match self.broadcast {
            Some(handle) => handle,
            None => {
                let handle = SharedStateBroadcaster::new(&self.config)
                    .broadcast(self.cluster)
                    .await?;
                self.broadcast = Some(handle);
                handle
            }
        };

        let partitions = match &self.partitions {
            Some(partitions) => partitions.clone(),
            None => {
                let catalog = ShotCatalog::build(&self.config)?;
                let partitions = partition(catalog.tasks(), self.cluster.slots())?;
                info!(
                    shots = catalog.len(),
                    partitions = partitions.len(),
                    "Inversion shots partitioned"
                );
                self.partitions = Some(partitions.clone());
                partitions
            }
        };
        Ok((handle, partitions))
    }

    /// Publish `x`, run `task` on every partition and wait for all of them.
    async fn dispatch(&mut self, x: &[f32], task: WorkerTask) -> Result<Vec<PartialResult>> {
        let (handle, partitions) = self.prepare().await?;
        self.iteration_count += 1;
        self.publish(x)?;

        let futures = self
            .cluster
            .map(
                move |p: Partition, ctx: &SharedContext| task.run(&p, ctx),
                partitions,
                &handle,
            )
            .await?;
        self.cluster.gather(futures).await.map_err(|e| {
            warn!(iteration = self.iteration_count, error = %e, "Evaluation aborted");
            e
        })
    }

    /// Global misfit and gradient at `x`.
    pub async fn evaluate(&mut self, x: &[f32]) -> Result<GlobalResult> {
        let partials = self.dispatch(x, WorkerTask::Gradient).await?;
        let result = self.reducer.reduce(partials)?;
        info!(
            iteration = self.iteration_count,
            objective = result.objective,
            "Gradient evaluated"
        );
        Ok(result)
    }
}

#[async_trait]
impl<'a, P: WorkerPool> Objective for InversionSession<'a, P> {
    async fn value_and_gradient(&mut self, x: &[f32]) -> Result<(f64, Vec<f32>)> {
        let result = self.evaluate(x).await?;
        Ok((result.objective, result.gradient.data))
    }

    async fn value(&mut self, x: &[f32]) -> Result<f64> {
        let partials = self.dispatch(x, WorkerTask::Misfit).await?;
        let objective = self.reducer.reduce_objective(partials)?;
        info!(iteration = self.iteration_count, objective, "Misfit evaluated");
        Ok(objective)
    }

    async fn gradient(&mut self, x: &[f32]) -> Result<Vec<f32>> {
        Ok(self.evaluate(x).await?.gradient.data)
    }
}
