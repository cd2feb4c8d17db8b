//! Shared simulation context
//!
//! Everything a worker needs besides its shot list is packed into one
//! [`SharedContext`] and scattered once per run (forward) or once per
//! inversion session. Workers only read it. The current inversion iterate
//! does not travel here; it is published through the model slot.

use crate::cluster::{BroadcastHandle, ClusterOrchestrator, WorkerPool};
use crate::config::{self, Precision, RunConfig, RunMode, SolverParams};
use crate::errors::{FwiError, Result};
use crate::field::Field;
use crate::solver::{AcousticSolver, SeismicModel, SolverSpec, WaveSolver};
use crate::store::{self, ModelSlot};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// `image / (illumination + epsilon)` applied pointwise
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IlluminationNormalizer {
    pub epsilon: f32,
}

impl IlluminationNormalizer {
    pub fn for_precision(dtype: Precision) -> Self {
        Self {
            epsilon: dtype.epsilon() as f32,
        }
    }

    pub fn apply(&self, image: &Field, illumination: &Field) -> Result<Field> {
        if image.shape != illumination.shape {
            return Err(FwiError::Shape(format!(
                "image {:?} vs illumination {:?}",
                image.shape, illumination.shape
            )));
        }
        let data = image
            .data
            .iter()
            .zip(&illumination.data)
            .map(|(g, s)| g / (s + self.epsilon))
            .collect();
        Field::new(data, image.shape.clone())
    }
}

/// Where workers obtain the velocity to simulate with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelSource {
    /// The model in the context is the one to use
    Broadcast,
    /// Read the current iterate from the slot before each task
    Slot(ModelSlot),
}

/// Read-only state scattered to every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    /// Solver and its time/source parameters
    pub solver: SolverSpec,
    /// Padded base model built once on the coordinator
    pub model: SeismicModel,
    /// Source of the velocity used during tasks
    pub model_source: ModelSource,
    /// Receivers per shot in the acquisition template
    pub nrecs: usize,
    /// Output sample interval for written shots (ms)
    pub output_dt: Option<f32>,
    /// Gradient normalization (inversion only)
    pub normalizer: Option<IlluminationNormalizer>,
    /// Working floating point type
    pub dtype: Precision,
    /// Physical extent of the interior model (m)
    pub domain_extent: Vec<f32>,
    /// Directory receiving generated shots
    pub shotfile_path: PathBuf,
    /// Model name used in shot file names
    pub model_name: String,
}

impl SharedContext {
    pub fn solver(&self) -> &dyn WaveSolver {
        self.solver.solver()
    }

    /// Model to simulate with for the current task.
    pub fn current_model(&self) -> Result<SeismicModel> {
        match &self.model_source {
            ModelSource::Broadcast => Ok(self.model.clone()),
            ModelSource::Slot(slot) => {
                let (_, velocity) = slot.load()?;
                let mut model = self.model.clone();
                model.update_velocity(velocity)?;
                Ok(model)
            }
        }
    }

    /// Trace file for a generated shot
    pub fn shot_file(&self, shot_id: u32) -> PathBuf {
        config::shot_file_path(&self.shotfile_path, &self.model_name, shot_id)
    }
}

/// Builds the shared context and distributes it through the cluster
pub struct SharedStateBroadcaster<'a> {
    config: &'a RunConfig,
}

impl<'a> SharedStateBroadcaster<'a> {
    pub fn new(config: &'a RunConfig) -> Self {
        Self { config }
    }

    /// Build the context for the configured run mode.
    pub fn build(&self) -> Result<SharedContext> {
        let mode = self.config.mode()?;
        let params = &self.config.solver_params;

        let solver = SolverSpec::Acoustic(AcousticSolver {
            t0: params.t0,
            tn: params.tn,
            f0: params.f0,
            space_order: params.space_order,
        });

        let (model_path, key) = model_file(params, mode);
        let (velocity, grid) = store::read_model(&model_path, key)?;
        let model = solver.solver().build_model(&velocity, &grid, params.nbl)?;

        let (model_source, normalizer) = match mode {
            RunMode::Forward => (ModelSource::Broadcast, None),
            RunMode::Inversion => (
                ModelSource::Slot(ModelSlot::new(self.config.model_slot_path())),
                Some(IlluminationNormalizer::for_precision(params.dtype)),
            ),
        };

        Ok(SharedContext {
            solver,
            domain_extent: grid.extent(),
            model,
            model_source,
            nrecs: self.config.nrecs,
            output_dt: params.dt,
            normalizer,
            dtype: params.dtype,
            shotfile_path: params.shotfile_path.clone(),
            model_name: params.model_name.clone(),
        })
    }

    /// Build the context and scatter it to every worker at once.
    pub async fn broadcast<P: WorkerPool>(
        &self,
        cluster: &ClusterOrchestrator<P>,
    ) -> Result<BroadcastHandle<SharedContext>> {
        let context = self.build()?;
        let handle = cluster.scatter(&context, true).await?;

        info!(
            broadcast_id = %handle.id(),
            model_shape = ?context.model.grid.shape,
            padded_shape = ?context.model.padded_shape(),
            slots = cluster.slots(),
            "Shared context broadcast"
        );
        Ok(handle)
    }
}

/// Model file the context is built from
pub fn model_file(params: &SolverParams, mode: RunMode) -> (PathBuf, &'static str) {
    match mode {
        RunMode::Forward => (params.velocity_path(), "vp"),
        RunMode::Inversion => (params.start_model_path(), "vp_start"),
    }
}
