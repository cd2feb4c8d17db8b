//! Per-partition simulation tasks
//!
//! A task runs the shots of one partition strictly in order inside a worker
//! slot. Each variant follows the same shape: obtain the model and
//! wavefield buffers, then for every shot reset the wavefield, place the
//! shot geometry, simulate, post-process and accumulate. The first failing
//! shot aborts the task with its id attached. Wavefield buffers are owned
//! by the task and dropped on every exit path.

use crate::broadcast::SharedContext;
use crate::catalog::ShotTask;
use crate::errors::{FwiError, Result};
use crate::field::Field;
use crate::partition::Partition;
use crate::segy;
use crate::solver::{resample, SeismicModel, ShotRecord, TimeAxis, WaveSolver, Wavefield};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

/// Work a partition task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerTask {
    /// Simulate and write each shot to a trace file
    Forward,
    /// Misfit against observed data only
    Misfit,
    /// Misfit plus illumination-normalized gradient
    Gradient,
}

/// What a partition task produced
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Shots written to disk, in partition order
    Written { shot_ids: Vec<u32> },
    /// Summed `0.5 * ||residual||^2` over the partition
    Misfit { objective: f64 },
    /// Summed misfit and interior-shaped gradient over the partition
    Gradient { objective: f64, gradient: Field },
}

/// Output of one partition task, tagged with its scatter position
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    pub partition: usize,
    pub output: TaskOutput,
}

impl WorkerTask {
    /// Run this task over every shot of `partition`.
    pub fn run(self, partition: &Partition, ctx: &SharedContext) -> Result<PartialResult> {
        let started = Instant::now();
        let model = ctx.current_model()?;

        let output = match self {
            WorkerTask::Forward => run_forward(partition, ctx, &model)?,
            WorkerTask::Misfit => run_misfit(partition, ctx, &model)?,
            WorkerTask::Gradient => run_gradient(partition, ctx, &model)?,
        };

        info!(
            task = ?self,
            partition = partition.index,
            shots = partition.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Partition finished"
        );
        Ok(PartialResult {
            partition: partition.index,
            output,
        })
    }
}

fn run_forward(partition: &Partition, ctx: &SharedContext, model: &SeismicModel) -> Result<TaskOutput> {
    let solver = ctx.solver();
    let mut wavefield = Wavefield::new();
    let mut shot_ids = Vec::with_capacity(partition.len());

    for shot in &partition.shots {
        write_shot(shot, ctx, solver, model, &mut wavefield)
            .map_err(|e| FwiError::simulation(shot.id, e))?;
        shot_ids.push(shot.id);
    }
    wavefield.release();

    Ok(TaskOutput::Written { shot_ids })
}

fn write_shot(
    shot: &ShotTask,
    ctx: &SharedContext,
    solver: &dyn WaveSolver,
    model: &SeismicModel,
    wavefield: &mut Wavefield,
) -> Result<()> {
    wavefield.reset();
    let record = solver.forward(
        &shot.source_position,
        &shot.receiver_positions,
        wavefield,
        model,
        None,
        false,
    )?;

    let (samples, dt) = match ctx.output_dt {
        Some(dt) => {
            let (t0, tn) = ctx.solver.time_range();
            let simulated = sampled_axis(t0, record.dt, &record.samples);
            let output = TimeAxis::new(t0, tn, dt)?;
            (resample(&record.samples, &simulated, &output)?, dt)
        }
        None => (record.samples, record.dt),
    };

    let path = ctx.shot_file(shot.id);
    segy::write_traces(
        &samples,
        &shot.source_position,
        &shot.receiver_positions,
        dt,
        shot.id,
        &path,
    )?;

    info!(
        shot_id = shot.id,
        simulation_dt_ms = record.dt,
        output_dt_ms = dt,
        path = %path.display(),
        "Shot generated"
    );
    Ok(())
}

/// Axis of `[nt, ntr]` traces starting at `start` with interval `step`
fn sampled_axis(start: f32, step: f32, samples: &Field) -> TimeAxis {
    TimeAxis {
        start,
        step,
        num: samples.shape.first().copied().unwrap_or(0),
    }
}

/// Observed traces of a shot on the simulation time axis
fn observed_traces(shot: &ShotTask, simulation: &TimeAxis) -> Result<Field> {
    let trace_ref = shot.observed.as_ref().ok_or_else(|| {
        FwiError::Configuration(format!("shot {} has no observed data", shot.id))
    })?;
    let block = segy::read_traces(&trace_ref.path, trace_ref.trace_offset, trace_ref.trace_count)?;
    if trace_ref.trace_count != shot.receiver_positions.len() {
        return Err(FwiError::TraceFormat(format!(
            "shot {} has {} traces for {} receivers",
            shot.id,
            trace_ref.trace_count,
            shot.receiver_positions.len()
        )));
    }
    if block.dt <= 0.0 {
        return Err(FwiError::TraceFormat(format!(
            "shot {} has sample interval {} ms",
            shot.id, block.dt
        )));
    }
    let recorded = sampled_axis(simulation.start, block.dt, &block.samples);
    resample(&block.samples, &recorded, simulation)
}

/// Forward-model one shot and return its residual against observed data.
fn shot_residual(
    shot: &ShotTask,
    solver: &dyn WaveSolver,
    model: &SeismicModel,
    wavefield: &mut Wavefield,
    save: bool,
) -> Result<ShotRecord> {
    wavefield.reset();
    let simulation = solver.time_axis(model, None)?;
    let observed = observed_traces(shot, &simulation)?;
    let record = solver.forward(
        &shot.source_position,
        &shot.receiver_positions,
        wavefield,
        model,
        None,
        save,
    )?;

    Ok(ShotRecord {
        samples: record.samples.sub(&observed)?,
        coordinates: record.coordinates,
        dt: record.dt,
    })
}

fn run_misfit(partition: &Partition, ctx: &SharedContext, model: &SeismicModel) -> Result<TaskOutput> {
    let solver = ctx.solver();
    let mut wavefield = Wavefield::new();
    let mut objective = 0.0;

    for shot in &partition.shots {
        let residual = shot_residual(shot, solver, model, &mut wavefield, false)
            .map_err(|e| FwiError::simulation(shot.id, e))?;
        let misfit = 0.5 * residual.samples.norm_sq();
        debug!(shot_id = shot.id, misfit, "Shot misfit");
        objective += misfit;
    }
    wavefield.release();

    Ok(TaskOutput::Misfit { objective })
}

fn run_gradient(partition: &Partition, ctx: &SharedContext, model: &SeismicModel) -> Result<TaskOutput> {
    let solver = ctx.solver();
    let normalizer = ctx.normalizer.ok_or_else(|| {
        FwiError::Configuration("gradient tasks need an illumination normalizer".to_string())
    })?;

    let mut wavefield = Wavefield::new();
    let mut objective = 0.0;
    // accumulated over the whole partition, never reset between shots
    let mut gradient_sum = Field::zeros(model.padded_shape().to_vec());

    for shot in &partition.shots {
        let shot_gradient = (|| -> Result<(f64, Field)> {
            let residual = shot_residual(shot, solver, model, &mut wavefield, true)?;
            let misfit = 0.5 * residual.samples.norm_sq();
            let (image, illumination) = solver.adjoint_crosscorrelate(&wavefield, &residual, model)?;
            Ok((misfit, normalizer.apply(&image, &illumination)?))
        })()
        .map_err(|e| FwiError::simulation(shot.id, e))?;

        let (misfit, normalized) = shot_gradient;
        debug!(shot_id = shot.id, misfit, "Shot gradient");
        objective += misfit;
        gradient_sum.add_assign(&normalized)?;
    }
    wavefield.release();

    Ok(TaskOutput::Gradient {
        objective,
        gradient: gradient_sum.interior(model.nbl)?,
    })
}
