//! Inversion drivers
//!
//! An optimizer only sees an [`Objective`]: it hands over a flat iterate
//! (squared slowness) and gets back the misfit and/or its gradient. The
//! drivers are a closed set of L-BFGS configurations selected on the
//! command line.

pub mod lbfgs;

pub use lbfgs::{LbfgsConfig, LbfgsResult, StopReason};

use crate::errors::{FwiError, Result};
use crate::field::Field;
use crate::store::{self, GridMetadata};
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

/// Misfit functional over a flat model vector
#[async_trait]
pub trait Objective: Send {
    async fn value_and_gradient(&mut self, x: &[f32]) -> Result<(f64, Vec<f32>)>;

    async fn value(&mut self, x: &[f32]) -> Result<f64>;

    async fn gradient(&mut self, x: &[f32]) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum InversionDriver {
    /// 20 iterations, 10 correction pairs
    LbfgsScipy,
    /// 35 objective evaluations, 10 correction pairs
    LbfgsNlopt,
    /// 20 iterations, 20 line-search trials, 5 correction pairs
    LbfgsSotb,
    /// 20 iterations, value-only line search
    LbfgsRol,
}

impl InversionDriver {
    pub fn lbfgs_config(self) -> LbfgsConfig {
        match self {
            InversionDriver::LbfgsScipy => LbfgsConfig {
                max_iter: 20,
                memory: 10,
                ..Default::default()
            },
            InversionDriver::LbfgsNlopt => LbfgsConfig {
                max_iter: usize::MAX,
                max_feval: 35,
                memory: 10,
                ..Default::default()
            },
            InversionDriver::LbfgsSotb => LbfgsConfig {
                max_iter: 20,
                max_line_search: 20,
                memory: 5,
                ..Default::default()
            },
            InversionDriver::LbfgsRol => LbfgsConfig {
                max_iter: 20,
                memory: 10,
                value_only_line_search: true,
                ..Default::default()
            },
        }
    }

    /// Suffix of the result files written by this driver
    pub fn result_tag(self) -> &'static str {
        match self {
            InversionDriver::LbfgsScipy => "scipy_LBFGSB",
            InversionDriver::LbfgsNlopt => "NLoptLD_LBFGS",
            InversionDriver::LbfgsSotb => "LB",
            InversionDriver::LbfgsRol => "pyrol_LBFGS",
        }
    }

    /// Minimize `objective` from the squared-slowness field `x0` within
    /// `bounds` and return the final velocity.
    pub async fn run_inversion<O: Objective + ?Sized>(
        self,
        objective: &mut O,
        x0: &Field,
        bounds: (f32, f32),
    ) -> Result<FinalModel> {
        let started = Instant::now();
        let (lower, upper) = bounds;
        info!(driver = ?self, unknowns = x0.len(), lower, upper, "Inversion started");

        let result = lbfgs::minimize(objective, &x0.data, lower, upper, &self.lbfgs_config()).await?;

        let velocity = slowness_to_velocity(&Field::new(result.x, x0.shape.clone())?)?;
        let initial_gradient = Field::new(result.initial_gradient, x0.shape.clone())?;

        info!(
            driver = ?self,
            objective = result.f,
            iterations = result.n_iter,
            evaluations = result.n_feval,
            stop = ?result.stop,
            elapsed_s = started.elapsed().as_secs_f64(),
            "Inversion finished"
        );
        Ok(FinalModel {
            driver: self,
            velocity,
            initial_gradient,
            objective: result.f,
            iterations: result.n_iter,
            evaluations: result.n_feval,
            stop: result.stop,
        })
    }
}

/// Outcome of an inversion run
#[derive(Debug, Clone, PartialEq)]
pub struct FinalModel {
    pub driver: InversionDriver,
    /// Interior velocity (km/s)
    pub velocity: Field,
    /// Gradient at the starting model
    pub initial_gradient: Field,
    pub objective: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub stop: StopReason,
}

impl FinalModel {
    /// Write `vp_final_result_<tag>.file` (raw f32) and `.cbor` under
    /// `results_dir`. Returns the structured document path.
    pub fn write(&self, results_dir: &Path, grid: &GridMetadata) -> Result<PathBuf> {
        let stem = format!("vp_final_result_{}", self.driver.result_tag());
        let raw = results_dir.join(format!("{}.file", stem));
        let document = results_dir.join(format!("{}.cbor", stem));

        store::write_raw(&raw, &self.velocity)?;
        store::write_array(&document, "vp", &self.velocity, grid)?;
        if self.driver == InversionDriver::LbfgsSotb {
            store::write_raw(&results_dir.join("gradient_zero.file"), &self.initial_gradient)?;
        }

        info!(path = %document.display(), "Final model written");
        Ok(document)
    }
}

/// `1 / v^2` for every cell
pub fn velocity_to_slowness(velocity: &Field) -> Result<Field> {
    map_positive(velocity, |v| 1.0 / (v * v))
}

/// `1 / sqrt(x)` for every cell
pub fn slowness_to_velocity(slowness: &Field) -> Result<Field> {
    map_positive(slowness, |x| 1.0 / x.sqrt())
}

fn map_positive(field: &Field, f: impl Fn(f32) -> f32) -> Result<Field> {
    if let Some(bad) = field.data.iter().find(|v| !v.is_finite() || **v <= 0.0) {
        return Err(FwiError::Solver(format!(
            "expected positive finite values, found {}",
            bad
        )));
    }
    Field::new(field.data.iter().map(|&v| f(v)).collect(), field.shape.clone())
}
