//! Wave-equation solver interface
//!
//! The scheduling layer only talks to the solver through [`WaveSolver`]:
//! build a padded model, run a forward simulation for one shot and
//! back-propagate a residual to get a gradient image. [`SolverSpec`] names
//! a concrete solver so it can travel inside the broadcast context.

pub mod acoustic;
pub mod model;

pub use acoustic::AcousticSolver;
pub use model::SeismicModel;

use crate::errors::{FwiError, Result};
use crate::field::Field;
use crate::store::GridMetadata;
use serde::{Deserialize, Serialize};

/// Uniform time sampling (ms)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeAxis {
    pub start: f32,
    pub step: f32,
    pub num: usize,
}

impl TimeAxis {
    /// Cover `[start, stop]` with `step`; the last sample may pass `stop`.
    pub fn new(start: f32, stop: f32, step: f32) -> Result<Self> {
        if step.is_nan() || step <= 0.0 || stop < start {
            return Err(FwiError::Solver(format!(
                "invalid time axis start={} stop={} step={}",
                start, stop, step
            )));
        }
        let num = ((stop - start + step) as f64 / step as f64).ceil() as usize;
        Ok(Self { start, step, num })
    }

    /// Time of the last sample
    pub fn stop(&self) -> f32 {
        self.start + self.step * (self.num.saturating_sub(1)) as f32
    }

    pub fn time(&self, i: usize) -> f32 {
        self.start + self.step * i as f32
    }
}

/// Ricker wavelet with peak frequency `f0` (kHz) delayed by `1/f0`.
pub fn ricker(f0: f32, time: &TimeAxis) -> Vec<f32> {
    let t0 = 1.0 / f0 as f64;
    (0..time.num)
        .map(|i| {
            let r = std::f64::consts::PI * f0 as f64 * (time.time(i) as f64 - t0);
            ((1.0 - 2.0 * r * r) * (-r * r).exp()) as f32
        })
        .collect()
}

/// Linearly interpolate `[nt, ntr]` traces sampled on `from` at the
/// times of `to`. Times outside `from` take the nearest end sample.
pub fn resample(samples: &Field, from: &TimeAxis, to: &TimeAxis) -> Result<Field> {
    let [nt, ntr] = samples.shape[..] else {
        return Err(FwiError::Shape(format!(
            "traces must be [nt, ntr], got {:?}",
            samples.shape
        )));
    };
    if nt != from.num || nt == 0 || to.num == 0 {
        return Err(FwiError::Shape(format!(
            "cannot resample {} samples on a {}-sample axis to {}",
            nt, from.num, to.num
        )));
    }
    if from == to {
        return Ok(samples.clone());
    }

    let last = (nt - 1) as f64;
    let mut out = Field::zeros(vec![to.num, ntr]);
    for k in 0..to.num {
        // fractional index of the output time on the input axis
        let x = ((to.time(k) - from.start) as f64 / from.step as f64).clamp(0.0, last);
        let i0 = x.floor() as usize;
        let i1 = (i0 + 1).min(nt - 1);
        let w = (x - i0 as f64) as f32;
        for j in 0..ntr {
            let a = samples.data[i0 * ntr + j];
            let b = samples.data[i1 * ntr + j];
            out.data[k * ntr + j] = a + w * (b - a);
        }
    }
    Ok(out)
}

/// Receiver data of one simulation
#[derive(Debug, Clone, PartialEq)]
pub struct ShotRecord {
    /// Samples shaped `[nt, nrec]`
    pub samples: Field,
    /// Receiver positions in trace order
    pub coordinates: Vec<Vec<f32>>,
    /// Sample interval (ms)
    pub dt: f32,
}

/// Time history of a simulation; the largest per-shot allocation.
#[derive(Debug, Default)]
pub struct Wavefield {
    snapshots: Vec<Vec<f32>>,
}

impl Wavefield {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the recorded history before a new shot; only the outer
    /// vector keeps its capacity.
    pub fn reset(&mut self) {
        self.snapshots.clear();
    }

    /// Drop every buffer.
    pub fn release(&mut self) {
        self.snapshots = Vec::new();
    }

    pub fn num_snapshots(&self) -> usize {
        self.snapshots.len()
    }

    pub fn snapshot(&self, t: usize) -> Option<&[f32]> {
        self.snapshots.get(t).map(Vec::as_slice)
    }

    pub(crate) fn push(&mut self, state: &[f32]) {
        self.snapshots.push(state.to_vec());
    }
}

/// Operations the scheduling layer needs from a PDE solver
pub trait WaveSolver: Send + Sync {
    /// Pad an interior velocity field into a simulation model.
    fn build_model(&self, velocity: &Field, grid: &GridMetadata, nbl: usize) -> Result<SeismicModel>;

    /// Simulate one shot and record it at `receivers`.
    ///
    /// `dt` defaults to the model's critical step. With `save` the full
    /// time history is kept in `wavefield` for a later adjoint run.
    fn forward(
        &self,
        source: &[f32],
        receivers: &[Vec<f32>],
        wavefield: &mut Wavefield,
        model: &SeismicModel,
        dt: Option<f32>,
        save: bool,
    ) -> Result<ShotRecord>;

    /// Back-propagate `residual` and correlate it with the saved forward
    /// wavefield. Returns padded `(image, illumination)`.
    fn adjoint_crosscorrelate(
        &self,
        wavefield: &Wavefield,
        residual: &ShotRecord,
        model: &SeismicModel,
    ) -> Result<(Field, Field)>;

    /// Simulation time axis for a model
    fn time_axis(&self, model: &SeismicModel, dt: Option<f32>) -> Result<TimeAxis>;
}

/// Serializable choice of solver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SolverSpec {
    Acoustic(AcousticSolver),
}

impl SolverSpec {
    pub fn solver(&self) -> &dyn WaveSolver {
        match self {
            SolverSpec::Acoustic(s) => s,
        }
    }

    /// Simulated time window `(t0, tn)` in ms
    pub fn time_range(&self) -> (f32, f32) {
        match self {
            SolverSpec::Acoustic(s) => (s.t0, s.tn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_axis_num() {
        let axis = TimeAxis::new(0.0, 100.0, 8.0).unwrap();
        assert_eq!(axis.num, 14);
        assert!(axis.stop() >= 100.0);

        let exact = TimeAxis::new(0.0, 100.0, 10.0).unwrap();
        assert_eq!(exact.num, 11);
        assert_eq!(exact.stop(), 100.0);

        assert!(TimeAxis::new(0.0, 100.0, 0.0).is_err());
    }

    #[test]
    fn test_ricker_peak_at_delay() {
        let axis = TimeAxis::new(0.0, 500.0, 1.0).unwrap();
        let wavelet = ricker(0.01, &axis);
        // peak at t = 1/f0 = 100 ms
        let (argmax, max) = wavelet
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        assert_eq!(argmax, 100);
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_resample_linear() {
        let samples = Field::new(vec![0.0, 10.0, 2.0, 12.0, 4.0, 14.0], vec![3, 2]).unwrap();
        let from = TimeAxis::new(0.0, 4.0, 2.0).unwrap();
        let to = TimeAxis::new(0.0, 4.0, 1.0).unwrap();
        let out = resample(&samples, &from, &to).unwrap();
        assert_eq!(out.shape, vec![5, 2]);
        let first: Vec<f32> = (0..5).map(|k| out.data[k * 2]).collect();
        assert_eq!(first, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(out.data[9], 14.0);

        assert_eq!(resample(&samples, &from, &from).unwrap(), samples);
        assert!(resample(&samples, &to, &from).is_err());
        assert!(resample(&Field::zeros(vec![4]), &from, &to).is_err());
    }

    #[test]
    fn test_resample_keeps_physical_time() {
        // simulation axis runs past 100 ms: 0, 8, .., 104
        let from = TimeAxis::new(0.0, 100.0, 8.0).unwrap();
        let ramp: Vec<f32> = (0..from.num).map(|i| from.time(i)).collect();
        let samples = Field::new(ramp, vec![from.num, 1]).unwrap();

        let to = TimeAxis::new(0.0, 100.0, 4.0).unwrap();
        assert_eq!(to.num, 26);
        let out = resample(&samples, &from, &to).unwrap();
        for k in 0..to.num {
            assert!((out.data[k] - to.time(k)).abs() < 1e-4, "t={} got {}", to.time(k), out.data[k]);
        }

        // longer output window clamps to the last recorded sample
        let longer = TimeAxis::new(0.0, 120.0, 8.0).unwrap();
        let out = resample(&samples, &from, &longer).unwrap();
        assert_eq!(out.data[longer.num - 1], 104.0);
    }

    #[test]
    fn test_wavefield_release() {
        let mut wavefield = Wavefield::new();
        wavefield.push(&[1.0, 2.0]);
        assert_eq!(wavefield.num_snapshots(), 1);
        wavefield.reset();
        assert_eq!(wavefield.num_snapshots(), 0);
        assert!(wavefield.snapshots.capacity() >= 1);
        wavefield.push(&[1.0]);
        wavefield.release();
        assert!(wavefield.snapshot(0).is_none());
        assert_eq!(wavefield.snapshots.capacity(), 0);
    }
}
