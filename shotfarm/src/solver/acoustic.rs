//! Constant-density acoustic solver
//!
//! Solves `m u_tt - lap(u) + damp u_t = src` with `m = 1/vp^2`, second
//! order in time and central differences in space. Units: time in ms,
//! lengths in m, velocity in km/s (= m/ms), frequency in kHz.

use super::model::SeismicModel;
use super::{ricker, ShotRecord, TimeAxis, WaveSolver, Wavefield};
use crate::errors::{FwiError, Result};
use crate::field::{strides_of, Field};
use crate::store::GridMetadata;
use serde::{Deserialize, Serialize};

/// Acoustic solver configuration shared by every shot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcousticSolver {
    /// Simulation start (ms)
    pub t0: f32,
    /// Simulation end (ms)
    pub tn: f32,
    /// Ricker peak frequency (kHz)
    pub f0: f32,
    /// Spatial discretization order
    pub space_order: usize,
}

/// Central second-derivative weights `[c0, c1, ..]` for unit spacing
pub fn laplacian_coefficients(order: usize) -> Result<&'static [f32]> {
    match order {
        2 => Ok(&[-2.0, 1.0]),
        4 => Ok(&[-5.0 / 2.0, 4.0 / 3.0, -1.0 / 12.0]),
        6 => Ok(&[-49.0 / 18.0, 3.0 / 2.0, -3.0 / 20.0, 1.0 / 90.0]),
        8 => Ok(&[-205.0 / 72.0, 8.0 / 5.0, -1.0 / 5.0, 8.0 / 315.0, -1.0 / 560.0]),
        _ => Err(FwiError::Solver(format!("unsupported space order {}", order))),
    }
}

/// Precomputed update weights for one model and time step
struct Stencil {
    coeffs: &'static [f32],
    strides: Vec<usize>,
    inv_h2: Vec<f32>,
    interior: Vec<usize>,
    // u+ = inv_a * (lap + b u - c u-)
    inv_a: Vec<f32>,
    b: Vec<f32>,
    c: Vec<f32>,
    // dt^2 / m for point injection
    inject: Vec<f32>,
}

impl Stencil {
    fn new(model: &SeismicModel, dt: f32) -> Result<Self> {
        let coeffs = laplacian_coefficients(model.space_order)?;
        let shape = model.padded_shape();
        let strides = strides_of(shape);
        let halo = model.halo();
        let n = model.padded_len();

        let interior = (0..n)
            .filter(|&flat| {
                shape.iter().zip(&strides).all(|(&len, &stride)| {
                    let i = (flat / stride) % len;
                    i >= halo && i + halo < len
                })
            })
            .collect();

        let dt2 = dt * dt;
        let mut inv_a = Vec::with_capacity(n);
        let mut b = Vec::with_capacity(n);
        let mut c = Vec::with_capacity(n);
        let mut inject = Vec::with_capacity(n);
        for (&vp, &damp) in model.vp().data.iter().zip(&model.damp().data) {
            let m = 1.0 / (vp * vp);
            let d = damp / (2.0 * dt);
            inv_a.push(1.0 / (m / dt2 + d));
            b.push(2.0 * m / dt2);
            c.push(m / dt2 - d);
            inject.push(dt2 / m);
        }

        Ok(Self {
            coeffs,
            strides,
            inv_h2: model.grid.spacing.iter().map(|h| 1.0 / (h * h)).collect(),
            interior,
            inv_a,
            b,
            c,
            inject,
        })
    }

    /// One leapfrog step: `next` from `cur` and `prev`. The halo is untouched.
    fn step(&self, cur: &[f32], prev: &[f32], next: &mut [f32]) {
        for &p in &self.interior {
            let mut lap = 0.0;
            for (axis, &stride) in self.strides.iter().enumerate() {
                let mut d2 = self.coeffs[0] * cur[p];
                for (k, &w) in self.coeffs.iter().enumerate().skip(1) {
                    d2 += w * (cur[p + k * stride] + cur[p - k * stride]);
                }
                lap += d2 * self.inv_h2[axis];
            }
            next[p] = self.inv_a[p] * (lap + self.b[p] * cur[p] - self.c[p] * prev[p]);
        }
    }
}

impl AcousticSolver {
    fn receiver_indices(model: &SeismicModel, receivers: &[Vec<f32>]) -> Result<Vec<usize>> {
        receivers.iter().map(|r| model.grid_index(r)).collect()
    }
}

impl WaveSolver for AcousticSolver {
    fn build_model(&self, velocity: &Field, grid: &GridMetadata, nbl: usize) -> Result<SeismicModel> {
        SeismicModel::new(velocity, grid.clone(), nbl, self.space_order)
    }

    fn time_axis(&self, model: &SeismicModel, dt: Option<f32>) -> Result<TimeAxis> {
        TimeAxis::new(self.t0, self.tn, dt.unwrap_or_else(|| model.critical_dt()))
    }

    fn forward(
        &self,
        source: &[f32],
        receivers: &[Vec<f32>],
        wavefield: &mut Wavefield,
        model: &SeismicModel,
        dt: Option<f32>,
        save: bool,
    ) -> Result<ShotRecord> {
        let time = self.time_axis(model, dt)?;
        let stencil = Stencil::new(model, time.step)?;
        let wavelet = ricker(self.f0, &time);
        let src = model.grid_index(source)?;
        let recs = Self::receiver_indices(model, receivers)?;

        let n = model.padded_len();
        let nrec = recs.len();
        let mut prev = vec![0.0_f32; n];
        let mut cur = vec![0.0_f32; n];
        let mut next = vec![0.0_f32; n];
        let mut samples = Field::zeros(vec![time.num, nrec]);
        wavefield.reset();

        for t in 0..time.num {
            for (j, &idx) in recs.iter().enumerate() {
                samples.data[t * nrec + j] = cur[idx];
            }
            if save {
                wavefield.push(&cur);
            }
            if t + 1 == time.num {
                break;
            }
            stencil.step(&cur, &prev, &mut next);
            next[src] += wavelet[t] * stencil.inject[src];
            std::mem::swap(&mut prev, &mut cur);
            std::mem::swap(&mut cur, &mut next);
        }

        if samples.data.iter().any(|v| !v.is_finite()) {
            return Err(FwiError::Solver(
                "simulation diverged; check dt against the stable step".to_string(),
            ));
        }

        Ok(ShotRecord {
            samples,
            coordinates: receivers.to_vec(),
            dt: time.step,
        })
    }

    fn adjoint_crosscorrelate(
        &self,
        wavefield: &Wavefield,
        residual: &ShotRecord,
        model: &SeismicModel,
    ) -> Result<(Field, Field)> {
        let [nt, nrec] = residual.samples.shape[..] else {
            return Err(FwiError::Shape(format!(
                "residual must be [nt, nrec], got {:?}",
                residual.samples.shape
            )));
        };
        if wavefield.num_snapshots() != nt {
            return Err(FwiError::Solver(format!(
                "adjoint needs {} saved time steps, wavefield holds {}",
                nt,
                wavefield.num_snapshots()
            )));
        }
        let recs = Self::receiver_indices(model, &residual.coordinates)?;
        if recs.len() != nrec {
            return Err(FwiError::Shape(format!(
                "{} residual traces for {} receivers",
                nrec,
                recs.len()
            )));
        }

        let dt = residual.dt;
        let inv_dt2 = 1.0 / (dt * dt);
        let stencil = Stencil::new(model, dt)?;
        let n = model.padded_len();
        let shape = model.padded_shape().to_vec();
        let mut image = Field::zeros(shape.clone());
        let mut illum = Field::zeros(shape);

        let mut v_next = vec![0.0_f32; n];
        let mut v_cur = vec![0.0_f32; n];
        let mut v_prev = vec![0.0_f32; n];

        for t in (0..nt).rev() {
            let u = wavefield
                .snapshot(t)
                .ok_or_else(|| FwiError::Solver(format!("missing snapshot {}", t)))?;

            if t >= 1 && t + 1 < nt {
                if let (Some(u_prev), Some(u_next)) =
                    (wavefield.snapshot(t - 1), wavefield.snapshot(t + 1))
                {
                    for p in 0..n {
                        let u_tt = (u_next[p] - 2.0 * u[p] + u_prev[p]) * inv_dt2;
                        image.data[p] -= u_tt * v_cur[p];
                    }
                }
            }
            for (acc, &value) in illum.data.iter_mut().zip(u) {
                *acc += value * value;
            }

            if t == 0 {
                break;
            }
            stencil.step(&v_cur, &v_next, &mut v_prev);
            for (j, &idx) in recs.iter().enumerate() {
                v_prev[idx] += residual.samples.data[t * nrec + j] * stencil.inject[idx];
            }
            std::mem::swap(&mut v_next, &mut v_cur);
            std::mem::swap(&mut v_cur, &mut v_prev);
        }

        Ok((image, illum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solver(tn: f32) -> AcousticSolver {
        AcousticSolver {
            t0: 0.0,
            tn,
            f0: 0.025,
            space_order: 4,
        }
    }

    fn homogeneous(nx: usize, nz: usize, vp: f32) -> (Field, GridMetadata) {
        let grid = GridMetadata {
            origin: vec![0.0, 0.0],
            spacing: vec![10.0, 10.0],
            shape: vec![nx, nz],
        };
        (Field::filled(vec![nx, nz], vp), grid)
    }

    #[test]
    fn test_coefficients_sum_to_zero() {
        for order in [2, 4, 6, 8] {
            let c = laplacian_coefficients(order).unwrap();
            let sum: f32 = c[0] + 2.0 * c[1..].iter().sum::<f32>();
            assert!(sum.abs() < 1e-6, "order {}", order);
            assert_eq!(c.len(), order / 2 + 1);
        }
        assert!(laplacian_coefficients(5).is_err());
    }

    #[test]
    fn test_forward_records_symmetric_arrivals() {
        let s = solver(300.0);
        let (vp, grid) = homogeneous(41, 21, 2.0);
        let model = s.build_model(&vp, &grid, 10).unwrap();
        let receivers = vec![vec![100.0, 50.0], vec![300.0, 50.0], vec![380.0, 50.0]];
        let mut wavefield = Wavefield::new();

        let record = s
            .forward(&[200.0, 50.0], &receivers, &mut wavefield, &model, None, false)
            .unwrap();
        let nt = record.samples.shape[0];
        assert_eq!(record.samples.shape[1], 3);
        assert_eq!(wavefield.num_snapshots(), 0);

        let trace = |j: usize| -> Vec<f32> { (0..nt).map(|t| record.samples.data[t * 3 + j]).collect() };
        let (left, right, far) = (trace(0), trace(1), trace(2));
        assert!(left.iter().any(|v| v.abs() > 0.0));
        for (a, b) in left.iter().zip(&right) {
            assert!((a - b).abs() <= 1e-4 * (1.0 + a.abs()));
        }

        // the farther receiver peaks later
        let peak = |tr: &[f32]| {
            tr.iter()
                .enumerate()
                .fold((0, 0.0_f32), |acc, (i, v)| if v.abs() > acc.1 { (i, v.abs()) } else { acc })
                .0
        };
        assert!(peak(far.as_slice()) > peak(left.as_slice()));
    }

    #[test]
    fn test_forward_saves_history() {
        let s = solver(100.0);
        let (vp, grid) = homogeneous(15, 15, 1.5);
        let model = s.build_model(&vp, &grid, 5).unwrap();
        let mut wavefield = Wavefield::new();

        let record = s
            .forward(&[70.0, 70.0], &[vec![70.0, 20.0]], &mut wavefield, &model, None, true)
            .unwrap();
        assert_eq!(wavefield.num_snapshots(), record.samples.shape[0]);
        assert_eq!(record.dt, model.critical_dt());
    }

    #[test]
    fn test_forward_rejects_source_outside() {
        let s = solver(50.0);
        let (vp, grid) = homogeneous(10, 10, 2.0);
        let model = s.build_model(&vp, &grid, 4).unwrap();
        let mut wavefield = Wavefield::new();

        let result = s.forward(&[5000.0, 10.0], &[vec![10.0, 10.0]], &mut wavefield, &model, None, false);
        assert!(matches!(result, Err(FwiError::Solver(_))));
    }

    #[test]
    fn test_adjoint_image_and_illumination() {
        let s = solver(200.0);
        let (vp, grid) = homogeneous(21, 21, 2.0);
        let model = s.build_model(&vp, &grid, 6).unwrap();
        let receivers = vec![vec![50.0, 20.0], vec![150.0, 20.0]];
        let mut wavefield = Wavefield::new();

        let record = s
            .forward(&[100.0, 20.0], &receivers, &mut wavefield, &model, None, true)
            .unwrap();
        let (image, illum) = s.adjoint_crosscorrelate(&wavefield, &record, &model).unwrap();

        assert_eq!(image.shape, model.padded_shape().to_vec());
        assert_eq!(illum.shape, image.shape);
        assert!(illum.data.iter().all(|&v| v >= 0.0));
        assert!(illum.max_abs() > 0.0);
        assert!(image.max_abs() > 0.0);
        assert!(image.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_adjoint_requires_saved_history() {
        let s = solver(50.0);
        let (vp, grid) = homogeneous(10, 10, 2.0);
        let model = s.build_model(&vp, &grid, 4).unwrap();
        let mut wavefield = Wavefield::new();
        let record = s
            .forward(&[40.0, 40.0], &[vec![40.0, 10.0]], &mut wavefield, &model, None, false)
            .unwrap();

        assert!(s.adjoint_crosscorrelate(&wavefield, &record, &model).is_err());
    }
}
