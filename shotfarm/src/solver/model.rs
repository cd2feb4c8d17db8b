//! Padded velocity model with an absorbing boundary layer

use crate::errors::{FwiError, Result};
use crate::field::{strides_of, Field};
use crate::store::GridMetadata;
use serde::{Deserialize, Serialize};

/// Supported spatial discretization orders
pub const SPACE_ORDERS: [usize; 4] = [2, 4, 6, 8];

/// Velocity model extended by `nbl` damping cells on every side.
///
/// Velocities are in km/s, spacing and origin in metres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeismicModel {
    /// Interior grid description
    pub grid: GridMetadata,
    /// Damping layer width in cells
    pub nbl: usize,
    /// Spatial discretization order
    pub space_order: usize,
    vp: Field,
    damp: Field,
}

impl SeismicModel {
    /// Pad `velocity` (interior shape) and build the damping profile.
    pub fn new(velocity: &Field, grid: GridMetadata, nbl: usize, space_order: usize) -> Result<Self> {
        if velocity.shape != grid.shape {
            return Err(FwiError::Shape(format!(
                "velocity shape {:?} vs grid shape {:?}",
                velocity.shape, grid.shape
            )));
        }
        let ndim = grid.shape.len();
        if !(2..=3).contains(&ndim) || grid.spacing.len() != ndim || grid.origin.len() != ndim {
            return Err(FwiError::Solver(format!(
                "models must be 2D or 3D with matching origin and spacing, got shape {:?}",
                grid.shape
            )));
        }
        if grid.spacing.iter().any(|&h| h <= 0.0) {
            return Err(FwiError::Solver(format!(
                "grid spacing must be positive: {:?}",
                grid.spacing
            )));
        }
        if !SPACE_ORDERS.contains(&space_order) {
            return Err(FwiError::Solver(format!(
                "unsupported space order {}",
                space_order
            )));
        }

        let vp = velocity.expand(nbl);
        check_velocity(&vp)?;
        let damp = damping_profile(&vp.shape, nbl, &grid.spacing);

        Ok(Self {
            grid,
            nbl,
            space_order,
            vp,
            damp,
        })
    }

    pub fn ndim(&self) -> usize {
        self.grid.shape.len()
    }

    /// Shape including the damping layer
    pub fn padded_shape(&self) -> &[usize] {
        &self.vp.shape
    }

    pub fn padded_len(&self) -> usize {
        self.vp.len()
    }

    /// Padded velocity
    pub fn vp(&self) -> &Field {
        &self.vp
    }

    /// Padded damping coefficients
    pub fn damp(&self) -> &Field {
        &self.damp
    }

    /// Stencil half-width; these outermost cells are never updated.
    pub fn halo(&self) -> usize {
        self.space_order / 2
    }

    /// Replace the padded velocity with a new iterate of the same shape.
    pub fn update_velocity(&mut self, padded: Field) -> Result<()> {
        if padded.shape != self.vp.shape {
            return Err(FwiError::Shape(format!(
                "padded velocity {:?} vs model {:?}",
                padded.shape, self.vp.shape
            )));
        }
        check_velocity(&padded)?;
        self.vp = padded;
        Ok(())
    }

    /// Largest stable time step (ms)
    pub fn critical_dt(&self) -> f32 {
        let coeff = if self.ndim() == 3 { 0.38 } else { 0.42 };
        let h_min = self.grid.spacing.iter().fold(f32::INFINITY, |a, &h| a.min(h));
        let v_max = self.vp.max_abs();
        coeff * h_min / v_max
    }

    /// Flat padded index of the grid point nearest to `position`.
    pub fn grid_index(&self, position: &[f32]) -> Result<usize> {
        if position.len() != self.ndim() {
            return Err(FwiError::Solver(format!(
                "{}D position {:?} in a {}D model",
                position.len(),
                position,
                self.ndim()
            )));
        }
        let shape = self.padded_shape();
        let strides = strides_of(shape);
        let halo = self.halo() as isize;
        let mut offset = 0;
        for axis in 0..self.ndim() {
            let cell = ((position[axis] - self.grid.origin[axis]) / self.grid.spacing[axis]).round();
            let i = cell as isize + self.nbl as isize;
            if i < halo || i >= shape[axis] as isize - halo {
                return Err(FwiError::Solver(format!(
                    "position {:?} lies outside the model",
                    position
                )));
            }
            offset += i as usize * strides[axis];
        }
        Ok(offset)
    }
}

fn check_velocity(vp: &Field) -> Result<()> {
    if vp.data.iter().any(|&v| !(v.is_finite() && v > 0.0)) {
        return Err(FwiError::Solver(
            "velocity must be positive and finite everywhere".to_string(),
        ));
    }
    Ok(())
}

/// Damping coefficients that grow towards the outer edge of the padding.
fn damping_profile(shape: &[usize], nbl: usize, spacing: &[f32]) -> Field {
    let mut damp = Field::zeros(shape.to_vec());
    if nbl == 0 {
        return damp;
    }
    let coeff = 1.5 * (1.0_f64 / 0.001).ln() / nbl as f64;
    let strides = strides_of(shape);

    for (axis, &n) in shape.iter().enumerate() {
        let h = spacing[axis] as f64;
        for i in 0..nbl {
            let pos = ((nbl - i + 1) as f64 / nbl as f64).abs();
            let value = coeff * (pos - (2.0 * std::f64::consts::PI * pos).sin() / (2.0 * std::f64::consts::PI));
            let value = (value / h) as f32;
            for layer in [i, n - 1 - i] {
                for (flat, v) in damp.data.iter_mut().enumerate() {
                    if (flat / strides[axis]) % n == layer {
                        *v += value;
                    }
                }
            }
        }
    }
    damp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(shape: Vec<usize>) -> GridMetadata {
        let ndim = shape.len();
        GridMetadata {
            origin: vec![0.0; ndim],
            spacing: vec![10.0; ndim],
            shape,
        }
    }

    #[test]
    fn test_padding_and_damping() {
        let velocity = Field::filled(vec![6, 5], 2.0);
        let model = SeismicModel::new(&velocity, grid(vec![6, 5]), 4, 4).unwrap();

        assert_eq!(model.padded_shape(), &[14, 13]);
        assert!(model.vp().data.iter().all(|&v| v == 2.0));

        let nz = 13;
        let center = 7 * nz + 6;
        let edge = 6;
        assert_eq!(model.damp().data[center], 0.0);
        assert!(model.damp().data[edge] > 0.0);
        // profile decreases towards the interior
        assert!(model.damp().data[edge] > model.damp().data[2 * nz + 6]);
    }

    #[test]
    fn test_critical_dt() {
        let mut velocity = Field::filled(vec![4, 4], 1.5);
        velocity.data[5] = 3.0;
        let model = SeismicModel::new(&velocity, grid(vec![4, 4]), 2, 2).unwrap();
        assert!((model.critical_dt() - 0.42 * 10.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_grid_index() {
        let velocity = Field::filled(vec![5, 4], 2.0);
        let model = SeismicModel::new(&velocity, grid(vec![5, 4]), 3, 4).unwrap();
        // padded shape [11, 10]
        let idx = model.grid_index(&[20.0, 12.0]).unwrap();
        assert_eq!(idx, (2 + 3) * 10 + (1 + 3));
        assert!(model.grid_index(&[20.0]).is_err());
        assert!(model.grid_index(&[-100.0, 0.0]).is_err());
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let velocity = Field::filled(vec![4, 4], 2.0);
        assert!(matches!(
            SeismicModel::new(&velocity, grid(vec![4, 5]), 2, 4),
            Err(FwiError::Shape(_))
        ));
        assert!(SeismicModel::new(&velocity, grid(vec![4, 4]), 2, 3).is_err());

        let mut negative = velocity.clone();
        negative.data[0] = -1.0;
        assert!(SeismicModel::new(&negative, grid(vec![4, 4]), 2, 4).is_err());
    }

    #[test]
    fn test_update_velocity_checks_shape() {
        let velocity = Field::filled(vec![4, 4], 2.0);
        let mut model = SeismicModel::new(&velocity, grid(vec![4, 4]), 2, 4).unwrap();
        assert!(model.update_velocity(Field::filled(vec![4, 4], 2.0)).is_err());
        model.update_velocity(Field::filled(vec![8, 8], 3.0)).unwrap();
        assert_eq!(model.vp().max_abs(), 3.0);
    }
}
