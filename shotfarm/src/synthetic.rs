//! Synthetic velocity models for `init-model`
//!
//! A layered "true" model and a starting model obtained from it by
//! Laplacian smoothing, written as the `vp` / `vp_start` documents the
//! forward and inversion runs read.

use crate::config::SolverParams;
use crate::errors::{FwiError, Result};
use crate::field::{strides_of, Field};
use crate::store::{self, GridMetadata};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SmoothConfig {
    pub iterations: usize,
    /// Relaxation factor in `(0, 1]`
    pub lambda: f32,
}

impl Default for SmoothConfig {
    fn default() -> Self {
        Self {
            iterations: 40,
            lambda: 0.5,
        }
    }
}

/// Horizontal layers of equal thickness along the depth axis.
pub fn layered(shape: &[usize], velocities: &[f32]) -> Result<Field> {
    if velocities.is_empty() {
        return Err(FwiError::Configuration("no layer velocities given".to_string()));
    }
    let Some(&nz) = shape.last() else {
        return Err(FwiError::Shape("empty model shape".to_string()));
    };

    let mut field = Field::zeros(shape.to_vec());
    for column in field.data.chunks_mut(nz.max(1)) {
        for (k, v) in column.iter_mut().enumerate() {
            let layer = k * velocities.len() / nz;
            *v = velocities[layer.min(velocities.len() - 1)];
        }
    }
    Ok(field)
}

/// Laplacian smoothing with clamped edges.
pub fn smoothed(field: &Field, config: &SmoothConfig) -> Field {
    let shape = &field.shape;
    let strides = strides_of(shape);
    let mut current = field.clone();
    let mut next = field.clone();

    for _ in 0..config.iterations {
        for (i, out) in next.data.iter_mut().enumerate() {
            let centre = current.data[i];
            let mut sum = 0.0;
            let mut count = 0;
            for (axis, &n) in shape.iter().enumerate() {
                let pos = (i / strides[axis]) % n;
                if pos > 0 {
                    sum += current.data[i - strides[axis]];
                    count += 1;
                }
                if pos + 1 < n {
                    sum += current.data[i + strides[axis]];
                    count += 1;
                }
            }
            *out = if count == 0 {
                centre
            } else {
                centre + config.lambda * (sum / count as f32 - centre)
            };
        }
        std::mem::swap(&mut current, &mut next);
    }
    current
}

/// Write the layered true model and its smoothed start model under the
/// parameter directory.
pub fn write_model_pair(
    params: &SolverParams,
    grid: &GridMetadata,
    velocities: &[f32],
    smoothing: &SmoothConfig,
) -> Result<(PathBuf, PathBuf)> {
    let truth = layered(&grid.shape, velocities)?;
    let start = smoothed(&truth, smoothing);

    let true_path = params.velocity_path();
    let start_path = params.start_model_path();
    store::write_array(&true_path, "vp", &truth, grid)?;
    store::write_array(&start_path, "vp_start", &start, grid)?;

    info!(
        shape = ?grid.shape,
        layers = velocities.len(),
        true_model = %true_path.display(),
        start_model = %start_path.display(),
        "Synthetic models written"
    );
    Ok((true_path, start_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_follow_depth_axis() {
        let field = layered(&[2, 4], &[1.5, 3.0]).unwrap();
        assert_eq!(field.data, vec![1.5, 1.5, 3.0, 3.0, 1.5, 1.5, 3.0, 3.0]);
        assert!(layered(&[2, 4], &[]).is_err());
    }

    #[test]
    fn test_smoothing_stays_in_range() {
        let truth = layered(&[6, 8], &[1.5, 2.5, 3.5]).unwrap();
        let start = smoothed(&truth, &SmoothConfig::default());
        assert_eq!(start.shape, truth.shape);
        assert!(start.data.iter().all(|&v| (1.5..=3.5).contains(&v)));
        assert_ne!(start, truth);

        // a constant model is a fixed point
        let flat = Field::filled(vec![3, 3], 2.0);
        assert_eq!(smoothed(&flat, &SmoothConfig::default()), flat);
    }
}
