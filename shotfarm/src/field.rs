//! Dense real-valued fields on a regular grid
//!
//! `Field` is the single array type used for velocity models, gradients,
//! illumination images, wavefield snapshots and recorded traces. Data is
//! stored row-major (last axis fastest). For model-shaped fields the last
//! axis is depth, so one "depth row" is the set of samples sharing a depth
//! index.

use crate::errors::{FwiError, Result};
use serde::{Deserialize, Serialize};

/// Flattened array with an explicit shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Flattened data, row-major
    pub data: Vec<f32>,
    /// Shape of the field (e.g. [nx, nz] or [nt, nrec])
    pub shape: Vec<usize>,
}

impl Field {
    /// Create a field from data and shape.
    ///
    /// # Errors
    /// Returns `FwiError::Shape` if the data length doesn't match the
    /// product of the shape dimensions.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected_len: usize = shape.iter().product();
        if data.len() != expected_len {
            return Err(FwiError::Shape(format!(
                "data length {} doesn't match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self { data, shape })
    }

    /// Create a field filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        Self {
            data: vec![0.0; len],
            shape,
        }
    }

    /// Create a field filled with a constant value
    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len: usize = shape.iter().product();
        Self {
            data: vec![value; len],
            shape,
        }
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the field is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of axes
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Row-major strides in elements
    pub fn strides(&self) -> Vec<usize> {
        strides_of(&self.shape)
    }

    /// Reset every element to `value` without reallocating
    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Reinterpret the data under a new shape with the same element count
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        Field::new(self.data, shape)
    }

    /// Element-wise in-place accumulation
    pub fn add_assign(&mut self, other: &Field) -> Result<()> {
        self.check_same_shape(other)?;
        self.data
            .iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
        Ok(())
    }

    /// Element-wise addition of two fields
    pub fn add(&self, other: &Field) -> Result<Field> {
        let mut out = self.clone();
        out.add_assign(other)?;
        Ok(out)
    }

    /// Element-wise difference `self - other`
    pub fn sub(&self, other: &Field) -> Result<Field> {
        self.check_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a - b)
            .collect();
        Ok(Field {
            data,
            shape: self.shape.clone(),
        })
    }

    /// Squared L2 norm, accumulated in f64
    pub fn norm_sq(&self) -> f64 {
        self.data.iter().map(|&v| (v as f64) * (v as f64)).sum()
    }

    /// Largest absolute value (0 for an empty field)
    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0_f32, |m, v| m.max(v.abs()))
    }

    /// Zero the shallowest `depth` rows along the last (depth) axis.
    ///
    /// A `depth` larger than the axis zeroes everything.
    pub fn mute_shallow(&mut self, depth: usize) {
        let Some(&nz) = self.shape.last() else {
            return;
        };
        if nz == 0 || depth == 0 {
            return;
        }
        let cut = depth.min(nz);
        for column in self.data.chunks_mut(nz) {
            column[..cut].iter_mut().for_each(|v| *v = 0.0);
        }
    }

    /// Pad every axis with `nbl` cells on both sides, replicating edge values.
    pub fn expand(&self, nbl: usize) -> Field {
        if nbl == 0 {
            return self.clone();
        }
        let new_shape: Vec<usize> = self.shape.iter().map(|n| n + 2 * nbl).collect();
        let src_strides = self.strides();
        let len: usize = new_shape.iter().product();
        let mut data = Vec::with_capacity(len);
        let mut index = vec![0usize; new_shape.len()];

        for _ in 0..len {
            let mut offset = 0;
            for (axis, &i) in index.iter().enumerate() {
                let n = self.shape[axis];
                let inner = i.saturating_sub(nbl).min(n.saturating_sub(1));
                offset += inner * src_strides[axis];
            }
            data.push(self.data[offset]);
            advance(&mut index, &new_shape);
        }

        Field {
            data,
            shape: new_shape,
        }
    }

    /// Crop `nbl` cells from both sides of every axis.
    pub fn interior(&self, nbl: usize) -> Result<Field> {
        if nbl == 0 {
            return Ok(self.clone());
        }
        if self.shape.iter().any(|&n| n <= 2 * nbl) {
            return Err(FwiError::Shape(format!(
                "cannot crop {} boundary cells from shape {:?}",
                nbl, self.shape
            )));
        }
        let new_shape: Vec<usize> = self.shape.iter().map(|n| n - 2 * nbl).collect();
        let src_strides = self.strides();
        let len: usize = new_shape.iter().product();
        let mut data = Vec::with_capacity(len);
        let mut index = vec![0usize; new_shape.len()];

        for _ in 0..len {
            let offset: usize = index
                .iter()
                .zip(&src_strides)
                .map(|(&i, &s)| (i + nbl) * s)
                .sum();
            data.push(self.data[offset]);
            advance(&mut index, &new_shape);
        }

        Ok(Field {
            data,
            shape: new_shape,
        })
    }

    fn check_same_shape(&self, other: &Field) -> Result<()> {
        if self.shape != other.shape {
            return Err(FwiError::Shape(format!(
                "{:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(())
    }
}

/// Row-major strides for a shape
pub fn strides_of(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

// Row-major odometer increment
fn advance(index: &mut [usize], shape: &[usize]) {
    for axis in (0..index.len()).rev() {
        index[axis] += 1;
        if index[axis] < shape[axis] {
            return;
        }
        index[axis] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_new_shape_mismatch() {
        let result = Field::new(vec![1.0, 2.0, 3.0], vec![4]);
        assert!(matches!(result, Err(FwiError::Shape(_))));
    }

    #[test]
    fn test_field_add() {
        let a = Field::new(vec![1.0, 2.0, 3.0], vec![3]).unwrap();
        let b = Field::new(vec![4.0, 5.0, 6.0], vec![3]).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.data, vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_field_add_shape_mismatch() {
        let a = Field::zeros(vec![2, 2]);
        let b = Field::zeros(vec![4]);
        assert!(a.add(&b).is_err());
    }

    #[test]
    fn test_field_sub_and_norm() {
        let a = Field::new(vec![3.0, 4.0], vec![2]).unwrap();
        let b = Field::zeros(vec![2]);
        let d = a.sub(&b).unwrap();
        assert_eq!(d.norm_sq(), 25.0);
        assert_eq!(d.max_abs(), 4.0);
    }

    #[test]
    fn test_strides() {
        assert_eq!(strides_of(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides_of(&[5]), vec![1]);
    }

    #[test]
    fn test_mute_shallow_zeroes_exact_rows() {
        // shape [nx=3, nz=4], value encodes (ix, iz)
        let data: Vec<f32> = (0..12).map(|i| (i + 1) as f32).collect();
        let mut field = Field::new(data.clone(), vec![3, 4]).unwrap();
        field.mute_shallow(2);

        for ix in 0..3 {
            for iz in 0..4 {
                let idx = ix * 4 + iz;
                if iz < 2 {
                    assert_eq!(field.data[idx], 0.0);
                } else {
                    assert_eq!(field.data[idx], data[idx]);
                }
            }
        }
    }

    #[test]
    fn test_mute_shallow_deeper_than_axis() {
        let mut field = Field::filled(vec![2, 3], 1.0);
        field.mute_shallow(10);
        assert!(field.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_expand_replicates_edges() {
        let field = Field::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let big = field.expand(1);
        assert_eq!(big.shape, vec![4, 4]);
        #[rustfmt::skip]
        let expected = vec![
            1.0, 1.0, 2.0, 2.0,
            1.0, 1.0, 2.0, 2.0,
            3.0, 3.0, 4.0, 4.0,
            3.0, 3.0, 4.0, 4.0,
        ];
        assert_eq!(big.data, expected);
    }

    #[test]
    fn test_expand_then_interior_restores() {
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let field = Field::new(data, vec![2, 3, 4]).unwrap();
        let big = field.expand(3);
        assert_eq!(big.shape, vec![8, 9, 10]);
        assert_eq!(big.interior(3).unwrap(), field);
    }

    #[test]
    fn test_interior_too_small() {
        let field = Field::zeros(vec![4, 4]);
        assert!(field.interior(2).is_err());
    }
}
