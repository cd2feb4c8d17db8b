//! Combines per-partition results into the global objective and gradient.
//!
//! Partials are summed in partition order regardless of the order they
//! arrived in, so a run with the same partitioning reduces to the same
//! floating point result every time.

use crate::errors::{FwiError, Result};
use crate::field::Field;
use crate::worker::{PartialResult, TaskOutput};
use tracing::debug;

/// Objective and gradient for one model evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalResult {
    pub objective: f64,
    pub gradient: Field,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResultReducer {
    /// Shallow cells zeroed in the reduced gradient
    mute_depth: Option<usize>,
}

impl ResultReducer {
    pub fn new(mute_depth: Option<usize>) -> Self {
        Self { mute_depth }
    }

    /// Sum gradient partials and apply the shallow mute once.
    pub fn reduce(&self, mut partials: Vec<PartialResult>) -> Result<GlobalResult> {
        partials.sort_by_key(|p| p.partition);

        let mut objective = 0.0;
        let mut gradient: Option<Field> = None;
        for partial in &partials {
            let TaskOutput::Gradient {
                objective: part_objective,
                gradient: part_gradient,
            } = &partial.output
            else {
                return Err(FwiError::Cluster(format!(
                    "partition {} returned no gradient",
                    partial.partition
                )));
            };
            objective += part_objective;
            match gradient.as_mut() {
                Some(sum) => sum.add_assign(part_gradient)?,
                None => gradient = Some(part_gradient.clone()),
            }
        }

        let mut gradient =
            gradient.ok_or_else(|| FwiError::Cluster("no partial results to reduce".to_string()))?;
        if let Some(depth) = self.mute_depth {
            gradient.mute_shallow(depth);
        }

        debug!(
            partitions = partials.len(),
            objective,
            max_gradient = gradient.max_abs(),
            "Partials reduced"
        );
        Ok(GlobalResult { objective, gradient })
    }

    /// Sum the misfit of every partial.
    pub fn reduce_objective(&self, mut partials: Vec<PartialResult>) -> Result<f64> {
        if partials.is_empty() {
            return Err(FwiError::Cluster("no partial results to reduce".to_string()));
        }
        partials.sort_by_key(|p| p.partition);

        partials.iter().try_fold(0.0, |acc, partial| match &partial.output {
            TaskOutput::Misfit { objective } | TaskOutput::Gradient { objective, .. } => {
                Ok(acc + objective)
            }
            TaskOutput::Written { .. } => Err(FwiError::Cluster(format!(
                "partition {} returned no misfit",
                partial.partition
            ))),
        })
    }
}
