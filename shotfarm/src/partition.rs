//! Balanced contiguous partitioning of the shot catalog
//!
//! With `n` tasks and `p` slots, `c = n / p` and `r = n % p`: the first `r`
//! partitions get `c + 1` tasks and the rest get `c`. Blocks are contiguous
//! in catalog order, so concatenating the partitions gives back the input.

use crate::catalog::ShotTask;
use crate::errors::{FwiError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Shots assigned to one worker slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Position in scatter order; results are reduced in this order
    pub index: usize,
    /// Shots run sequentially by the owning task
    pub shots: Vec<ShotTask>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.shots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shots.is_empty()
    }

    pub fn shot_ids(&self) -> Vec<u32> {
        self.shots.iter().map(|s| s.id).collect()
    }
}

/// Block sizes for `n` items over `p` slots (no clamping)
pub fn partition_sizes(n: usize, p: usize) -> Vec<usize> {
    if p == 0 {
        return Vec::new();
    }
    let (c, r) = (n / p, n % p);
    (0..p).map(|i| if i < r { c + 1 } else { c }).collect()
}

/// Split `items` into balanced contiguous blocks.
///
/// `p` is clamped to `n` so no block is empty.
pub fn split_balanced<T>(items: Vec<T>, p: usize) -> Result<Vec<Vec<T>>> {
    let n = items.len();
    if n == 0 || p == 0 {
        return Err(FwiError::PartitionSize { shots: n, slots: p });
    }
    let slots = if n < p {
        warn!(shots = n, slots = p, "Fewer shots than worker slots, clamping");
        n
    } else {
        p
    };

    let mut blocks = Vec::with_capacity(slots);
    let mut rest = items.into_iter();
    for size in partition_sizes(n, slots) {
        blocks.push(rest.by_ref().take(size).collect());
    }
    Ok(blocks)
}

/// Partition shot tasks over `p` worker slots.
pub fn partition(tasks: Vec<ShotTask>, p: usize) -> Result<Vec<Partition>> {
    let partitions: Vec<Partition> = split_balanced(tasks, p)?
        .into_iter()
        .enumerate()
        .map(|(index, shots)| Partition { index, shots })
        .collect();

    debug!(
        partitions = partitions.len(),
        sizes = ?partitions.iter().map(Partition::len).collect::<Vec<_>>(),
        "Shots partitioned"
    );
    Ok(partitions)
}
