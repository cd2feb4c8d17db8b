//! Shot catalog
//!
//! The catalog is the full set of shot tasks for a run, keyed by shot id.
//! Forward runs synthesize it from the acquisition geometry in the
//! configuration; inversion runs scan the trace files in the shot
//! directory, one task per field record.

use crate::config::{RunConfig, RunMode};
use crate::errors::{FwiError, Result};
use crate::segy::{self, ShotHeader};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Where the recorded data of a shot lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRef {
    pub path: PathBuf,
    pub trace_offset: usize,
    pub trace_count: usize,
}

/// One unit of simulation work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotTask {
    /// Unique id within the run
    pub id: u32,
    /// Source coordinate, `[x, z]` or `[x, y, z]` (m)
    pub source_position: Vec<f32>,
    /// Receiver coordinates in trace order
    pub receiver_positions: Vec<Vec<f32>>,
    /// Observed data reference (inversion only)
    pub observed: Option<TraceRef>,
}

/// All shot tasks of a run, ordered by id
#[derive(Debug, Clone, Default)]
pub struct ShotCatalog {
    shots: BTreeMap<u32, ShotTask>,
}

/// `n` evenly spaced values over `[start, stop]`, endpoints included
pub fn linspace(start: f32, stop: f32, n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) as f64 / (n - 1) as f64;
            (0..n).map(|i| (start as f64 + step * i as f64) as f32).collect()
        }
    }
}

impl ShotCatalog {
    /// Build the catalog for the configured run mode.
    pub fn build(config: &RunConfig) -> Result<Self> {
        match config.mode()? {
            RunMode::Forward => Self::forward(
                config.nshots,
                config.nrecs,
                config.model_size,
                config.src_depth,
                config.rec_depth,
            ),
            RunMode::Inversion => Self::from_trace_dir(&config.solver_params.shotfile_path),
        }
    }

    /// Sources and receivers spread over `[0, model_size]`; every shot
    /// listens on the same receiver line.
    pub fn forward(
        nshots: usize,
        nrecs: usize,
        model_size: f32,
        src_depth: f32,
        rec_depth: f32,
    ) -> Result<Self> {
        if nshots == 0 || nrecs == 0 {
            return Err(FwiError::Configuration(format!(
                "forward modeling needs shots and receivers (nshots={}, nrecs={})",
                nshots, nrecs
            )));
        }

        let receivers: Vec<Vec<f32>> = linspace(0.0, model_size, nrecs)
            .into_iter()
            .map(|x| vec![x, rec_depth])
            .collect();

        let shots = linspace(0.0, model_size, nshots)
            .into_iter()
            .enumerate()
            .map(|(i, x)| {
                let id = i as u32;
                let task = ShotTask {
                    id,
                    source_position: vec![x, src_depth],
                    receiver_positions: receivers.clone(),
                    observed: None,
                };
                (id, task)
            })
            .collect();

        info!(nshots, nrecs, model_size, "Forward shot catalog built");
        Ok(Self { shots })
    }

    /// Scan every `.segy` file in `dir` (sorted by name).
    ///
    /// A field record already claimed by an earlier file is renumbered past
    /// the largest id seen so far.
    pub fn from_trace_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(FwiError::Configuration(format!(
                "shot directory not found: {}",
                dir.display()
            )));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "segy").unwrap_or(false))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(FwiError::Configuration(format!(
                "no .segy files in {}",
                dir.display()
            )));
        }

        let mut shots = BTreeMap::new();
        for file in &files {
            for (record, header) in segy::scan_headers(file)? {
                let id = if shots.contains_key(&record) {
                    let next = shots.keys().next_back().map(|k| k + 1).unwrap_or(0);
                    warn!(
                        record,
                        new_id = next,
                        file = %file.display(),
                        "Duplicate field record, renumbering"
                    );
                    next
                } else {
                    record
                };
                shots.insert(id, task_from_header(id, header));
            }
        }

        info!(
            files = files.len(),
            nshots = shots.len(),
            dir = %dir.display(),
            "Shot catalog scanned from trace files"
        );
        Ok(Self { shots })
    }

    pub fn len(&self) -> usize {
        self.shots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shots.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&ShotTask> {
        self.shots.get(&id)
    }

    /// Tasks in ascending id order
    pub fn tasks(&self) -> Vec<ShotTask> {
        self.shots.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.shots.keys().copied().collect()
    }
}

fn task_from_header(id: u32, header: ShotHeader) -> ShotTask {
    // y stays out of the positions for 2D acquisitions
    let planar =
        header.source[1] == 0.0 && header.receivers.iter().all(|r| r[1] == 0.0);
    let position = |c: [f32; 3]| {
        if planar {
            vec![c[0], c[2]]
        } else {
            c.to_vec()
        }
    };

    ShotTask {
        id,
        source_position: position(header.source),
        receiver_positions: header.receivers.iter().map(|&r| position(r)).collect(),
        observed: Some(TraceRef {
            path: header.path,
            trace_offset: header.trace_offset,
            trace_count: header.trace_count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;
    use tempfile::TempDir;

    #[test]
    fn test_linspace_endpoints() {
        assert_eq!(linspace(0.0, 100.0, 5), vec![0.0, 25.0, 50.0, 75.0, 100.0]);
        assert_eq!(linspace(3.0, 9.0, 1), vec![3.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_forward_catalog_geometry() {
        let catalog = ShotCatalog::forward(3, 4, 300.0, 20.0, 10.0).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.ids(), vec![0, 1, 2]);

        let shot = catalog.get(1).unwrap();
        assert_eq!(shot.source_position, vec![150.0, 20.0]);
        assert_eq!(shot.receiver_positions.len(), 4);
        assert_eq!(shot.receiver_positions[3], vec![300.0, 10.0]);
        assert!(shot.observed.is_none());

        // the receiver line is shared by every shot
        let first = catalog.get(0).unwrap();
        assert_eq!(first.receiver_positions, shot.receiver_positions);
    }

    #[test]
    fn test_forward_catalog_rejects_empty() {
        assert!(matches!(
            ShotCatalog::forward(0, 4, 100.0, 0.0, 0.0),
            Err(FwiError::Configuration(_))
        ));
    }

    #[test]
    fn test_scan_directory_with_duplicate_records() {
        let temp_dir = TempDir::new().unwrap();
        let recs = vec![vec![0.0, 5.0], vec![10.0, 5.0]];
        let samples = Field::zeros(vec![4, 2]);
        let a = temp_dir.path().join("a.segy");
        let b = temp_dir.path().join("b.segy");
        segy::write_traces(&samples, &[1.0, 2.0], &recs, 1.0, 1, &a).unwrap();
        segy::write_traces(&samples, &[7.0, 2.0], &recs, 1.0, 1, &b).unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = ShotCatalog::from_trace_dir(temp_dir.path()).unwrap();
        assert_eq!(catalog.ids(), vec![1, 2]);

        let renumbered = catalog.get(2).unwrap();
        assert_eq!(renumbered.source_position, vec![7.0, 2.0]);
        assert_eq!(renumbered.receiver_positions, recs);
        let trace_ref = renumbered.observed.as_ref().unwrap();
        assert_eq!(trace_ref.path, b);
        assert_eq!(trace_ref.trace_count, 2);
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            ShotCatalog::from_trace_dir(temp_dir.path()),
            Err(FwiError::Configuration(_))
        ));
    }
}
