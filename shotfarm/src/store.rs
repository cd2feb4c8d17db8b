//! Structured array storage and the current-model handoff slot
//!
//! Velocity models and inversion results are stored as one CBOR document
//! per file: a named `f32` array, its shape and a JSON metadata string.
//! The model slot holds the padded velocity of the current inversion
//! iterate. The coordinator publishes it before every dispatch and workers
//! read it during the evaluation.

use crate::errors::{FwiError, Result};
use crate::field::Field;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk form of a named array
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayDocument {
    /// Dataset name inside the file
    pub key: String,
    /// Array shape
    pub shape: Vec<usize>,
    /// Flattened row-major data
    pub data: Vec<f32>,
    /// JSON-encoded metadata
    pub metadata: String,
}

/// Grid description stored alongside velocity models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridMetadata {
    /// Physical coordinate of the first grid point (m)
    pub origin: Vec<f32>,
    /// Grid spacing per axis (m)
    pub spacing: Vec<f32>,
    /// Interior grid shape
    pub shape: Vec<usize>,
}

impl GridMetadata {
    /// Physical extent per axis (m)
    pub fn extent(&self) -> Vec<f32> {
        self.shape
            .iter()
            .zip(&self.spacing)
            .map(|(&n, &h)| (n.saturating_sub(1)) as f32 * h)
            .collect()
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);
    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Write `field` under `key` with JSON-encoded `metadata`.
pub fn write_array<M: Serialize>(path: &Path, key: &str, field: &Field, metadata: &M) -> Result<()> {
    let document = ArrayDocument {
        key: key.to_string(),
        shape: field.shape.clone(),
        data: field.data.clone(),
        metadata: serde_json::to_string(metadata)?,
    };
    let mut bytes = Vec::new();
    ciborium::into_writer(&document, &mut bytes)?;
    write_atomic(path, &bytes)?;

    debug!(
        key,
        shape = ?field.shape,
        size_bytes = bytes.len(),
        path = %path.display(),
        "Array written"
    );
    Ok(())
}

/// Read the array stored under `key`, returning it with its raw metadata.
pub fn read_array(path: &Path, key: &str) -> Result<(Field, String)> {
    let bytes = fs::read(path)?;
    let document: ArrayDocument = ciborium::from_reader(bytes.as_slice())?;
    if document.key != key {
        return Err(FwiError::Serialization(format!(
            "{} holds dataset '{}', expected '{}'",
            path.display(),
            document.key,
            key
        )));
    }
    let field = Field::new(document.data, document.shape)?;
    Ok((field, document.metadata))
}

/// Read a velocity model together with its grid metadata.
pub fn read_model(path: &Path, key: &str) -> Result<(Field, GridMetadata)> {
    let (field, metadata) = read_array(path, key)?;
    let grid: GridMetadata = serde_json::from_str(&metadata)?;
    if grid.shape != field.shape {
        return Err(FwiError::Shape(format!(
            "metadata shape {:?} vs stored array {:?}",
            grid.shape, field.shape
        )));
    }
    Ok((field, grid))
}

/// Raw little-endian f32 dump
pub fn write_raw(path: &Path, field: &Field) -> Result<()> {
    let bytes: Vec<u8> = field.data.iter().flat_map(|v| v.to_le_bytes()).collect();
    write_atomic(path, &bytes)
}

#[derive(Debug, Serialize, Deserialize)]
struct SlotContents {
    iteration: u64,
    velocity: Field,
}

/// Single-writer, many-reader slot holding the current padded velocity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSlot {
    path: PathBuf,
}

impl ModelSlot {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the slot with a new iterate.
    pub fn publish(&self, iteration: u64, velocity: &Field) -> Result<()> {
        let contents = SlotContents {
            iteration,
            velocity: velocity.clone(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&contents, &mut bytes)?;
        write_atomic(&self.path, &bytes)?;

        info!(
            iteration,
            path = %self.path.display(),
            size_bytes = bytes.len(),
            "Current model published"
        );
        Ok(())
    }

    /// Read the most recently published iterate.
    pub fn load(&self) -> Result<(u64, Field)> {
        let bytes = fs::read(&self.path).map_err(|e| {
            FwiError::Io(std::io::Error::new(
                e.kind(),
                format!("model slot {}: {}", self.path.display(), e),
            ))
        })?;
        let contents: SlotContents = ciborium::from_reader(bytes.as_slice())?;
        Ok((contents.iteration, contents.velocity))
    }
}
