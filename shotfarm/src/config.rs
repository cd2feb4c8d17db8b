//! Run configuration
//!
//! A run is described by one TOML file. The top-level `forward` and `fwi`
//! flags select the run mode and are mutually exclusive. Cluster sizing and
//! solver parameters live in their own tables:
//!
//! ```toml
//! forward = true
//! fwi = false
//! nshots = 24
//! nrecs = 480
//! src_depth = 20.0
//! rec_depth = 20.0
//! model_size = 17000.0
//!
//! [cluster]
//! use_local_cluster = true
//! n_workers = 4
//!
//! [solver_params]
//! shotfile_path = "./marmousi2/shots/"
//! parfile_path = "./marmousi2/parameters/"
//! t0 = 0.0
//! tn = 3840.0
//! dt = 8.0
//! f0 = 0.004
//! model_name = "marmousi2"
//! nbl = 80
//! space_order = 8
//! dtype = "float32"
//! ```

use crate::errors::{FwiError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which pipeline a configuration drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Synthetic shot generation
    Forward,
    /// Full-waveform inversion
    Inversion,
}

/// Floating point type of the simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Float32,
    Float64,
}

impl Precision {
    /// Machine epsilon of the working type
    pub fn epsilon(self) -> f64 {
        match self {
            Precision::Float32 => f32::EPSILON as f64,
            Precision::Float64 => f64::EPSILON,
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Run workers on this host instead of a batch scheduler
    pub use_local_cluster: bool,
    /// Number of workers (batch jobs when not local)
    pub n_workers: usize,
    /// Processes per batch job
    pub processes: usize,
    /// Cores per batch job
    pub cores: usize,
    /// Memory per batch job in GB
    pub memory_gb: u64,
    /// Scheduler queue name
    pub queue: String,
    /// Scheduler account/project
    pub project: String,
    /// Extra scheduler directives
    pub job_extra: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            use_local_cluster: true,
            n_workers: 4,
            processes: 1,
            cores: 36,
            memory_gb: 320,
            queue: "queue_name".to_string(),
            project: "project_name".to_string(),
            job_extra: vec![
                "-e slurm-%j.err".to_string(),
                "-o slurm-%j.out".to_string(),
                "--job-name=\"shot_task\"".to_string(),
            ],
        }
    }
}

impl ClusterConfig {
    /// Number of concurrent shot-simulation slots across the pool
    pub fn worker_slots(&self) -> usize {
        if self.use_local_cluster {
            self.n_workers
        } else {
            self.n_workers * self.processes
        }
    }
}

/// Discretization and file layout shared by every shot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SolverParams {
    /// Directory holding trace files
    pub shotfile_path: PathBuf,
    /// Directory holding velocity models
    pub parfile_path: PathBuf,
    /// Start time (ms)
    pub t0: f32,
    /// End time (ms)
    pub tn: f32,
    /// Output sample interval (ms); the stable interval is used when absent
    #[serde(default)]
    pub dt: Option<f32>,
    /// Source peak frequency (kHz)
    pub f0: f32,
    /// Model name used in shot file names
    pub model_name: String,
    /// Absorbing boundary width in cells
    pub nbl: usize,
    /// Spatial discretization order
    pub space_order: usize,
    /// Working floating point type
    #[serde(default)]
    pub dtype: Precision,
}

impl SolverParams {
    /// Path of the true (or base) velocity model
    pub fn velocity_path(&self) -> PathBuf {
        self.parfile_path.join("vp.cbor")
    }

    /// Path of the inversion starting model
    pub fn start_model_path(&self) -> PathBuf {
        self.parfile_path.join("vp_start.cbor")
    }

    /// Directory receiving final inversion results
    pub fn results_path(&self) -> PathBuf {
        self.parfile_path.join("..").join("results")
    }

    /// Trace file for a generated shot
    pub fn shot_file(&self, shot_id: u32) -> PathBuf {
        shot_file_path(&self.shotfile_path, &self.model_name, shot_id)
    }

    /// Reject time windows and discretizations the solver cannot run.
    pub fn validate(&self) -> Result<()> {
        if !self.t0.is_finite() || !self.tn.is_finite() || self.tn <= self.t0 {
            return Err(FwiError::Configuration(format!(
                "time window needs t0 < tn, got t0={} tn={}",
                self.t0, self.tn
            )));
        }
        if let Some(dt) = self.dt {
            if !dt.is_finite() || dt <= 0.0 {
                return Err(FwiError::Configuration(format!(
                    "output dt must be positive, got {}",
                    dt
                )));
            }
        }
        if !self.f0.is_finite() || self.f0 <= 0.0 {
            return Err(FwiError::Configuration(format!(
                "peak frequency must be positive, got {}",
                self.f0
            )));
        }
        if !matches!(self.space_order, 2 | 4 | 6 | 8) {
            return Err(FwiError::Configuration(format!(
                "space_order must be 2, 4, 6 or 8, got {}",
                self.space_order
            )));
        }
        Ok(())
    }
}

/// `<dir>/shot_<id>_suheader_<model>.segy`
pub fn shot_file_path(dir: &Path, model_name: &str, shot_id: u32) -> PathBuf {
    dir.join(format!("shot_{:03}_suheader_{}.segy", shot_id, model_name))
}

/// Built-in acquisition setups
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModelPreset {
    Marmousi2,
}

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Forward modeling mode
    #[serde(default)]
    pub forward: bool,
    /// Inversion mode
    #[serde(default)]
    pub fwi: bool,
    /// Number of synthetic shots (forward mode)
    #[serde(default)]
    pub nshots: usize,
    /// Number of receivers per shot (forward mode)
    #[serde(default)]
    pub nrecs: usize,
    /// Source depth (m)
    #[serde(default)]
    pub src_depth: f32,
    /// Receiver depth (m)
    #[serde(default)]
    pub rec_depth: f32,
    /// Horizontal extent covered by sources and receivers (m)
    #[serde(default)]
    pub model_size: f32,
    /// Lowest expected velocity (km/s)
    #[serde(default)]
    pub vmin: Option<f32>,
    /// Highest expected velocity (km/s)
    #[serde(default)]
    pub vmax: Option<f32>,
    /// Near-surface gradient rows to zero after reduction
    #[serde(default)]
    pub mute_depth: Option<usize>,
    /// Directory for the current-model handoff slot
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Worker pool sizing
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Solver parameters
    pub solver_params: SolverParams,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

impl RunConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(FwiError::Configuration(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let toml_str = fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&toml_str)?;
        config.solver_params.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let toml_string = toml::to_string_pretty(self)?;
        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, &toml_string)?;
        fs::rename(&temp_path, path)?;

        tracing::info!(path = %path.display(), "Run configuration saved");
        Ok(())
    }

    /// Resolve the run mode, rejecting contradictory flags and invalid
    /// solver parameters.
    pub fn mode(&self) -> Result<RunMode> {
        self.solver_params.validate()?;
        match (self.forward, self.fwi) {
            (true, true) => Err(FwiError::Configuration(
                "forward and fwi cannot both be true".to_string(),
            )),
            (false, false) => Err(FwiError::Configuration(
                "one of forward or fwi must be true".to_string(),
            )),
            (true, false) => Ok(RunMode::Forward),
            (false, true) => Ok(RunMode::Inversion),
        }
    }

    /// Fail unless the configuration selects `expected`.
    pub fn require_mode(&self, expected: RunMode) -> Result<()> {
        let mode = self.mode()?;
        if mode != expected {
            return Err(FwiError::Configuration(format!(
                "{:?} run requested with a {:?} configuration",
                expected, mode
            )));
        }
        Ok(())
    }

    /// Slowness-squared box bounds `(1/vmax^2, 1/vmin^2)`
    pub fn slowness_bounds(&self) -> Result<(f32, f32)> {
        match (self.vmin, self.vmax) {
            (Some(vmin), Some(vmax)) if vmin > 0.0 && vmax >= vmin => {
                Ok((1.0 / (vmax * vmax), 1.0 / (vmin * vmin)))
            }
            _ => Err(FwiError::Configuration(
                "inversion requires 0 < vmin <= vmax".to_string(),
            )),
        }
    }

    /// Path of the current-model handoff slot
    pub fn model_slot_path(&self) -> PathBuf {
        self.work_dir.join("current_model.cbor")
    }

    /// Override geometry and solver parameters with a preset for forward
    /// modeling at peak frequency `fpeak_hz`.
    pub fn apply_preset(&mut self, preset: ModelPreset, fpeak_hz: f32) {
        let mut params = preset_params(preset);
        match preset {
            ModelPreset::Marmousi2 => {
                self.src_depth = 20.0;
                self.rec_depth = 20.0;
                self.nrecs = 480;
                self.nshots = 24;
                self.model_size = 17000.0;
            }
        }
        params.f0 = fpeak_hz / 1000.0;
        params.shotfile_path = params
            .shotfile_path
            .join(format!("{}Hz", fpeak_hz.round() as i64));
        self.solver_params = params;
        self.forward = true;
        self.fwi = false;
    }

    /// Switch to inversion mode with the preset's velocity bounds and mute.
    pub fn prepare_inversion(&mut self, preset: ModelPreset) {
        self.forward = false;
        self.fwi = true;
        match preset {
            ModelPreset::Marmousi2 => {
                self.vmin = Some(1.377);
                self.vmax = Some(4.688);
                self.mute_depth = Some(12);
            }
        }
        self.solver_params = preset_params(preset);
    }
}

fn preset_params(preset: ModelPreset) -> SolverParams {
    match preset {
        ModelPreset::Marmousi2 => SolverParams {
            shotfile_path: PathBuf::from("./marmousi2/shots/"),
            parfile_path: PathBuf::from("./marmousi2/parameters/"),
            t0: 0.0,
            tn: 3840.0,
            dt: Some(8.0),
            f0: 0.004,
            model_name: "marmousi2".to_string(),
            nbl: 80,
            space_order: 8,
            dtype: Precision::Float32,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> RunConfig {
        RunConfig {
            forward: true,
            fwi: false,
            nshots: 4,
            nrecs: 10,
            src_depth: 20.0,
            rec_depth: 20.0,
            model_size: 1000.0,
            vmin: None,
            vmax: None,
            mute_depth: None,
            work_dir: PathBuf::from("."),
            cluster: ClusterConfig::default(),
            solver_params: preset_params(ModelPreset::Marmousi2),
        }
    }

    #[test]
    fn test_mode_selection() {
        let mut config = test_config();
        assert_eq!(config.mode().unwrap(), RunMode::Forward);

        config.forward = false;
        config.fwi = true;
        assert_eq!(config.mode().unwrap(), RunMode::Inversion);
    }

    #[test]
    fn test_mode_rejects_both_and_neither() {
        let mut config = test_config();
        config.fwi = true;
        assert!(matches!(config.mode(), Err(FwiError::Configuration(_))));

        config.forward = false;
        config.fwi = false;
        assert!(matches!(config.mode(), Err(FwiError::Configuration(_))));
    }

    #[test]
    fn test_worker_slots() {
        let mut cluster = ClusterConfig {
            n_workers: 3,
            processes: 4,
            ..Default::default()
        };
        assert_eq!(cluster.worker_slots(), 3);
        cluster.use_local_cluster = false;
        assert_eq!(cluster.worker_slots(), 12);
    }

    #[test]
    fn test_missing_cluster_table_uses_defaults() {
        let toml_str = r#"
            fwi = true
            vmin = 1.5
            vmax = 4.5

            [solver_params]
            shotfile_path = "shots"
            parfile_path = "params"
            t0 = 0.0
            tn = 1000.0
            f0 = 0.01
            model_name = "layers"
            nbl = 10
            space_order = 4
        "#;
        let config: RunConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.cluster, ClusterConfig::default());
        assert_eq!(config.solver_params.dt, None);
        assert_eq!(config.solver_params.dtype, Precision::Float32);
        assert_eq!(config.mode().unwrap(), RunMode::Inversion);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config").join("config.toml");

        let config = test_config();
        config.save(&path).unwrap();
        let loaded = RunConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let result = RunConfig::load(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(FwiError::Configuration(_))));
    }

    #[test]
    fn test_slowness_bounds() {
        let mut config = test_config();
        assert!(config.slowness_bounds().is_err());

        config.vmin = Some(2.0);
        config.vmax = Some(4.0);
        let (lb, ub) = config.slowness_bounds().unwrap();
        assert_eq!(lb, 1.0 / 16.0);
        assert_eq!(ub, 0.25);
    }

    #[test]
    fn test_apply_preset() {
        let mut config = test_config();
        config.fwi = true;
        config.apply_preset(ModelPreset::Marmousi2, 4.0);

        assert_eq!(config.mode().unwrap(), RunMode::Forward);
        assert_eq!(config.nshots, 24);
        assert_eq!(config.nrecs, 480);
        assert!((config.solver_params.f0 - 0.004).abs() < 1e-9);
        assert!(config.solver_params.shotfile_path.ends_with("4Hz"));
    }

    #[test]
    fn test_prepare_inversion() {
        let mut config = test_config();
        config.prepare_inversion(ModelPreset::Marmousi2);
        assert_eq!(config.mode().unwrap(), RunMode::Inversion);
        assert_eq!(config.mute_depth, Some(12));
        assert_eq!(config.vmin, Some(1.377));
    }

    #[test]
    fn test_require_mode() {
        let mut config = test_config();
        assert!(config.require_mode(RunMode::Forward).is_ok());
        assert!(matches!(
            config.require_mode(RunMode::Inversion),
            Err(FwiError::Configuration(_))
        ));

        config.solver_params.dt = Some(0.0);
        assert!(config.require_mode(RunMode::Forward).is_err());
    }

    #[test]
    fn test_invalid_time_sampling_rejected() {
        let mut config = test_config();
        config.solver_params.dt = Some(0.0);
        assert!(matches!(config.mode(), Err(FwiError::Configuration(_))));

        config.solver_params.dt = Some(-4.0);
        assert!(matches!(config.mode(), Err(FwiError::Configuration(_))));

        config.solver_params.dt = Some(4.0);
        config.solver_params.tn = config.solver_params.t0;
        assert!(matches!(config.mode(), Err(FwiError::Configuration(_))));

        config.solver_params.tn = 1000.0;
        config.solver_params.space_order = 5;
        assert!(config.solver_params.validate().is_err());

        config.solver_params.space_order = 4;
        assert_eq!(config.mode().unwrap(), RunMode::Forward);
    }

    #[test]
    fn test_load_rejects_zero_dt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        let mut config = test_config();
        config.solver_params.dt = Some(0.0);
        config.save(&path).unwrap();

        let result = RunConfig::load(&path);
        assert!(matches!(result, Err(FwiError::Configuration(_))));
    }

    #[test]
    fn test_shot_file_name() {
        let params = preset_params(ModelPreset::Marmousi2);
        let path = params.shot_file(7);
        assert!(path.ends_with("shot_007_suheader_marmousi2.segy"));
    }

    #[test]
    fn test_precision_epsilon() {
        assert_eq!(Precision::Float32.epsilon(), f32::EPSILON as f64);
        assert_eq!(Precision::Float64.epsilon(), f64::EPSILON);
    }
}
