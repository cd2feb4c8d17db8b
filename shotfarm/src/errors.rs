use thiserror::Error;

/// Errors that can occur while scheduling, running or reducing shot work.
#[derive(Error, Debug)]
pub enum FwiError {
    /// Contradictory or missing run-mode configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The shot catalog cannot be spread over the worker slots
    #[error("Partition size error: {shots} shot(s) for {slots} worker slot(s)")]
    PartitionSize { shots: usize, slots: usize },

    /// A single shot simulation failed inside a partition task
    #[error("Simulation failed for shot {shot_id}: {source}")]
    Simulation {
        shot_id: u32,
        #[source]
        source: Box<FwiError>,
    },

    /// Forward modeling finished with one or more failed shots
    #[error("Simulation failed for {} shot(s): {shot_ids:?}", shot_ids.len())]
    ShotsFailed { shot_ids: Vec<u32> },

    /// Broadcast, dispatch or gather transport failure
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Malformed or unsupported trace file
    #[error("Trace format error: {0}")]
    TraceFormat(String),

    /// Array shapes that do not line up
    #[error("Shape mismatch: {0}")]
    Shape(String),

    /// Numerical solver rejected its inputs
    #[error("Solver error: {0}")]
    Solver(String),

    /// IO error occurred (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for shotfarm operations.
pub type Result<T> = std::result::Result<T, FwiError>;

impl FwiError {
    /// Wrap an error raised while simulating `shot_id`.
    pub fn simulation(shot_id: u32, source: FwiError) -> Self {
        FwiError::Simulation {
            shot_id,
            source: Box::new(source),
        }
    }

    /// Shot ids this error is attributed to, if any.
    pub fn failed_shots(&self) -> Vec<u32> {
        match self {
            FwiError::Simulation { shot_id, .. } => vec![*shot_id],
            FwiError::ShotsFailed { shot_ids } => shot_ids.clone(),
            _ => Vec::new(),
        }
    }
}

impl From<toml::ser::Error> for FwiError {
    fn from(e: toml::ser::Error) -> Self {
        FwiError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for FwiError {
    fn from(e: toml::de::Error) -> Self {
        FwiError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for FwiError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        FwiError::Serialization(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for FwiError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        FwiError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FwiError {
    fn from(e: serde_json::Error) -> Self {
        FwiError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FwiError::Configuration("forward and fwi both set".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: forward and fwi both set"
        );
    }

    #[test]
    fn test_simulation_error_keeps_shot() {
        let err = FwiError::simulation(7, FwiError::Solver("unstable".to_string()));
        assert_eq!(err.to_string(), "Simulation failed for shot 7: Solver error: unstable");
        assert_eq!(err.failed_shots(), vec![7]);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_shots_failed_display() {
        let err = FwiError::ShotsFailed {
            shot_ids: vec![1, 4],
        };
        assert_eq!(err.to_string(), "Simulation failed for 2 shot(s): [1, 4]");
        assert_eq!(err.failed_shots(), vec![1, 4]);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FwiError = io_err.into();
        assert!(err.to_string().contains("IO error"));
        assert!(err.failed_shots().is_empty());
    }
}
