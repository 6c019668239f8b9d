use swarmcast_core::StationState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StationError {
    #[error("station is already {}", .0.as_str())]
    Busy(StationState),

    #[error("audio device error: {0:#}")]
    Device(anyhow::Error),

    #[error("discovery error: {0:#}")]
    Substrate(anyhow::Error),

    #[error("station task has stopped")]
    Stopped,
}

impl StationError {
    /// Faults the user can fix by picking another device or retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StationError::Device(_) | StationError::Substrate(_))
    }
}
