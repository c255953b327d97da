use thiserror::Error;

use crate::{config_manager::ConfigError, fan_manager::ControlError, platform::PlatformError};

// The main daemon error type
#[derive(Debug, Error)]
pub enum PlatfandError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Control(#[from] ControlError),
}

impl PlatfandError {
    // Read and apply failures are expected on flaky hardware
    // and are recovered every cycle
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PlatfandError::Control(
                ControlError::ReadFailure { .. } | ControlError::ApplyFailure { .. }
            )
        )
    }
}
