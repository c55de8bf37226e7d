use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instance {0} not found")]
    NotFound(u32),
    #[error("instance limit reached ({0})")]
    LimitReached(usize),
    #[error("invalid instance config: {0}")]
    InvalidConfig(String),
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("kill failed: {0}")]
    KillFailed(String),
    #[error("instance {0} is being restarted or stopped, try again")]
    Busy(u32),
    #[error("health check failed for instance {0}")]
    HealthCheckFailed(u32),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
