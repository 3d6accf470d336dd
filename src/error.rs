use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no session with ID {0}")]
    NoSession(u64),
    #[error("invalid session ID {0:?}")]
    InvalidId(String),
    #[error("cannot find any container matching pod {pod:?}, container {container:?}")]
    NoContainers { pod: String, container: String },
    #[error("cannot find trace hook {0}")]
    UnknownHook(String),
    #[error("tracing session {0} is running already")]
    AlreadyRunning(u64),
    #[error("tracing session {0} is not started")]
    NotRunning(u64),
    #[error("failed to generate a session ID after {0} attempts")]
    IdExhausted(usize),
    #[error(transparent)]
    Process(#[from] anyhow::Error),
}

impl Error {
    pub fn is_resolution(&self) -> bool {
        matches!(self, Self::NoSession(_) | Self::NoContainers { .. } | Self::UnknownHook(_))
    }

    pub fn is_state(&self) -> bool {
        matches!(self, Self::AlreadyRunning(_) | Self::NotRunning(_))
    }
}
