use crate::session::SessionPhase;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch { what: &'static str, expected: usize, got: usize },

    #[error("cannot {op} a session in phase {phase}")]
    InvalidState { op: &'static str, phase: SessionPhase },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(what: &'static str, expected: usize, got: usize) -> Self {
        Self::ShapeMismatch { what, expected, got }
    }
}

/// Returns a [Error::ShapeMismatch] unless `got == expected`.
pub(crate) fn check_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::shape(what, expected, got))
    }
}
