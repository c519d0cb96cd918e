/// Result alias that carries the custom [`PlayerError`] type.
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Common error type for the core crate.
///
/// Only construction and control-plane paths return these. The pull path
/// (`AudioStream::read`) never fails; it reports exhaustion through short
/// reads and logs everything else.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// Free-form failure, mostly poisoned locks on the control plane.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration file could not be parsed or serialised.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// A configuration value violates an invariant.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// An argument handed to a DSP routine has the wrong shape.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// The audio device could not be opened or driven.
    #[error("audio device: {0}")]
    Device(String),
}

impl PlayerError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }
}

impl From<&str> for PlayerError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for PlayerError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
