use thiserror::Error;

/// Errors produced by the intent-detection engine and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("roster store error: {0}")]
    Store(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("vision backend error: {0}")]
    Backend(String),

    #[error("session already finished")]
    SessionClosed,
}

#[cfg(feature = "opencv")]
impl From<opencv::Error> for Error {
    fn from(err: opencv::Error) -> Self {
        Error::Backend(err.to_string())
    }
}

#[cfg(feature = "torch")]
impl From<tch::TchError> for Error {
    fn from(err: tch::TchError) -> Self {
        Error::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
