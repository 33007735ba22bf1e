/// Main library error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A caller-supplied value failed validation before any state was touched.
    #[error("{0}")]
    InvalidArgument(String),

    /// The requested operation is not available on this model.
    #[error("{0}")]
    Runtime(String),

    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
