use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum BaseError {
    StringError(String),
    InvalidArchive(String),
    IoError(Arc<std::io::Error>),
    BincodeError(Arc<bincode::Error>),
    JsonError(Arc<serde_json::Error>),
}

impl std::error::Error for BaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            BaseError::StringError(_) => None,
            BaseError::InvalidArchive(_) => None,
            BaseError::IoError(ref e) => Some(&**e),
            BaseError::BincodeError(ref e) => Some(&**e),
            BaseError::JsonError(ref e) => Some(&**e),
        }
    }
}

impl core::fmt::Display for BaseError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            BaseError::StringError(ref e) => e.fmt(fmt),
            BaseError::InvalidArchive(ref e) => write!(fmt, "invalid bundle archive: {}", e),
            BaseError::IoError(ref e) => e.fmt(fmt),
            BaseError::BincodeError(ref e) => e.fmt(fmt),
            BaseError::JsonError(ref e) => e.fmt(fmt),
        }
    }
}

impl From<&str> for BaseError {
    fn from(str: &str) -> Self {
        BaseError::StringError(str.to_string())
    }
}

impl From<String> for BaseError {
    fn from(string: String) -> Self {
        BaseError::StringError(string)
    }
}

impl From<std::io::Error> for BaseError {
    fn from(error: std::io::Error) -> Self {
        BaseError::IoError(Arc::new(error))
    }
}

impl From<bincode::Error> for BaseError {
    fn from(error: bincode::Error) -> Self {
        BaseError::BincodeError(Arc::new(error))
    }
}

impl From<serde_json::Error> for BaseError {
    fn from(error: serde_json::Error) -> Self {
        BaseError::JsonError(Arc::new(error))
    }
}

pub type BaseResult<T> = Result<T, BaseError>;
