use cask_base::BaseError;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum LoadError {
    // Caller passed an empty name
    NameEmpty,
    // Name is not in the manifest and is not an external raw file
    ManifestEntryMissing(String),
    BundleOpenFailed {
        bundle: String,
        reason: String,
    },
    DependencyLoadFailed {
        asset: String,
        dependency: String,
        reason: Box<LoadError>,
    },
    ExtractionFailed {
        asset: String,
        bundle: String,
    },
    TransferFailed {
        bundle: String,
        reason: String,
    },
    ChecksumMismatch {
        bundle: String,
        expected: String,
        actual: String,
    },
    // Source refused to resume at this offset (HTTP 416)
    RangeNotSatisfiable {
        url: String,
        offset: u64,
    },
    Cancelled,
    // Unload of something that holds no references
    NotLoaded(String),
    InvalidHandler,
    // Operation needs a handler that is still in flight
    NotInFlight,
    AlreadyBound(String),
    StringError(String),
    IoError(Arc<std::io::Error>),
    BaseError(BaseError),
    BincodeError(Arc<bincode::Error>),
    JsonError(Arc<serde_json::Error>),
    HttpError(Arc<reqwest::Error>),
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            LoadError::DependencyLoadFailed { ref reason, .. } => Some(&**reason),
            LoadError::IoError(ref e) => Some(&**e),
            LoadError::BaseError(ref e) => Some(e),
            LoadError::BincodeError(ref e) => Some(&**e),
            LoadError::JsonError(ref e) => Some(&**e),
            LoadError::HttpError(ref e) => Some(&**e),
            _ => None,
        }
    }
}

impl core::fmt::Display for LoadError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            LoadError::NameEmpty => "name is empty".fmt(fmt),
            LoadError::ManifestEntryMissing(ref name) => {
                write!(fmt, "{} is not in the manifest", name)
            }
            LoadError::BundleOpenFailed {
                ref bundle,
                ref reason,
            } => write!(fmt, "failed to open bundle {}: {}", bundle, reason),
            LoadError::DependencyLoadFailed {
                ref asset,
                ref dependency,
                ref reason,
            } => write!(
                fmt,
                "dependency {} of {} failed to load: {}",
                dependency, asset, reason
            ),
            LoadError::ExtractionFailed {
                ref asset,
                ref bundle,
            } => write!(fmt, "asset {} could not be extracted from bundle {}", asset, bundle),
            LoadError::TransferFailed {
                ref bundle,
                ref reason,
            } => write!(fmt, "download of {} failed: {}", bundle, reason),
            LoadError::ChecksumMismatch {
                ref bundle,
                ref expected,
                ref actual,
            } => write!(
                fmt,
                "checksum mismatch for {}: expected {} got {}",
                bundle, expected, actual
            ),
            LoadError::RangeNotSatisfiable { ref url, offset } => {
                write!(fmt, "{} cannot be resumed at byte {}", url, offset)
            }
            LoadError::Cancelled => "cancelled".fmt(fmt),
            LoadError::NotLoaded(ref name) => write!(fmt, "{} is not loaded", name),
            LoadError::InvalidHandler => "handler was already released".fmt(fmt),
            LoadError::NotInFlight => "handler is not in flight".fmt(fmt),
            LoadError::AlreadyBound(ref name) => {
                write!(fmt, "instance of {} is already bound", name)
            }
            LoadError::StringError(ref e) => e.fmt(fmt),
            LoadError::IoError(ref e) => e.fmt(fmt),
            LoadError::BaseError(ref e) => e.fmt(fmt),
            LoadError::BincodeError(ref e) => e.fmt(fmt),
            LoadError::JsonError(ref e) => e.fmt(fmt),
            LoadError::HttpError(ref e) => e.fmt(fmt),
        }
    }
}

impl From<&str> for LoadError {
    fn from(str: &str) -> Self {
        LoadError::StringError(str.to_string())
    }
}

impl From<String> for LoadError {
    fn from(string: String) -> Self {
        LoadError::StringError(string)
    }
}

impl From<std::io::Error> for LoadError {
    fn from(error: std::io::Error) -> Self {
        LoadError::IoError(Arc::new(error))
    }
}

impl From<BaseError> for LoadError {
    fn from(error: BaseError) -> Self {
        LoadError::BaseError(error)
    }
}

impl From<bincode::Error> for LoadError {
    fn from(error: bincode::Error) -> Self {
        LoadError::BincodeError(Arc::new(error))
    }
}

impl From<serde_json::Error> for LoadError {
    fn from(error: serde_json::Error) -> Self {
        LoadError::JsonError(Arc::new(error))
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(error: reqwest::Error) -> Self {
        LoadError::HttpError(Arc::new(error))
    }
}

pub type LoadResult<T> = Result<T, LoadError>;
