pub mod hashing;

mod error;
pub use error::{BaseError, BaseResult};

pub mod checksum;
pub use checksum::ContentChecksum;

pub mod manifest;
pub use manifest::{AssetManifestInfo, BundleManifestInfo, Manifest};

pub mod bundle_archive;
pub use bundle_archive::{BundleArchive, BundleArchiveWriter};

pub mod storage_path;
