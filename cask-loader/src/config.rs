use crate::LoadResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_unload_delay_seconds() -> f32 {
    3.0
}

fn default_max_task_starts_per_tick() -> usize {
    32
}

fn default_max_download_retries() -> u32 {
    3
}

fn default_io_thread_count() -> usize {
    4
}

fn default_download_thread_count() -> usize {
    2
}

fn default_manifest_file_name() -> String {
    "manifest.json".to_string()
}

/// Runtime settings for [`AssetManager`](crate::AssetManager). Can be built in code with the
/// `with_*` methods or read from a json file.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LoaderConfig {
    /// Content shipped with the application. Never written to.
    #[serde(default)]
    pub read_only_root: PathBuf,
    /// Downloaded content. Bundles found here win over the read-only copy.
    #[serde(default)]
    pub read_write_root: PathBuf,
    /// Base url bundles are downloaded from, bundle file names are appended to it
    #[serde(default)]
    pub download_url: Option<String>,
    /// Seconds a bundle must stay unused before it is closed
    #[serde(default = "default_unload_delay_seconds")]
    pub unload_delay_seconds: f32,
    /// Upper bound on tasks started per tick across all priority lanes
    #[serde(default = "default_max_task_starts_per_tick")]
    pub max_task_starts_per_tick: usize,
    #[serde(default)]
    pub append_hash_to_name: bool,
    /// Retries after the first attempt, so a bundle is fetched at most 1 + this many times
    #[serde(default = "default_max_download_retries")]
    pub max_download_retries: u32,
    #[serde(default = "default_io_thread_count")]
    pub io_thread_count: usize,
    #[serde(default = "default_download_thread_count")]
    pub download_thread_count: usize,
    /// Download bundles that are missing locally when they are first loaded
    #[serde(default)]
    pub auto_download_missing: bool,
    #[serde(default = "default_manifest_file_name")]
    pub manifest_file_name: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            read_only_root: PathBuf::default(),
            read_write_root: PathBuf::default(),
            download_url: None,
            unload_delay_seconds: default_unload_delay_seconds(),
            max_task_starts_per_tick: default_max_task_starts_per_tick(),
            append_hash_to_name: false,
            max_download_retries: default_max_download_retries(),
            io_thread_count: default_io_thread_count(),
            download_thread_count: default_download_thread_count(),
            auto_download_missing: false,
            manifest_file_name: default_manifest_file_name(),
        }
    }
}

impl LoaderConfig {
    pub fn new(
        read_only_root: impl Into<PathBuf>,
        read_write_root: impl Into<PathBuf>,
    ) -> Self {
        LoaderConfig {
            read_only_root: read_only_root.into(),
            read_write_root: read_write_root.into(),
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> LoadResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> LoadResult<Self> {
        log::info!("Loading loader config {:?}", path);
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn with_download_url(
        mut self,
        url: impl Into<String>,
    ) -> Self {
        self.download_url = Some(url.into());
        self
    }

    pub fn with_unload_delay(
        mut self,
        delay: Duration,
    ) -> Self {
        self.unload_delay_seconds = delay.as_secs_f32();
        self
    }

    pub fn with_max_task_starts_per_tick(
        mut self,
        max_task_starts_per_tick: usize,
    ) -> Self {
        self.max_task_starts_per_tick = max_task_starts_per_tick.max(1);
        self
    }

    pub fn with_append_hash_to_name(
        mut self,
        append_hash_to_name: bool,
    ) -> Self {
        self.append_hash_to_name = append_hash_to_name;
        self
    }

    pub fn with_max_download_retries(
        mut self,
        max_download_retries: u32,
    ) -> Self {
        self.max_download_retries = max_download_retries;
        self
    }

    pub fn with_auto_download_missing(
        mut self,
        auto_download_missing: bool,
    ) -> Self {
        self.auto_download_missing = auto_download_missing;
        self
    }

    pub fn unload_delay(&self) -> Duration {
        Duration::from_secs_f32(self.unload_delay_seconds.max(0.0))
    }

    pub fn manifest_path_read_only(&self) -> PathBuf {
        self.read_only_root.join(&self.manifest_file_name)
    }

    pub fn manifest_path_read_write(&self) -> PathBuf {
        self.read_write_root.join(&self.manifest_file_name)
    }
}
