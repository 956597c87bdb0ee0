use crate::hashing::HashSet;
use crate::{BaseError, BaseResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An asset as described by the build. Dependencies are direct only, the loader walks them
/// recursively at load time.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetManifestInfo {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl AssetManifestInfo {
    pub fn new(
        name: impl Into<String>,
        dependencies: &[&str],
    ) -> Self {
        AssetManifestInfo {
            name: name.into(),
            dependencies: dependencies.iter().map(|x| x.to_string()).collect(),
        }
    }
}

/// A physical bundle file as described by the build. `name` is the path relative to the storage
/// root and is the unique key for the bundle.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleManifestInfo {
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub is_raw: bool,
    #[serde(default)]
    pub is_scene: bool,
    pub length: u64,
    pub hash: String,
    pub checksum: String,
    #[serde(default)]
    pub assets: Vec<AssetManifestInfo>,
}

impl BundleManifestInfo {
    /// True if the two records describe the same bytes
    pub fn same_content(
        &self,
        other: &BundleManifestInfo,
    ) -> bool {
        self.length == other.length && self.hash == other.hash && self.checksum == other.checksum
    }
}

/// The full list of bundles produced by one build
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Manifest {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub bundles: Vec<BundleManifestInfo>,
}

impl Manifest {
    pub fn from_json_str(json: &str) -> BaseResult<Manifest> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_json_string(&self) -> BaseResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load_from_file(path: &Path) -> BaseResult<Manifest> {
        profiling::scope!("Manifest::load_from_file");
        log::info!("Loading manifest {:?}", path);
        let json_str = std::fs::read_to_string(path)?;
        Self::from_json_str(&json_str)
    }

    /// Writes the manifest next to its destination and renames it into place
    pub fn save_to_file(
        &self,
        path: &Path,
    ) -> BaseResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = crate::storage_path::download_temp_path(path);
        std::fs::write(&tmp_path, self.to_json_string()?)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Bundle and asset names must be unique across the whole manifest
    pub fn validate(&self) -> BaseResult<()> {
        let mut bundle_names = HashSet::default();
        let mut asset_names = HashSet::default();
        for bundle in &self.bundles {
            if bundle.name.is_empty() {
                return Err(BaseError::from("manifest contains a bundle with an empty name"));
            }

            if !bundle_names.insert(bundle.name.as_str()) {
                return Err(BaseError::StringError(format!(
                    "bundle {} is listed more than once",
                    bundle.name
                )));
            }

            for asset in &bundle.assets {
                if !asset_names.insert(asset.name.as_str()) {
                    return Err(BaseError::StringError(format!(
                        "asset {} is listed more than once (seen again in bundle {})",
                        asset.name, bundle.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn find_bundle(
        &self,
        name: &str,
    ) -> Option<&BundleManifestInfo> {
        self.bundles.iter().find(|x| x.name == name)
    }

    pub fn find_asset(
        &self,
        name: &str,
    ) -> Option<(&BundleManifestInfo, &AssetManifestInfo)> {
        self.bundles.iter().find_map(|bundle| {
            bundle
                .assets
                .iter()
                .find(|asset| asset.name == name)
                .map(|asset| (bundle, asset))
        })
    }

    /// Bundles in this (remote) manifest that are absent from `local` or whose content differs.
    /// When `group` is given, only bundles in that group are considered.
    pub fn bundles_to_update(
        &self,
        local: &Manifest,
        group: Option<&str>,
    ) -> Vec<&BundleManifestInfo> {
        self.bundles
            .iter()
            .filter(|remote| group.map(|g| remote.group == g).unwrap_or(true))
            .filter(|remote| match local.find_bundle(&remote.name) {
                Some(existing) => !existing.same_content(remote),
                None => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(
        name: &str,
        group: &str,
        hash: &str,
        assets: Vec<AssetManifestInfo>,
    ) -> BundleManifestInfo {
        BundleManifestInfo {
            name: name.to_string(),
            group: group.to_string(),
            is_raw: false,
            is_scene: false,
            length: 10,
            hash: hash.to_string(),
            checksum: format!("{}-checksum", hash),
            assets,
        }
    }

    #[test]
    fn find_asset_returns_owning_bundle() {
        let manifest = Manifest {
            version: 1,
            bundles: vec![
                bundle(
                    "bundle1",
                    "base",
                    "h1",
                    vec![AssetManifestInfo::new("A", &["B", "C"])],
                ),
                bundle(
                    "bundle2",
                    "base",
                    "h2",
                    vec![
                        AssetManifestInfo::new("B", &[]),
                        AssetManifestInfo::new("C", &[]),
                    ],
                ),
            ],
        };

        let (owner, asset) = manifest.find_asset("C").unwrap();
        assert_eq!(owner.name, "bundle2");
        assert!(asset.dependencies.is_empty());
        assert_eq!(manifest.find_asset("A").unwrap().1.dependencies, vec!["B", "C"]);
        assert!(manifest.find_asset("D").is_none());
    }

    #[test]
    fn duplicate_asset_is_rejected() {
        let manifest = Manifest {
            version: 1,
            bundles: vec![
                bundle("bundle1", "", "h1", vec![AssetManifestInfo::new("A", &[])]),
                bundle("bundle2", "", "h2", vec![AssetManifestInfo::new("A", &[])]),
            ],
        };

        assert!(manifest.validate().is_err());
        let json = manifest.to_json_string().unwrap();
        assert!(Manifest::from_json_str(&json).is_err());
    }

    #[test]
    fn bundles_to_update_detects_changed_and_new() {
        let local = Manifest {
            version: 1,
            bundles: vec![
                bundle("same", "base", "h1", vec![]),
                bundle("changed", "base", "h2", vec![]),
                bundle("other_group", "dlc", "h3", vec![]),
            ],
        };
        let remote = Manifest {
            version: 2,
            bundles: vec![
                bundle("same", "base", "h1", vec![]),
                bundle("changed", "base", "h2b", vec![]),
                bundle("added", "base", "h4", vec![]),
                bundle("other_group", "dlc", "h3b", vec![]),
            ],
        };

        let all: Vec<_> = remote
            .bundles_to_update(&local, None)
            .into_iter()
            .map(|x| x.name.as_str())
            .collect();
        assert_eq!(all, vec!["changed", "added", "other_group"]);

        let base_only: Vec<_> = remote
            .bundles_to_update(&local, Some("base"))
            .into_iter()
            .map(|x| x.name.as_str())
            .collect();
        assert_eq!(base_only, vec!["changed", "added"]);
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("manifest.json");
        let manifest = Manifest {
            version: 7,
            bundles: vec![bundle(
                "bundle1",
                "base",
                "h1",
                vec![AssetManifestInfo::new("A", &["B"])],
            )],
        };

        manifest.save_to_file(&path).unwrap();
        let loaded = Manifest::load_from_file(&path).unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.bundles, manifest.bundles);
        assert!(!crate::storage_path::download_temp_path(&path).exists());
    }
}
