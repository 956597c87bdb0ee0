use crate::bundle_io::{BundleIO, OpenedBundle};
use crate::{AssetInstance, InstanceId, LoadError, LoadResult, LoaderConfig};
use cask_base::hashing::{HashMap, HashSet};
use cask_base::{AssetManifestInfo, BundleManifestInfo, Manifest};
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};

/// Live load-time edges of one asset
#[derive(Default, Debug, Clone)]
pub struct DependencyChain {
    // Assets that depend on this one
    pub up_stream: HashSet<String>,
    // Assets this one depends on
    pub down_stream: HashSet<String>,
}

#[derive(Debug)]
pub struct AssetRuntimeInfo {
    pub manifest: AssetManifestInfo,
    pub bundle: String,
    pub ref_count: u32,
    pub loaded_instance: Option<AssetInstance>,
    pub chain: DependencyChain,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BundleState {
    InReadOnly,
    InReadWrite,
    Downloading,
    Missing,
}

#[derive(Debug)]
pub struct BundleRuntimeInfo {
    pub manifest: BundleManifestInfo,
    pub state: BundleState,
    pub local_path: PathBuf,
    pub loaded_handle: Option<OpenedBundle>,
    pub used_assets: HashSet<String>,
    // Bundles with a loaded asset depending on an asset in this bundle
    pub ref_bundles: HashSet<String>,
    pub dependency_bundles: HashSet<String>,
    // Held by explicit bundle requests
    pub external_refs: u32,
    // Asset loads waiting on this bundle that have not registered in used_assets yet
    pub pending_loads: u32,
    // Explicit bundle requests whose handler has not resolved yet
    pub pending_requests: u32,
    // Synthesized for a raw file outside the manifest
    pub is_external: bool,
}

impl BundleRuntimeInfo {
    pub fn is_unused(&self) -> bool {
        self.used_assets.is_empty()
            && self.ref_bundles.is_empty()
            && self.external_refs == 0
            && self.pending_loads == 0
            && self.pending_requests == 0
    }
}

#[derive(Clone, Debug)]
pub struct StorageRoots {
    pub read_only_root: PathBuf,
    pub read_write_root: PathBuf,
    pub append_hash_to_name: bool,
}

impl StorageRoots {
    pub fn from_config(config: &LoaderConfig) -> Self {
        StorageRoots {
            read_only_root: config.read_only_root.clone(),
            read_write_root: config.read_write_root.clone(),
            append_hash_to_name: config.append_hash_to_name,
        }
    }

    pub fn read_only_path(
        &self,
        bundle: &BundleManifestInfo,
    ) -> PathBuf {
        cask_base::storage_path::bundle_file_path(
            &self.read_only_root,
            &bundle.name,
            &bundle.hash,
            self.append_hash_to_name,
        )
    }

    pub fn read_write_path(
        &self,
        bundle: &BundleManifestInfo,
    ) -> PathBuf {
        cask_base::storage_path::bundle_file_path(
            &self.read_write_root,
            &bundle.name,
            &bundle.hash,
            self.append_hash_to_name,
        )
    }

    /// Verified read-write copy first, then the shipped read-only copy
    pub fn resolve(
        &self,
        bundle: &BundleManifestInfo,
        io: &dyn BundleIO,
    ) -> (BundleState, PathBuf) {
        let read_write_path = self.read_write_path(bundle);
        if io.file_length(&read_write_path) == Some(bundle.length) {
            return (BundleState::InReadWrite, read_write_path);
        }

        let read_only_path = self.read_only_path(bundle);
        if io.file_length(&read_only_path).is_some() {
            return (BundleState::InReadOnly, read_only_path);
        }

        (BundleState::Missing, read_write_path)
    }
}

#[derive(Clone, Debug)]
pub struct AssetSnapshot {
    pub name: String,
    pub bundle: String,
    pub ref_count: u32,
    pub loaded: bool,
    pub up_stream: Vec<String>,
    pub down_stream: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct BundleSnapshot {
    pub name: String,
    pub state: BundleState,
    pub loaded: bool,
    pub used_assets: Vec<String>,
    pub ref_bundles: Vec<String>,
    pub dependency_bundles: Vec<String>,
    pub external_refs: u32,
}

/// Read-only copy of the graph, sorted by name
#[derive(Clone, Debug, Default)]
pub struct DatabaseSnapshot {
    pub assets: Vec<AssetSnapshot>,
    pub bundles: Vec<BundleSnapshot>,
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut values: Vec<String> = set.iter().cloned().collect();
    values.sort();
    values
}

/// Maps stable names to runtime records and loaded instances back to their asset.
///
/// Records are created lazily on first reference and live until the next [`reset`](Self::reset).
/// Only the tick thread touches the database.
pub struct ResourceDatabase {
    manifest: Manifest,
    roots: StorageRoots,
    bundle_by_name: HashMap<String, usize>,
    asset_to_bundle: HashMap<String, (usize, usize)>,
    bundles: HashMap<String, BundleRuntimeInfo>,
    assets: HashMap<String, AssetRuntimeInfo>,
    instances: HashMap<InstanceId, String>,
    next_instance_id: u64,
}

impl ResourceDatabase {
    pub fn new(
        manifest: Manifest,
        roots: StorageRoots,
    ) -> Self {
        let mut database = ResourceDatabase {
            manifest: Manifest::default(),
            roots,
            bundle_by_name: Default::default(),
            asset_to_bundle: Default::default(),
            bundles: Default::default(),
            assets: Default::default(),
            instances: Default::default(),
            next_instance_id: 1,
        };
        database.reset(manifest);
        database
    }

    /// Drops every runtime record and rebuilds the lookup tables from `manifest`. Open bundle
    /// handles are returned so the caller can close them.
    pub fn reset(
        &mut self,
        manifest: Manifest,
    ) -> Vec<(String, OpenedBundle)> {
        profiling::scope!("ResourceDatabase::reset");
        log::info!(
            "Resource database reset with manifest version {} ({} bundles)",
            manifest.version,
            manifest.bundles.len()
        );

        let opened = self
            .bundles
            .iter_mut()
            .filter_map(|(name, info)| info.loaded_handle.take().map(|x| (name.clone(), x)))
            .collect();

        self.bundle_by_name.clear();
        self.asset_to_bundle.clear();
        for (bundle_index, bundle) in manifest.bundles.iter().enumerate() {
            self.bundle_by_name.insert(bundle.name.clone(), bundle_index);
            for (asset_index, asset) in bundle.assets.iter().enumerate() {
                self.asset_to_bundle
                    .insert(asset.name.clone(), (bundle_index, asset_index));
            }
        }

        self.manifest = manifest;
        self.bundles.clear();
        self.assets.clear();
        self.instances.clear();
        opened
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn roots(&self) -> &StorageRoots {
        &self.roots
    }

    fn external_file_length(
        name: &str,
        io: &dyn BundleIO,
    ) -> Option<u64> {
        let path = Path::new(name);
        if path.is_absolute() {
            io.file_length(path)
        } else {
            None
        }
    }

    // Raw files outside the manifest are wrapped in a one-asset bundle named after their path
    fn external_bundle_info(
        name: &str,
        length: u64,
    ) -> BundleRuntimeInfo {
        log::debug!("Synthesizing raw bundle for external file {}", name);
        BundleRuntimeInfo {
            manifest: BundleManifestInfo {
                name: name.to_string(),
                group: String::default(),
                is_raw: true,
                is_scene: false,
                length,
                hash: String::default(),
                checksum: String::default(),
                assets: vec![AssetManifestInfo::new(name, &[])],
            },
            state: BundleState::InReadOnly,
            local_path: PathBuf::from(name),
            loaded_handle: None,
            used_assets: Default::default(),
            ref_bundles: Default::default(),
            dependency_bundles: Default::default(),
            external_refs: 0,
            pending_loads: 0,
            pending_requests: 0,
            is_external: true,
        }
    }

    pub fn get_or_create_bundle_info(
        &mut self,
        name: &str,
        io: &dyn BundleIO,
    ) -> LoadResult<&mut BundleRuntimeInfo> {
        if name.is_empty() {
            return Err(LoadError::NameEmpty);
        }

        match self.bundles.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let info = if let Some(&index) = self.bundle_by_name.get(name) {
                    let manifest = self.manifest.bundles[index].clone();
                    let (state, local_path) = self.roots.resolve(&manifest, io);
                    log::debug!("Bundle {} resolved to {:?} at {:?}", name, state, local_path);
                    BundleRuntimeInfo {
                        manifest,
                        state,
                        local_path,
                        loaded_handle: None,
                        used_assets: Default::default(),
                        ref_bundles: Default::default(),
                        dependency_bundles: Default::default(),
                        external_refs: 0,
                        pending_loads: 0,
                        pending_requests: 0,
                        is_external: false,
                    }
                } else if let Some(length) = Self::external_file_length(name, io) {
                    Self::external_bundle_info(name, length)
                } else {
                    log::error!("Bundle {} is not in the manifest", name);
                    return Err(LoadError::ManifestEntryMissing(name.to_string()));
                };

                Ok(entry.insert(info))
            }
        }
    }

    pub fn get_or_create_asset_info(
        &mut self,
        name: &str,
        io: &dyn BundleIO,
    ) -> LoadResult<&mut AssetRuntimeInfo> {
        if name.is_empty() {
            return Err(LoadError::NameEmpty);
        }

        if !self.assets.contains_key(name) {
            let (manifest, bundle) = if let Some(&(bundle_index, asset_index)) =
                self.asset_to_bundle.get(name)
            {
                let bundle = &self.manifest.bundles[bundle_index];
                (bundle.assets[asset_index].clone(), bundle.name.clone())
            } else if let Some(length) = Self::external_file_length(name, io) {
                self.bundles
                    .entry(name.to_string())
                    .or_insert_with(|| Self::external_bundle_info(name, length));
                (AssetManifestInfo::new(name, &[]), name.to_string())
            } else {
                log::error!("Asset {} is not in the manifest", name);
                return Err(LoadError::ManifestEntryMissing(name.to_string()));
            };

            self.assets.insert(
                name.to_string(),
                AssetRuntimeInfo {
                    manifest,
                    bundle,
                    ref_count: 0,
                    loaded_instance: None,
                    chain: Default::default(),
                },
            );
        }

        self.assets
            .get_mut(name)
            .ok_or_else(|| LoadError::ManifestEntryMissing(name.to_string()))
    }

    pub fn asset(
        &self,
        name: &str,
    ) -> Option<&AssetRuntimeInfo> {
        self.assets.get(name)
    }

    pub fn asset_mut(
        &mut self,
        name: &str,
    ) -> Option<&mut AssetRuntimeInfo> {
        self.assets.get_mut(name)
    }

    pub fn bundle(
        &self,
        name: &str,
    ) -> Option<&BundleRuntimeInfo> {
        self.bundles.get(name)
    }

    pub fn bundle_mut(
        &mut self,
        name: &str,
    ) -> Option<&mut BundleRuntimeInfo> {
        self.bundles.get_mut(name)
    }

    pub fn ref_count(
        &self,
        asset: &str,
    ) -> u32 {
        self.assets.get(asset).map(|x| x.ref_count).unwrap_or(0)
    }

    pub fn is_bundle_unused(
        &self,
        bundle: &str,
    ) -> bool {
        self.bundles
            .get(bundle)
            .map(|x| x.is_unused())
            .unwrap_or(true)
    }

    pub fn is_bundle_loaded(
        &self,
        bundle: &str,
    ) -> bool {
        self.bundles
            .get(bundle)
            .map(|x| x.loaded_handle.is_some())
            .unwrap_or(false)
    }

    pub fn allocate_instance_id(&mut self) -> InstanceId {
        let id = InstanceId(self.next_instance_id);
        self.next_instance_id += 1;
        id
    }

    /// Records `instance` as the loaded instance of `asset` and indexes it for unload-by-instance
    pub fn bind_instance(
        &mut self,
        instance: &AssetInstance,
        asset: &str,
    ) -> LoadResult<()> {
        if self.instances.contains_key(&instance.id()) {
            return Err(LoadError::AlreadyBound(asset.to_string()));
        }

        let info = self
            .assets
            .get_mut(asset)
            .ok_or_else(|| LoadError::ManifestEntryMissing(asset.to_string()))?;
        if info.loaded_instance.is_some() {
            return Err(LoadError::AlreadyBound(asset.to_string()));
        }

        info.loaded_instance = Some(instance.clone());
        self.instances.insert(instance.id(), asset.to_string());
        Ok(())
    }

    pub fn unbind_instance(
        &mut self,
        instance: InstanceId,
    ) -> Option<String> {
        let asset = self.instances.remove(&instance)?;
        if let Some(info) = self.assets.get_mut(&asset) {
            info.loaded_instance = None;
        }
        Some(asset)
    }

    pub fn asset_for_instance(
        &self,
        instance: InstanceId,
    ) -> Option<&str> {
        self.instances.get(&instance).map(|x| x.as_str())
    }

    pub fn retain_asset(
        &mut self,
        asset: &str,
        count: u32,
    ) {
        if let Some(info) = self.assets.get_mut(asset) {
            info.ref_count += count;
        }
    }

    /// Gives back one reference. When the count reaches zero the asset's edges are removed and its
    /// dependencies released in turn. Returns the bundles left unused by the release.
    pub fn release_asset(
        &mut self,
        asset: &str,
    ) -> LoadResult<Vec<String>> {
        match self.assets.get(asset) {
            Some(info) if info.ref_count > 0 => {}
            _ => return Err(LoadError::NotLoaded(asset.to_string())),
        }

        let mut unused_bundles = Vec::new();
        let mut pending = vec![asset.to_string()];
        while let Some(current) = pending.pop() {
            let (bundle, dependencies) = match self.assets.get_mut(&current) {
                Some(info) if info.ref_count > 0 => {
                    info.ref_count -= 1;
                    if info.ref_count > 0 {
                        continue;
                    }

                    let dependencies: Vec<String> = info.chain.down_stream.drain().collect();
                    (info.bundle.clone(), dependencies)
                }
                _ => {
                    log::error!("Release of {} which holds no references", current);
                    continue;
                }
            };

            log::debug!("Asset {} has no references left", current);
            for dependency in dependencies {
                if let Some(info) = self.assets.get_mut(&dependency) {
                    info.chain.up_stream.remove(&current);
                }
                pending.push(dependency);
            }

            if let Some(info) = self.bundles.get_mut(&bundle) {
                info.used_assets.remove(&current);
                if info.is_unused() && !unused_bundles.contains(&bundle) {
                    unused_bundles.push(bundle);
                }
            }
        }

        Ok(unused_bundles)
    }

    /// Records that `dependent` holds a reference on `dependency`, and the bundle-level edge when
    /// they live in different bundles
    pub fn add_dependency_edge(
        &mut self,
        dependent: &str,
        dependency: &str,
    ) {
        let dependent_bundle = match self.assets.get_mut(dependent) {
            Some(info) => {
                info.chain.down_stream.insert(dependency.to_string());
                info.bundle.clone()
            }
            None => return,
        };

        let dependency_bundle = match self.assets.get_mut(dependency) {
            Some(info) => {
                info.chain.up_stream.insert(dependent.to_string());
                info.bundle.clone()
            }
            None => return,
        };

        if dependent_bundle != dependency_bundle {
            if let Some(info) = self.bundles.get_mut(&dependent_bundle) {
                info.dependency_bundles.insert(dependency_bundle.clone());
            }
            if let Some(info) = self.bundles.get_mut(&dependency_bundle) {
                info.ref_bundles.insert(dependent_bundle);
            }
        }
    }

    pub fn remove_dependency_edge(
        &mut self,
        dependent: &str,
        dependency: &str,
    ) {
        if let Some(info) = self.assets.get_mut(dependent) {
            info.chain.down_stream.remove(dependency);
        }
        if let Some(info) = self.assets.get_mut(dependency) {
            info.chain.up_stream.remove(dependent);
        }
    }

    /// Unbinds unreferenced instances of the bundle, drops its bundle-level edges and takes the
    /// opened handle. Returns the handle and the dependency bundles that became unused.
    pub fn evict_bundle(
        &mut self,
        bundle: &str,
    ) -> (Option<OpenedBundle>, Vec<String>) {
        let (handle, asset_names, dependency_bundles) = match self.bundles.get_mut(bundle) {
            Some(info) => (
                info.loaded_handle.take(),
                info.manifest
                    .assets
                    .iter()
                    .map(|x| x.name.clone())
                    .collect::<Vec<_>>(),
                info.dependency_bundles.drain().collect::<Vec<_>>(),
            ),
            None => return (None, Vec::new()),
        };

        for asset_name in asset_names {
            let instance = match self.assets.get(&asset_name) {
                Some(info) if info.ref_count == 0 => info.loaded_instance.as_ref().map(|x| x.id()),
                _ => None,
            };

            if let Some(instance) = instance {
                log::trace!("Unbinding {} on eviction of {}", asset_name, bundle);
                self.unbind_instance(instance);
            }
        }

        let mut unused = Vec::new();
        for dependency_bundle in dependency_bundles {
            if let Some(info) = self.bundles.get_mut(&dependency_bundle) {
                info.ref_bundles.remove(bundle);
                if info.is_unused() && info.loaded_handle.is_some() {
                    unused.push(dependency_bundle);
                }
            }
        }

        (handle, unused)
    }

    /// Re-checks storage for a bundle, used after a download finishes or fails
    pub fn refresh_bundle_state(
        &mut self,
        bundle: &str,
        io: &dyn BundleIO,
    ) {
        let roots = &self.roots;
        if let Some(info) = self.bundles.get_mut(bundle) {
            if !info.is_external {
                let (state, local_path) = roots.resolve(&info.manifest, io);
                info.state = state;
                info.local_path = local_path;
            }
        }
    }

    pub fn snapshot(&self) -> DatabaseSnapshot {
        let mut assets: Vec<AssetSnapshot> = self
            .assets
            .iter()
            .map(|(name, info)| AssetSnapshot {
                name: name.clone(),
                bundle: info.bundle.clone(),
                ref_count: info.ref_count,
                loaded: info.loaded_instance.is_some(),
                up_stream: sorted(&info.chain.up_stream),
                down_stream: sorted(&info.chain.down_stream),
            })
            .collect();
        assets.sort_by(|a, b| a.name.cmp(&b.name));

        let mut bundles: Vec<BundleSnapshot> = self
            .bundles
            .iter()
            .map(|(name, info)| BundleSnapshot {
                name: name.clone(),
                state: info.state,
                loaded: info.loaded_handle.is_some(),
                used_assets: sorted(&info.used_assets),
                ref_bundles: sorted(&info.ref_bundles),
                dependency_bundles: sorted(&info.dependency_bundles),
                external_refs: info.external_refs,
            })
            .collect();
        bundles.sort_by(|a, b| a.name.cmp(&b.name));

        DatabaseSnapshot { assets, bundles }
    }
}
