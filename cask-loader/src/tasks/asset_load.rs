use crate::bundle_io::IoRequestId;
use crate::task::{
    ChildOutcome, Loaded, Notify, Priority, Step, TaskCommand, TaskContext, TaskEnv, TaskKind,
    TaskStateMachine,
};
use crate::{AssetInstance, InstanceKind, LoadError};

enum AssetLoadPhase {
    Start,
    BundleLoading,
    DependenciesLoading,
    AssetLoading(IoRequestId),
    Done,
}

/// Loads the owning bundle, then every dependency, then extracts the asset.
///
/// References are taken once per live request as soon as the bundle is ready and the asset is
/// registered as used by the bundle before dependencies are requested, so an unload check on the
/// bundle cannot evict it while the rest of the load is in flight.
pub struct AssetLoadTask {
    name: String,
    kind: InstanceKind,
    bundle: String,
    phase: AssetLoadPhase,
    // References taken on behalf of requests
    counted: u32,
    pending_dependencies: Vec<String>,
    loaded_dependencies: Vec<String>,
    dependency_count: usize,
    failure: Option<LoadError>,
}

impl AssetLoadTask {
    pub fn new(name: String) -> Self {
        AssetLoadTask {
            name,
            kind: InstanceKind::Asset,
            bundle: String::default(),
            phase: AssetLoadPhase::Start,
            counted: 0,
            pending_dependencies: Vec::default(),
            loaded_dependencies: Vec::default(),
            dependency_count: 0,
            failure: None,
        }
    }

    // Keeps one reference per live request, merged and cancelled requests adjust it each tick
    fn sync_ref_count(
        &mut self,
        ctx: &mut TaskContext,
        live_requests: usize,
    ) {
        let live = live_requests as u32;
        if live == self.counted {
            return;
        }

        if let Some(info) = ctx.database.asset_mut(&self.name) {
            if live > self.counted {
                info.ref_count += live - self.counted;
            } else {
                info.ref_count = info.ref_count.saturating_sub(self.counted - live);
            }
            self.counted = live;
        }
    }

    fn on_bundle_loaded(
        &mut self,
        ctx: &mut TaskContext,
        env: &mut TaskEnv,
    ) -> Step {
        self.sync_ref_count(ctx, env.live_requests);

        let dependencies = match ctx.database.asset(&self.name) {
            Some(info) => info.manifest.dependencies.clone(),
            None => return Step::Finished(Err(LoadError::ManifestEntryMissing(self.name.clone()))),
        };

        if let Some(bundle) = ctx.database.bundle_mut(&self.bundle) {
            bundle.used_assets.insert(self.name.clone());
            bundle.pending_loads = bundle.pending_loads.saturating_sub(1);
        }

        for dependency in dependencies {
            if dependency != self.name && !self.pending_dependencies.contains(&dependency) {
                self.pending_dependencies.push(dependency);
            }
        }
        self.dependency_count = self.pending_dependencies.len();

        if self.pending_dependencies.is_empty() {
            return self.start_extraction(ctx);
        }

        log::debug!(
            "Asset {} loading dependencies {:?}",
            self.name,
            self.pending_dependencies
        );
        for dependency in &self.pending_dependencies {
            ctx.commands.push(TaskCommand::LoadAsset {
                name: dependency.clone(),
                priority: Priority::High,
                notify: Notify::Task(env.key),
            });
        }
        self.phase = AssetLoadPhase::DependenciesLoading;
        Step::Pending
    }

    fn on_dependency_finished(
        &mut self,
        ctx: &mut TaskContext,
        child: ChildOutcome,
    ) {
        let position = match self.pending_dependencies.iter().position(|x| *x == child.name) {
            Some(position) => position,
            None => {
                log::error!("Asset {} got an unexpected result for {}", self.name, child.name);
                return;
            }
        };
        self.pending_dependencies.swap_remove(position);

        match child.outcome {
            Ok(Loaded::Asset(_)) => {
                ctx.database.add_dependency_edge(&self.name, &child.name);
                self.loaded_dependencies.push(child.name);
            }
            Ok(other) => {
                log::error!("Asset {} got {:?} for dependency {}", self.name, other, child.name);
            }
            Err(reason) => {
                log::warn!(
                    "Dependency {} of {} failed to load: {}",
                    child.name,
                    self.name,
                    reason
                );
                if self.failure.is_none() {
                    self.failure = Some(LoadError::DependencyLoadFailed {
                        asset: self.name.clone(),
                        dependency: child.name,
                        reason: Box::new(reason),
                    });
                }
            }
        }
    }

    fn start_extraction(
        &mut self,
        ctx: &mut TaskContext,
    ) -> Step {
        // Reloaded within the unload grace period, the instance is still bound
        if let Some(instance) = ctx
            .database
            .asset(&self.name)
            .and_then(|x| x.loaded_instance.clone())
        {
            log::debug!("Asset {} reusing instance {:?}", self.name, instance.id());
            return self.finish_success(instance);
        }

        let handle = ctx
            .database
            .bundle(&self.bundle)
            .and_then(|x| x.loaded_handle.clone());
        let handle = match handle {
            Some(handle) => handle,
            None => {
                let error = LoadError::BundleOpenFailed {
                    bundle: self.bundle.clone(),
                    reason: "bundle was closed during the load".to_string(),
                };
                return self.fail(ctx, error);
            }
        };

        let request = ctx.io_results.allocate_request();
        ctx.io.extract_asset(request, &handle, &self.name);
        self.phase = AssetLoadPhase::AssetLoading(request);
        Step::Pending
    }

    fn finish_success(
        &mut self,
        instance: AssetInstance,
    ) -> Step {
        log::debug!("Asset {} loaded", self.name);
        self.phase = AssetLoadPhase::Done;
        Step::Finished(Ok(Loaded::Asset(instance)))
    }

    // Gives back the dependency references and edges and this asset's own references
    fn rollback(
        &mut self,
        ctx: &mut TaskContext,
    ) {
        for dependency in std::mem::take(&mut self.loaded_dependencies) {
            ctx.database.remove_dependency_edge(&self.name, &dependency);
            ctx.release_asset(&dependency);
        }

        if let Some(info) = ctx.database.asset_mut(&self.name) {
            info.ref_count = info.ref_count.saturating_sub(self.counted);
            let unreferenced = info.ref_count == 0;
            self.counted = 0;
            if unreferenced {
                if let Some(bundle) = ctx.database.bundle_mut(&self.bundle) {
                    bundle.used_assets.remove(&self.name);
                }
            }
        }

        if ctx.database.is_bundle_unused(&self.bundle) {
            ctx.schedule_unload(&self.bundle);
        }
    }

    fn fail(
        &mut self,
        ctx: &mut TaskContext,
        error: LoadError,
    ) -> Step {
        log::warn!("Asset {} failed to load: {}", self.name, error);
        self.rollback(ctx);
        self.phase = AssetLoadPhase::Done;
        Step::Finished(Err(error))
    }
}

impl TaskStateMachine for AssetLoadTask {
    fn run(
        &mut self,
        ctx: &mut TaskContext,
        env: &mut TaskEnv,
    ) -> Step {
        let bundle = match ctx.database.get_or_create_asset_info(&self.name, &*ctx.io) {
            Ok(info) => info.bundle.clone(),
            Err(e) => return Step::Finished(Err(e)),
        };

        match ctx.database.get_or_create_bundle_info(&bundle, &*ctx.io) {
            Ok(info) => {
                info.pending_loads += 1;
                self.kind = if info.manifest.is_raw {
                    InstanceKind::Raw
                } else if info.manifest.is_scene {
                    InstanceKind::Scene
                } else {
                    InstanceKind::Asset
                };
            }
            Err(e) => return Step::Finished(Err(e)),
        }

        log::debug!("Asset {} waiting on bundle {}", self.name, bundle);
        ctx.commands.push(TaskCommand::LoadBundle {
            name: bundle.clone(),
            priority: Priority::High,
            notify: Notify::Task(env.key),
        });
        self.bundle = bundle;
        self.phase = AssetLoadPhase::BundleLoading;
        Step::Pending
    }

    fn update(
        &mut self,
        ctx: &mut TaskContext,
        env: &mut TaskEnv,
    ) -> Step {
        match self.phase {
            AssetLoadPhase::Start | AssetLoadPhase::Done => Step::Pending,
            AssetLoadPhase::BundleLoading => {
                let position = env
                    .children
                    .iter()
                    .position(|x| x.kind == TaskKind::BundleLoad && x.name == self.bundle);
                let child = match position {
                    Some(position) => env.children.swap_remove(position),
                    None => return Step::Pending,
                };

                match child.outcome {
                    Ok(_) => self.on_bundle_loaded(ctx, env),
                    Err(e) => {
                        if let Some(bundle) = ctx.database.bundle_mut(&self.bundle) {
                            bundle.pending_loads = bundle.pending_loads.saturating_sub(1);
                        }
                        if ctx.database.is_bundle_unused(&self.bundle) {
                            ctx.schedule_unload(&self.bundle);
                        }
                        log::warn!("Asset {} failed to load its bundle: {}", self.name, e);
                        self.phase = AssetLoadPhase::Done;
                        Step::Finished(Err(e))
                    }
                }
            }
            AssetLoadPhase::DependenciesLoading => {
                self.sync_ref_count(ctx, env.live_requests);
                for child in std::mem::take(&mut env.children) {
                    if child.kind == TaskKind::AssetLoad {
                        self.on_dependency_finished(ctx, child);
                    } else {
                        env.children.push(child);
                    }
                }

                if !self.pending_dependencies.is_empty() {
                    return Step::Pending;
                }

                match self.failure.take() {
                    Some(error) => self.fail(ctx, error),
                    None => self.start_extraction(ctx),
                }
            }
            AssetLoadPhase::AssetLoading(request) => {
                self.sync_ref_count(ctx, env.live_requests);
                let result = match ctx.io_results.take_extracted(request) {
                    Some(result) => result,
                    None => return Step::Pending,
                };

                let data = match result {
                    Ok(Some(data)) => data,
                    Ok(None) | Err(_) => {
                        let error = LoadError::ExtractionFailed {
                            asset: self.name.clone(),
                            bundle: self.bundle.clone(),
                        };
                        return self.fail(ctx, error);
                    }
                };

                let id = ctx.database.allocate_instance_id();
                let instance = AssetInstance::new(id, self.name.clone(), self.kind, data);
                match ctx.database.bind_instance(&instance, &self.name) {
                    Ok(()) => self.finish_success(instance),
                    Err(e) => self.fail(ctx, e),
                }
            }
        }
    }

    fn abandon(
        &mut self,
        ctx: &mut TaskContext,
    ) {
        log::debug!("Asset load {} abandoned", self.name);
        match self.phase {
            AssetLoadPhase::Start | AssetLoadPhase::Done => {}
            AssetLoadPhase::BundleLoading => {
                if let Some(bundle) = ctx.database.bundle_mut(&self.bundle) {
                    bundle.pending_loads = bundle.pending_loads.saturating_sub(1);
                }
                if ctx.database.is_bundle_unused(&self.bundle) {
                    ctx.schedule_unload(&self.bundle);
                }
            }
            AssetLoadPhase::DependenciesLoading => self.rollback(ctx),
            AssetLoadPhase::AssetLoading(request) => {
                ctx.io_results.abandon(request, &mut *ctx.io);
                self.rollback(ctx);
            }
        }
        self.phase = AssetLoadPhase::Done;
    }

    fn progress(&self) -> f32 {
        match self.phase {
            AssetLoadPhase::Start => 0.0,
            AssetLoadPhase::BundleLoading => 0.1,
            AssetLoadPhase::DependenciesLoading => {
                let finished = self.dependency_count - self.pending_dependencies.len();
                0.3 + 0.5 * finished as f32 / self.dependency_count.max(1) as f32
            }
            AssetLoadPhase::AssetLoading(_) => 0.8,
            AssetLoadPhase::Done => 1.0,
        }
    }
}
