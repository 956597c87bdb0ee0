mod error;
pub use error::{LoadError, LoadResult};

mod config;
pub use config::LoaderConfig;

mod instance;
pub use instance::{AssetInstance, InstanceId, InstanceKind};

pub mod bundle_io;
mod disk_io;
pub use disk_io::DiskBundleIO;
mod memory_io;
pub use memory_io::{MemoryBundleIO, MemoryStorage};

pub mod transport;
pub mod download;
pub use download::{DownloadProgress, UpdateInfo, UpdateState};

pub mod database;
pub mod handler;
pub use handler::{Handler, HandlerKind, HandlerState};

pub mod task;
pub use task::{LoadOutcome, Loaded, Priority};
mod task_runner;
pub use task_runner::{TaskRunner, TaskSnapshot};
mod tasks;

#[cfg(test)]
mod tests;

use crate::bundle_io::{BundleIO, IoEvent, IoResults};
use crate::database::{ResourceDatabase, StorageRoots};
use crate::download::DownloadService;
use crate::handler::{HandlerKey, HandlerPool};
use crate::task::{Notify, TaskCommand, TaskContext};
use crate::task_runner::Submitted;
use crate::transport::{HttpTransport, Transport};
use cask_base::Manifest;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Everything tasks need while they are advanced, kept apart from the runner and handlers so both
// can be borrowed next to a TaskContext
struct LoaderServices {
    config: LoaderConfig,
    database: ResourceDatabase,
    io: Box<dyn BundleIO>,
    io_results: IoResults,
    downloads: DownloadService,
}

impl LoaderServices {
    fn context(
        &mut self,
        delta: f32,
    ) -> TaskContext<'_> {
        TaskContext {
            database: &mut self.database,
            io: &mut *self.io,
            io_results: &mut self.io_results,
            downloads: &mut self.downloads,
            config: &self.config,
            delta,
            commands: Vec::default(),
            resolved: Vec::default(),
        }
    }
}

/// Entry point of the runtime. Owns the resource database, the task runner and the handler pool,
/// and must be updated once per frame from the thread that owns it.
pub struct AssetManager {
    services: LoaderServices,
    runner: TaskRunner,
    handlers: HandlerPool,
    last_update: Option<Instant>,
}

impl AssetManager {
    /// Reads the manifest from the read-write root, falling back to the read-only root, and
    /// starts the disk and HTTP workers
    pub fn new(config: LoaderConfig) -> LoadResult<Self> {
        let manifest = Self::load_manifest(&config)?;
        let transport = Arc::new(HttpTransport::new()?);
        let io_thread_count = config.io_thread_count;
        Self::with_io(
            config,
            manifest,
            |io_tx| Ok(Box::new(DiskBundleIO::new(io_thread_count, io_tx)?) as Box<dyn BundleIO>),
            transport,
        )
    }

    /// Builds a manager around caller-supplied storage and transport. `make_io` receives the
    /// channel the IO implementation must send its results on.
    pub fn with_io<F>(
        config: LoaderConfig,
        manifest: Manifest,
        make_io: F,
        transport: Arc<dyn Transport>,
    ) -> LoadResult<Self>
    where
        F: FnOnce(Sender<IoEvent>) -> LoadResult<Box<dyn BundleIO>>,
    {
        manifest.validate()?;
        let (io_tx, io_rx) = crossbeam_channel::unbounded();
        let io = make_io(io_tx)?;
        let downloads = DownloadService::new(transport, config.download_thread_count)?;
        let database = ResourceDatabase::new(manifest, StorageRoots::from_config(&config));

        Ok(AssetManager {
            services: LoaderServices {
                config,
                database,
                io,
                io_results: IoResults::new(io_rx),
                downloads,
            },
            runner: TaskRunner::default(),
            handlers: HandlerPool::default(),
            last_update: None,
        })
    }

    /// Manager backed by [`MemoryBundleIO`], for tests and tools
    pub fn with_memory_io(
        config: LoaderConfig,
        manifest: Manifest,
        storage: MemoryStorage,
        transport: Arc<dyn Transport>,
    ) -> LoadResult<Self> {
        Self::with_io(
            config,
            manifest,
            |io_tx| Ok(Box::new(MemoryBundleIO::new(storage, io_tx)) as Box<dyn BundleIO>),
            transport,
        )
    }

    fn load_manifest(config: &LoaderConfig) -> LoadResult<Manifest> {
        let read_write_path = config.manifest_path_read_write();
        if read_write_path.is_file() {
            return Ok(Manifest::load_from_file(&read_write_path)?);
        }

        Ok(Manifest::load_from_file(&config.manifest_path_read_only())?)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.services.config
    }

    pub fn database(&self) -> &ResourceDatabase {
        &self.services.database
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Replaces the manifest. Every task, handler and runtime record is dropped and open bundles
    /// are closed. Pending callbacks never fire.
    pub fn reset(
        &mut self,
        manifest: Manifest,
    ) -> LoadResult<()> {
        manifest.validate()?;
        self.runner.clear();
        self.handlers.clear();

        let services = &mut self.services;
        for (name, bundle) in services.database.reset(manifest) {
            services.io.close_bundle(&name, bundle);
        }
        services.io_results.reset(&mut *services.io);
        services.downloads.reset();
        Ok(())
    }

    //
    // Requests
    //
    fn submit(
        &mut self,
        kind: HandlerKind,
        name: &str,
        make_command: impl FnOnce(Notify) -> TaskCommand,
    ) -> Handler {
        let handler = self.handlers.create(kind, name);
        let command = make_command(Notify::Handler(handler.0));

        let mut ctx = self.services.context(0.0);
        let submitted = self.runner.submit(command, &mut ctx);
        self.runner.apply_commands(&mut ctx);
        let resolved = std::mem::take(&mut ctx.resolved);

        match submitted {
            Submitted::Queued { task, request } => {
                self.handlers.attach_task(handler, task, request);
            }
            Submitted::Completed(outcome) => {
                if let Err(e) = &outcome {
                    log::warn!("Request for {} failed: {}", name, e);
                }
                self.resolve_handler(handler.0, outcome);
            }
        }

        for (key, outcome) in resolved {
            self.resolve_handler(key, outcome);
        }
        handler
    }

    fn fail_immediately(
        &mut self,
        kind: HandlerKind,
        name: &str,
        error: LoadError,
    ) -> Handler {
        log::warn!("Request for {} failed: {}", name, error);
        let handler = self.handlers.create(kind, name);
        self.handlers.resolve(handler, Err(error));
        handler
    }

    pub fn load_asset(
        &mut self,
        name: &str,
    ) -> Handler {
        self.load_asset_with_priority(name, Priority::Normal)
    }

    pub fn load_asset_with_priority(
        &mut self,
        name: &str,
        priority: Priority,
    ) -> Handler {
        self.submit(HandlerKind::Asset, name, |notify| TaskCommand::LoadAsset {
            name: name.to_string(),
            priority,
            notify,
        })
    }

    /// Like [`load_asset`](Self::load_asset) but the asset must live in a scene bundle
    pub fn load_scene(
        &mut self,
        name: &str,
    ) -> Handler {
        let services = &mut self.services;
        let bundle = match services
            .database
            .get_or_create_asset_info(name, &*services.io)
        {
            Ok(info) => info.bundle.clone(),
            Err(e) => return self.fail_immediately(HandlerKind::Scene, name, e),
        };

        let is_scene = match services
            .database
            .get_or_create_bundle_info(&bundle, &*services.io)
        {
            Ok(info) => info.manifest.is_scene,
            Err(e) => return self.fail_immediately(HandlerKind::Scene, name, e),
        };

        if !is_scene {
            let error = LoadError::StringError(format!("{} is not a scene", name));
            return self.fail_immediately(HandlerKind::Scene, name, error);
        }

        self.submit(HandlerKind::Scene, name, |notify| TaskCommand::LoadAsset {
            name: name.to_string(),
            priority: Priority::Normal,
            notify,
        })
    }

    /// Opens a bundle and keeps it open until the handler is unloaded
    pub fn load_bundle(
        &mut self,
        name: &str,
    ) -> Handler {
        let services = &mut self.services;
        match services
            .database
            .get_or_create_bundle_info(name, &*services.io)
        {
            // Counts as a user from here on, so a pending unload of this bundle stands down
            Ok(info) => info.pending_requests += 1,
            Err(e) => return self.fail_immediately(HandlerKind::Bundle, name, e),
        }

        self.submit(HandlerKind::Bundle, name, |notify| TaskCommand::LoadBundle {
            name: name.to_string(),
            priority: Priority::Normal,
            notify,
        })
    }

    /// Fetches a bundle from the configured download url into the read-write root
    pub fn download_bundle(
        &mut self,
        name: &str,
    ) -> Handler {
        let services = &mut self.services;
        if let Err(e) = services
            .database
            .get_or_create_bundle_info(name, &*services.io)
        {
            return self.fail_immediately(HandlerKind::Download, name, e);
        }

        self.submit(HandlerKind::Download, name, |notify| TaskCommand::Download {
            name: name.to_string(),
            priority: Priority::Normal,
            notify,
        })
    }

    /// Downloads every bundle of the current manifest that is missing from or differs from
    /// `local`, optionally restricted to one group
    pub fn download_updates(
        &mut self,
        local: &Manifest,
        group: Option<&str>,
    ) -> Vec<Handler> {
        let names: Vec<String> = self
            .services
            .database
            .manifest()
            .bundles_to_update(local, group)
            .into_iter()
            .map(|x| x.name.clone())
            .collect();

        log::info!("{} bundle(s) need an update", names.len());
        names
            .iter()
            .map(|name| self.download_bundle(name))
            .collect()
    }

    /// Blocks, updating the manager, until the asset is loaded or has failed
    pub fn load_asset_sync(
        &mut self,
        name: &str,
    ) -> LoadResult<AssetInstance> {
        let handler = self.load_asset(name);
        loop {
            match self.handlers.state(handler) {
                HandlerState::Doing => {
                    self.update();
                    if self.handlers.state(handler) == HandlerState::Doing {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                HandlerState::Success => {
                    return self
                        .handlers
                        .instance(handler)
                        .ok_or(LoadError::InvalidHandler)
                }
                HandlerState::Failed => {
                    return Err(self
                        .handlers
                        .error(handler)
                        .unwrap_or(LoadError::InvalidHandler))
                }
                HandlerState::Invalid => return Err(LoadError::InvalidHandler),
            }
        }
    }

    //
    // Handlers
    //
    pub fn handler_state(
        &self,
        handler: Handler,
    ) -> HandlerState {
        self.handlers.state(handler)
    }

    /// 0..1 while in flight, 1 once resolved
    pub fn handler_progress(
        &self,
        handler: Handler,
    ) -> LoadResult<f32> {
        match self.handlers.state(handler) {
            HandlerState::Invalid => Err(LoadError::InvalidHandler),
            HandlerState::Doing => Ok(self
                .handlers
                .task(handler)
                .and_then(|(task, _)| self.runner.progress(task))
                .unwrap_or(0.0)),
            HandlerState::Success | HandlerState::Failed => Ok(1.0),
        }
    }

    pub fn handler_instance(
        &self,
        handler: Handler,
    ) -> Option<AssetInstance> {
        self.handlers.instance(handler)
    }

    pub fn handler_error(
        &self,
        handler: Handler,
    ) -> Option<LoadError> {
        self.handlers.error(handler)
    }

    /// Runs `callback` once the handler resolves, immediately if it already has
    pub fn on_complete<F>(
        &mut self,
        handler: Handler,
        callback: F,
    ) -> LoadResult<()>
    where
        F: FnOnce(&LoadOutcome) + 'static,
    {
        self.handlers.on_complete(handler, Box::new(callback))
    }

    /// Channel that receives the outcome once, at the end of the update the handler resolves in
    pub fn completion(
        &mut self,
        handler: Handler,
    ) -> LoadResult<crossbeam_channel::Receiver<LoadOutcome>> {
        self.handlers.completion(handler)
    }

    /// Cancels an in-flight request. The handler fails with [`LoadError::Cancelled`] on the next
    /// update, other requests merged into the same task are unaffected.
    pub fn cancel(
        &mut self,
        handler: Handler,
    ) -> LoadResult<()> {
        match self.handlers.state(handler) {
            HandlerState::Invalid => return Err(LoadError::InvalidHandler),
            HandlerState::Doing => {}
            HandlerState::Success | HandlerState::Failed => return Err(LoadError::NotInFlight),
        }

        match self.handlers.task(handler) {
            Some((task, request)) if self.runner.cancel_request(task, request) => {
                log::debug!("Cancel requested for {:?}", handler);
                Ok(())
            }
            _ => Err(LoadError::NotInFlight),
        }
    }

    /// Gives back what the handler holds and releases it. A request still in flight is cancelled.
    pub fn unload(
        &mut self,
        handler: Handler,
    ) -> LoadResult<()> {
        let kind = self.handlers.kind(handler)?;
        let state = self.handlers.state(handler);
        let result = match state {
            HandlerState::Doing => {
                let result = self.cancel(handler);
                self.drop_bundle_request(handler);
                result
            }
            HandlerState::Success => match kind {
                HandlerKind::Asset | HandlerKind::Scene => {
                    let name = self.handlers.name(handler)?.to_string();
                    self.release_asset(&name)
                }
                HandlerKind::Bundle => {
                    let name = self.handlers.name(handler)?.to_string();
                    self.release_bundle(&name)
                }
                HandlerKind::Download => Ok(()),
            },
            HandlerState::Failed | HandlerState::Invalid => Ok(()),
        };

        self.handlers.release(handler)?;
        result
    }

    /// Unloads by instance. The handler that produced the instance is released if it still exists.
    pub fn unload_instance(
        &mut self,
        instance: &AssetInstance,
    ) -> LoadResult<()> {
        if let Some(handler) = self.handlers.find_instance_holder(instance.id()) {
            return self.unload(handler);
        }

        match self.services.database.asset_for_instance(instance.id()) {
            Some(name) => {
                let name = name.to_string();
                self.release_asset(&name)
            }
            None => Err(LoadError::NotLoaded(instance.name().to_string())),
        }
    }

    /// Returns the handler to the pool without giving back its reference. A request still in
    /// flight is cancelled.
    pub fn release(
        &mut self,
        handler: Handler,
    ) -> LoadResult<()> {
        if self.handlers.state(handler) == HandlerState::Doing {
            self.cancel(handler)?;
            self.drop_bundle_request(handler);
        }
        self.handlers.release(handler)
    }

    fn release_asset(
        &mut self,
        name: &str,
    ) -> LoadResult<()> {
        let unused = self.services.database.release_asset(name)?;
        log::debug!("Released {}, ref count now {}", name, self.services.database.ref_count(name));
        self.schedule_unloads(unused);
        Ok(())
    }

    fn release_bundle(
        &mut self,
        name: &str,
    ) -> LoadResult<()> {
        let info = self
            .services
            .database
            .bundle_mut(name)
            .ok_or_else(|| LoadError::NotLoaded(name.to_string()))?;
        if info.external_refs == 0 {
            return Err(LoadError::NotLoaded(name.to_string()));
        }

        info.external_refs -= 1;
        if info.is_unused() {
            self.schedule_unloads(vec![name.to_string()]);
        }
        Ok(())
    }

    // Name of the bundle an unresolved explicit bundle request is waiting on
    fn pending_bundle_request(
        &self,
        handler: Handler,
    ) -> Option<String> {
        match self.handlers.kind(handler) {
            Ok(HandlerKind::Bundle) if self.handlers.state(handler) == HandlerState::Doing => {
                self.handlers.name(handler).ok().map(|x| x.to_string())
            }
            _ => None,
        }
    }

    /// Turns a pending explicit bundle request into an external reference, or drops it
    fn settle_bundle_request(
        &mut self,
        bundle: &str,
        granted: bool,
    ) {
        let unused = match self.services.database.bundle_mut(bundle) {
            Some(info) => {
                info.pending_requests = info.pending_requests.saturating_sub(1);
                if granted {
                    info.external_refs += 1;
                }
                info.is_unused() && info.loaded_handle.is_some()
            }
            None => false,
        };

        if unused {
            self.schedule_unloads(vec![bundle.to_string()]);
        }
    }

    fn drop_bundle_request(
        &mut self,
        handler: Handler,
    ) {
        if let Some(bundle) = self.pending_bundle_request(handler) {
            self.settle_bundle_request(&bundle, false);
        }
    }

    fn schedule_unloads(
        &mut self,
        bundles: Vec<String>,
    ) {
        if bundles.is_empty() {
            return;
        }

        let mut ctx = self.services.context(0.0);
        ctx.schedule_unloads(bundles);
        self.runner.apply_commands(&mut ctx);
    }

    fn resolve_handler(
        &mut self,
        key: HandlerKey,
        outcome: LoadOutcome,
    ) {
        let handler = Handler(key);
        let pending_bundle = self.pending_bundle_request(handler);
        let granted = outcome.is_ok();
        let orphaned_asset = match &outcome {
            Ok(Loaded::Asset(instance)) => Some(instance.name().to_string()),
            _ => None,
        };
        let opened_bundle = match &outcome {
            Ok(Loaded::Bundle(bundle)) => Some(bundle.clone()),
            _ => None,
        };

        if self.handlers.resolve(handler, outcome) {
            if let Some(bundle) = pending_bundle {
                self.settle_bundle_request(&bundle, granted);
            }
        } else if let Some(asset) = orphaned_asset {
            // Released while the load was finishing, give the reference back
            if let Err(e) = self.release_asset(&asset) {
                log::error!("Could not release orphaned load of {}: {}", asset, e);
            }
        } else if let Some(bundle) = opened_bundle {
            // The request was dropped when its handler was released
            let database = &self.services.database;
            if database.is_bundle_unused(&bundle) && database.is_bundle_loaded(&bundle) {
                self.schedule_unloads(vec![bundle]);
            }
        }
    }

    //
    // Ticking
    //

    /// Advances all tasks using the wall-clock time since the previous call
    pub fn update(&mut self) {
        let now = Instant::now();
        let delta = self
            .last_update
            .map(|last| now.duration_since(last))
            .unwrap_or_default();
        self.last_update = Some(now);
        self.update_with_delta(delta);
    }

    /// Advances all tasks as if `delta` has passed since the previous update
    #[profiling::function]
    pub fn update_with_delta(
        &mut self,
        delta: Duration,
    ) {
        let services = &mut self.services;
        services.io_results.drain(&mut *services.io);
        services.downloads.drain();

        let mut ctx = services.context(delta.as_secs_f32());
        self.runner.tick(&mut ctx);
        let resolved = std::mem::take(&mut ctx.resolved);

        for (key, outcome) in resolved {
            self.resolve_handler(key, outcome);
        }
        self.handlers.end_update();
    }

    //
    // Downloads
    //
    pub fn pause_group(
        &mut self,
        group: &str,
    ) {
        self.services.downloads.pause_group(group);
    }

    pub fn resume_group(
        &mut self,
        group: &str,
    ) {
        self.services.downloads.resume_group(group);
    }

    pub fn is_group_paused(
        &self,
        group: &str,
    ) -> bool {
        self.services.downloads.is_group_paused(group)
    }

    /// Called with raw byte counts on every update where a transfer received data
    pub fn set_download_listener<F>(
        &mut self,
        listener: F,
    ) where
        F: FnMut(&DownloadProgress) + 'static,
    {
        self.services.downloads.set_listener(Some(Box::new(listener)));
    }

    pub fn clear_download_listener(&mut self) {
        self.services.downloads.set_listener(None);
    }

    pub fn update_info(
        &self,
        bundle: &str,
    ) -> Option<UpdateInfo> {
        self.services.downloads.update_info(bundle).cloned()
    }

    pub fn update_infos(&self) -> Vec<UpdateInfo> {
        let mut infos: Vec<UpdateInfo> = self.services.downloads.update_infos().cloned().collect();
        infos.sort_by(|a, b| a.bundle.cmp(&b.bundle));
        infos
    }
}
