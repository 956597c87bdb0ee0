use crate::bundle_io::IoRequestId;
use crate::database::BundleState;
use crate::task::{
    Loaded, Notify, Priority, Step, TaskCommand, TaskContext, TaskEnv, TaskKind, TaskStateMachine,
};
use crate::LoadError;

enum BundleLoadPhase {
    Start,
    Downloading,
    Opening(IoRequestId),
    Done,
}

/// Opens a bundle's backing store at its resolved local path. Reference counts are left to the
/// asset loads, a bundle may be opened with nothing using it.
pub struct BundleLoadTask {
    name: String,
    phase: BundleLoadPhase,
}

impl BundleLoadTask {
    pub fn new(name: String) -> Self {
        BundleLoadTask {
            name,
            phase: BundleLoadPhase::Start,
        }
    }

    fn open(
        &mut self,
        ctx: &mut TaskContext,
    ) -> Step {
        let (path, is_raw) = match ctx.database.bundle(&self.name) {
            Some(info) => (info.local_path.clone(), info.manifest.is_raw),
            None => return self.fail("bundle record was dropped".to_string()),
        };

        let request = ctx.io_results.allocate_request();
        log::debug!("Bundle {} opening {:?}", self.name, path);
        ctx.io.open_bundle(request, &path, is_raw);
        self.phase = BundleLoadPhase::Opening(request);
        Step::Pending
    }

    fn fail(
        &mut self,
        reason: String,
    ) -> Step {
        log::warn!("Bundle {} failed to open: {}", self.name, reason);
        self.phase = BundleLoadPhase::Done;
        Step::Finished(Err(LoadError::BundleOpenFailed {
            bundle: self.name.clone(),
            reason,
        }))
    }

    fn succeed(
        &mut self,
        ctx: &mut TaskContext,
    ) -> Step {
        self.phase = BundleLoadPhase::Done;
        if ctx.database.is_bundle_unused(&self.name) {
            ctx.schedule_unload(&self.name);
        }
        Step::Finished(Ok(Loaded::Bundle(self.name.clone())))
    }
}

impl TaskStateMachine for BundleLoadTask {
    fn run(
        &mut self,
        ctx: &mut TaskContext,
        env: &mut TaskEnv,
    ) -> Step {
        let auto_download = ctx.config.auto_download_missing && ctx.config.download_url.is_some();
        let (loaded, state) = match ctx.database.get_or_create_bundle_info(&self.name, &*ctx.io) {
            Ok(info) => (info.loaded_handle.is_some(), info.state),
            Err(e) => return Step::Finished(Err(e)),
        };

        if loaded {
            log::trace!("Bundle {} already open", self.name);
            return self.succeed(ctx);
        }

        match state {
            BundleState::Missing if auto_download => {
                log::info!("Bundle {} is missing locally, downloading it first", self.name);
                ctx.commands.push(TaskCommand::Download {
                    name: self.name.clone(),
                    priority: Priority::High,
                    notify: Notify::Task(env.key),
                });
                self.phase = BundleLoadPhase::Downloading;
                Step::Pending
            }
            BundleState::Missing => self.fail("bundle is not available locally".to_string()),
            BundleState::Downloading => {
                // Joins the download already in flight, merged by name
                ctx.commands.push(TaskCommand::Download {
                    name: self.name.clone(),
                    priority: Priority::High,
                    notify: Notify::Task(env.key),
                });
                self.phase = BundleLoadPhase::Downloading;
                Step::Pending
            }
            BundleState::InReadOnly | BundleState::InReadWrite => self.open(ctx),
        }
    }

    fn update(
        &mut self,
        ctx: &mut TaskContext,
        env: &mut TaskEnv,
    ) -> Step {
        match self.phase {
            BundleLoadPhase::Start | BundleLoadPhase::Done => Step::Pending,
            BundleLoadPhase::Downloading => {
                let position = env
                    .children
                    .iter()
                    .position(|x| x.kind == TaskKind::Download);
                let child = match position {
                    Some(position) => env.children.swap_remove(position),
                    None => return Step::Pending,
                };

                match child.outcome {
                    Ok(_) => self.open(ctx),
                    Err(e) => self.fail(e.to_string()),
                }
            }
            BundleLoadPhase::Opening(request) => {
                let result = match ctx.io_results.take_opened(request) {
                    Some(result) => result,
                    None => return Step::Pending,
                };

                match result {
                    Ok(handle) => {
                        let info = match ctx.database.bundle_mut(&self.name) {
                            Some(info) => info,
                            None => {
                                ctx.io.close_bundle(&self.name, handle);
                                return self.fail("bundle record was dropped".to_string());
                            }
                        };

                        if let Some(previous) = info.loaded_handle.replace(handle) {
                            ctx.io.close_bundle(&self.name, previous);
                        }
                        log::debug!("Bundle {} opened", self.name);
                        self.succeed(ctx)
                    }
                    Err(e) => self.fail(e.to_string()),
                }
            }
        }
    }

    fn abandon(
        &mut self,
        ctx: &mut TaskContext,
    ) {
        log::debug!("Bundle load {} abandoned", self.name);
        if let BundleLoadPhase::Opening(request) = self.phase {
            ctx.io_results.abandon(request, &mut *ctx.io);
        }
        self.phase = BundleLoadPhase::Done;
    }

    fn progress(&self) -> f32 {
        match self.phase {
            BundleLoadPhase::Start => 0.0,
            BundleLoadPhase::Downloading => 0.25,
            BundleLoadPhase::Opening(_) => 0.5,
            BundleLoadPhase::Done => 1.0,
        }
    }
}
