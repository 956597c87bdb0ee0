use crate::task::{Loaded, Step, TaskContext, TaskEnv, TaskStateMachine};

/// Closes a bundle once it has stayed unused for the configured delay. Finishes without evicting
/// as soon as the bundle is used again.
pub struct BundleUnloadTask {
    bundle: String,
    timer: f32,
    delay: f32,
    finished: bool,
}

impl BundleUnloadTask {
    pub fn new(
        bundle: String,
        delay: f32,
    ) -> Self {
        BundleUnloadTask {
            bundle,
            timer: 0.0,
            delay,
            finished: false,
        }
    }

    fn advance(
        &mut self,
        ctx: &mut TaskContext,
    ) -> Step {
        let info = match ctx.database.bundle(&self.bundle) {
            Some(info) => info,
            None => return self.finish(false),
        };

        if !info.is_unused() {
            log::debug!("Unload of {} cancelled, bundle is in use again", self.bundle);
            return self.finish(false);
        }

        if info.loaded_handle.is_none() {
            return self.finish(false);
        }

        self.timer += ctx.delta;
        if self.timer < self.delay {
            return Step::Pending;
        }

        let (handle, unused_dependencies) = ctx.database.evict_bundle(&self.bundle);
        if let Some(handle) = handle {
            log::debug!("Bundle {} evicted", self.bundle);
            ctx.io.close_bundle(&self.bundle, handle);
        }
        ctx.schedule_unloads(unused_dependencies);
        self.finish(true)
    }

    fn finish(
        &mut self,
        evicted: bool,
    ) -> Step {
        self.finished = true;
        Step::Finished(Ok(Loaded::Unloaded { evicted }))
    }
}

impl TaskStateMachine for BundleUnloadTask {
    fn run(
        &mut self,
        ctx: &mut TaskContext,
        _env: &mut TaskEnv,
    ) -> Step {
        log::trace!("Unload check for {} started", self.bundle);
        self.advance(ctx)
    }

    fn update(
        &mut self,
        ctx: &mut TaskContext,
        _env: &mut TaskEnv,
    ) -> Step {
        self.advance(ctx)
    }

    fn abandon(
        &mut self,
        _ctx: &mut TaskContext,
    ) {
    }

    fn progress(&self) -> f32 {
        if self.finished {
            1.0
        } else if self.delay <= 0.0 {
            0.0
        } else {
            (self.timer / self.delay).min(1.0)
        }
    }
}
