mod asset_load;
mod bundle_load;
mod bundle_unload;
mod download;

pub use asset_load::AssetLoadTask;
pub use bundle_load::BundleLoadTask;
pub use bundle_unload::BundleUnloadTask;
pub use download::DownloadTask;

use crate::task::{Step, TaskContext, TaskEnv, TaskKind, TaskStateMachine};

/// The closed set of task kinds the runner schedules
pub enum TaskBody {
    AssetLoad(AssetLoadTask),
    BundleLoad(BundleLoadTask),
    Unload(BundleUnloadTask),
    Download(DownloadTask),
}

impl TaskBody {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskBody::AssetLoad(_) => TaskKind::AssetLoad,
            TaskBody::BundleLoad(_) => TaskKind::BundleLoad,
            TaskBody::Unload(_) => TaskKind::Unload,
            TaskBody::Download(_) => TaskKind::Download,
        }
    }

    fn state_machine(&mut self) -> &mut dyn TaskStateMachine {
        match self {
            TaskBody::AssetLoad(x) => x,
            TaskBody::BundleLoad(x) => x,
            TaskBody::Unload(x) => x,
            TaskBody::Download(x) => x,
        }
    }

    pub fn run(
        &mut self,
        ctx: &mut TaskContext,
        env: &mut TaskEnv,
    ) -> Step {
        self.state_machine().run(ctx, env)
    }

    pub fn update(
        &mut self,
        ctx: &mut TaskContext,
        env: &mut TaskEnv,
    ) -> Step {
        self.state_machine().update(ctx, env)
    }

    pub fn abandon(
        &mut self,
        ctx: &mut TaskContext,
    ) {
        self.state_machine().abandon(ctx)
    }

    pub fn progress(&self) -> f32 {
        match self {
            TaskBody::AssetLoad(x) => x.progress(),
            TaskBody::BundleLoad(x) => x.progress(),
            TaskBody::Unload(x) => x.progress(),
            TaskBody::Download(x) => x.progress(),
        }
    }
}
