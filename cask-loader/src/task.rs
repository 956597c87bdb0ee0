use crate::bundle_io::{BundleIO, IoResults};
use crate::database::ResourceDatabase;
use crate::download::DownloadService;
use crate::handler::HandlerKey;
use crate::{AssetInstance, LoadError, LoaderConfig};

slotmap::new_key_type! {
    pub struct TaskKey;
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    BundleLoad,
    AssetLoad,
    Unload,
    Download,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TaskState {
    Free,
    Waiting,
    Running,
    Finished,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Priority {
    VeryLow,
    Low,
    Normal,
    High,
    VeryHigh,
}

impl Priority {
    pub const COUNT: usize = 5;

    pub fn lane(self) -> usize {
        self as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct RequestId(pub u64);

/// Who is told when a task finishes
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Notify {
    Handler(HandlerKey),
    Task(TaskKey),
    None,
}

/// One caller of a task. Duplicate requests for the same name are merged into one task as extra
/// requests and are notified in the order they were made.
#[derive(Debug)]
pub struct TaskRequest {
    pub id: RequestId,
    pub notify: Notify,
    pub cancelled: bool,
}

#[derive(Clone, Debug)]
pub enum Loaded {
    Asset(AssetInstance),
    Bundle(String),
    Downloaded(String),
    Unloaded { evicted: bool },
}

pub type LoadOutcome = Result<Loaded, LoadError>;

/// Outcome of a child task, waiting in the parent's inbox until the parent's next update
#[derive(Debug)]
pub struct ChildOutcome {
    pub kind: TaskKind,
    pub name: String,
    pub outcome: LoadOutcome,
}

/// Work a task asks the runner to do once the current tick's task updates are done
#[derive(Debug)]
pub enum TaskCommand {
    LoadAsset {
        name: String,
        priority: Priority,
        notify: Notify,
    },
    LoadBundle {
        name: String,
        priority: Priority,
        notify: Notify,
    },
    Download {
        name: String,
        priority: Priority,
        notify: Notify,
    },
    ScheduleUnload {
        bundle: String,
    },
}

/// Everything a task may touch while it is advanced. Only exists on the tick thread.
pub struct TaskContext<'a> {
    pub database: &'a mut ResourceDatabase,
    pub io: &'a mut dyn BundleIO,
    pub io_results: &'a mut IoResults,
    pub downloads: &'a mut DownloadService,
    pub config: &'a LoaderConfig,
    // Seconds since the previous tick
    pub delta: f32,
    pub commands: Vec<TaskCommand>,
    pub resolved: Vec<(HandlerKey, LoadOutcome)>,
}

impl<'a> TaskContext<'a> {
    pub fn schedule_unload(
        &mut self,
        bundle: &str,
    ) {
        self.commands.push(TaskCommand::ScheduleUnload {
            bundle: bundle.to_string(),
        });
    }

    pub fn schedule_unloads(
        &mut self,
        bundles: Vec<String>,
    ) {
        for bundle in bundles {
            self.commands.push(TaskCommand::ScheduleUnload { bundle });
        }
    }

    /// Gives back one reference on an asset and queues unload checks for bundles it left unused
    pub fn release_asset(
        &mut self,
        asset: &str,
    ) {
        match self.database.release_asset(asset) {
            Ok(unused) => self.schedule_unloads(unused),
            Err(e) => log::error!("Failed to release {}: {}", asset, e),
        }
    }
}

/// What the runner hands a task when it is advanced
pub struct TaskEnv {
    pub key: TaskKey,
    // Requests that are still interested in the result
    pub live_requests: usize,
    pub children: Vec<ChildOutcome>,
}

pub enum Step {
    Pending,
    Finished(LoadOutcome),
}

/// A resumable state machine driven by the [`TaskRunner`](crate::TaskRunner). `run` is called on
/// the first tick the task is started, `update` on every tick after that until it returns
/// [`Step::Finished`].
pub trait TaskStateMachine {
    fn run(
        &mut self,
        ctx: &mut TaskContext,
        env: &mut TaskEnv,
    ) -> Step;

    fn update(
        &mut self,
        ctx: &mut TaskContext,
        env: &mut TaskEnv,
    ) -> Step;

    /// Every request was cancelled after the task started. Undo whatever the task has done so far.
    fn abandon(
        &mut self,
        ctx: &mut TaskContext,
    );

    fn progress(&self) -> f32;
}
