use crate::task::{
    ChildOutcome, Loaded, LoadOutcome, Notify, Priority, RequestId, Step, TaskCommand, TaskContext,
    TaskEnv, TaskKey, TaskKind, TaskRequest, TaskState,
};
use crate::tasks::{AssetLoadTask, BundleLoadTask, BundleUnloadTask, DownloadTask, TaskBody};
use crate::LoadError;
use cask_base::hashing::HashMap;
use slotmap::SlotMap;

struct Task {
    name: String,
    priority: Priority,
    state: TaskState,
    requests: Vec<TaskRequest>,
    body: TaskBody,
}

/// Result of handing a request to the runner
#[derive(Debug)]
pub enum Submitted {
    // Merged into or created a task, the outcome arrives when it finishes
    Queued {
        task: TaskKey,
        request: RequestId,
    },
    // Resolved without a task: fast path or an immediate failure
    Completed(LoadOutcome),
}

#[derive(Clone, Debug)]
pub struct TaskSnapshot {
    pub kind: TaskKind,
    pub name: String,
    pub state: TaskState,
    pub priority: Priority,
    pub progress: f32,
    pub requests: usize,
}

/// Cooperative scheduler for named tasks.
///
/// At most one task exists per (kind, name); a second request for the same name is appended to the
/// existing task. Each tick walks the priority lanes from highest to lowest. Started tasks are
/// always updated, tasks that have not started yet are started in enqueue order until the per-tick
/// start budget is used up.
pub struct TaskRunner {
    tasks: SlotMap<TaskKey, Task>,
    lanes: Vec<Vec<TaskKey>>,
    by_name: HashMap<(TaskKind, String), TaskKey>,
    inbox: HashMap<TaskKey, Vec<ChildOutcome>>,
    next_request_id: u64,
    started_count: u64,
}

impl Default for TaskRunner {
    fn default() -> Self {
        TaskRunner {
            tasks: Default::default(),
            lanes: (0..Priority::COUNT).map(|_| Vec::default()).collect(),
            by_name: Default::default(),
            inbox: Default::default(),
            next_request_id: 1,
            started_count: 0,
        }
    }
}

impl TaskRunner {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of tasks that have been started since creation, merged requests do not count
    pub fn started_count(&self) -> u64 {
        self.started_count
    }

    pub fn find_task(
        &self,
        kind: TaskKind,
        name: &str,
    ) -> Option<TaskKey> {
        self.by_name.get(&(kind, name.to_string())).copied()
    }

    pub fn task_state(
        &self,
        key: TaskKey,
    ) -> TaskState {
        self.tasks
            .get(key)
            .map(|x| x.state)
            .unwrap_or(TaskState::Free)
    }

    pub fn progress(
        &self,
        key: TaskKey,
    ) -> Option<f32> {
        self.tasks.get(key).map(|x| x.body.progress())
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let mut snapshot = Vec::with_capacity(self.tasks.len());
        for lane in self.lanes.iter().rev() {
            for key in lane {
                if let Some(task) = self.tasks.get(*key) {
                    snapshot.push(TaskSnapshot {
                        kind: task.body.kind(),
                        name: task.name.clone(),
                        state: task.state,
                        priority: task.priority,
                        progress: task.body.progress(),
                        requests: task.requests.len(),
                    });
                }
            }
        }
        snapshot
    }

    /// Marks a request as cancelled. It is removed and told so at the start of the next tick.
    pub fn cancel_request(
        &mut self,
        task: TaskKey,
        request: RequestId,
    ) -> bool {
        let task = match self.tasks.get_mut(task) {
            Some(task) => task,
            None => return false,
        };

        match task.requests.iter_mut().find(|x| x.id == request) {
            Some(request) => {
                request.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Drops every task without running completion, used when the manifest is reloaded
    pub fn clear(&mut self) {
        self.tasks.clear();
        for lane in &mut self.lanes {
            lane.clear();
        }
        self.by_name.clear();
        self.inbox.clear();
    }

    fn allocate_request(
        &mut self,
        notify: Notify,
    ) -> TaskRequest {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        TaskRequest {
            id,
            notify,
            cancelled: false,
        }
    }

    fn enqueue(
        &mut self,
        kind: TaskKind,
        name: &str,
        priority: Priority,
        notify: Notify,
        make_body: impl FnOnce() -> TaskBody,
    ) -> Submitted {
        let request = self.allocate_request(notify);
        let request_id = request.id;

        if let Some(&key) = self.by_name.get(&(kind, name.to_string())) {
            if let Some(task) = self.tasks.get_mut(key) {
                log::trace!("Merged {:?} request for {} into existing task", kind, name);
                task.requests.push(request);
                return Submitted::Queued {
                    task: key,
                    request: request_id,
                };
            }
        }

        log::trace!("New {:?} task {} at {:?}", kind, name, priority);
        let key = self.tasks.insert(Task {
            name: name.to_string(),
            priority,
            state: TaskState::Waiting,
            requests: vec![request],
            body: make_body(),
        });
        self.by_name.insert((kind, name.to_string()), key);
        self.lanes[priority.lane()].push(key);

        Submitted::Queued {
            task: key,
            request: request_id,
        }
    }

    /// Hands a command to the runner. Commands that resolve immediately notify a parent task here;
    /// for handlers the outcome is returned to the caller.
    pub fn submit(
        &mut self,
        command: TaskCommand,
        ctx: &mut TaskContext,
    ) -> Submitted {
        let (notify, submitted, kind, name) = match command {
            TaskCommand::LoadAsset {
                name,
                priority,
                notify,
            } => {
                let submitted = match Self::try_fast_path(&name, ctx) {
                    Some(outcome) => Submitted::Completed(outcome),
                    None => self.enqueue(TaskKind::AssetLoad, &name, priority, notify, || {
                        TaskBody::AssetLoad(AssetLoadTask::new(name.clone()))
                    }),
                };
                (notify, submitted, TaskKind::AssetLoad, name)
            }
            TaskCommand::LoadBundle {
                name,
                priority,
                notify,
            } => {
                let submitted = if name.is_empty() {
                    Submitted::Completed(Err(LoadError::NameEmpty))
                } else {
                    self.enqueue(TaskKind::BundleLoad, &name, priority, notify, || {
                        TaskBody::BundleLoad(BundleLoadTask::new(name.clone()))
                    })
                };
                (notify, submitted, TaskKind::BundleLoad, name)
            }
            TaskCommand::Download {
                name,
                priority,
                notify,
            } => {
                let submitted = if name.is_empty() {
                    Submitted::Completed(Err(LoadError::NameEmpty))
                } else {
                    self.enqueue(TaskKind::Download, &name, priority, notify, || {
                        TaskBody::Download(DownloadTask::new(name.clone()))
                    })
                };
                (notify, submitted, TaskKind::Download, name)
            }
            TaskCommand::ScheduleUnload { bundle } => {
                let delay = ctx.config.unload_delay_seconds.max(0.0);
                let submitted =
                    self.enqueue(TaskKind::Unload, &bundle, Priority::Low, Notify::None, || {
                        TaskBody::Unload(BundleUnloadTask::new(bundle.clone(), delay))
                    });
                (Notify::None, submitted, TaskKind::Unload, bundle)
            }
        };

        if let (Submitted::Completed(outcome), Notify::Task(_)) = (&submitted, notify) {
            self.deliver(notify, kind, &name, outcome.clone(), ctx);
        }

        submitted
    }

    // A referenced asset with a bound instance resolves without a task
    fn try_fast_path(
        name: &str,
        ctx: &mut TaskContext,
    ) -> Option<LoadOutcome> {
        let info = match ctx.database.get_or_create_asset_info(name, &*ctx.io) {
            Ok(info) => info,
            Err(e) => return Some(Err(e)),
        };

        if info.ref_count == 0 {
            return None;
        }

        let instance = info.loaded_instance.clone()?;
        ctx.database.retain_asset(name, 1);
        log::trace!(
            "Asset {} already loaded, ref count now {}",
            name,
            ctx.database.ref_count(name)
        );
        Some(Ok(Loaded::Asset(instance)))
    }

    fn deliver(
        &mut self,
        notify: Notify,
        kind: TaskKind,
        name: &str,
        outcome: LoadOutcome,
        ctx: &mut TaskContext,
    ) {
        match notify {
            Notify::Handler(handler) => ctx.resolved.push((handler, outcome)),
            Notify::Task(parent) => {
                if self.tasks.contains_key(parent) {
                    self.inbox.entry(parent).or_default().push(ChildOutcome {
                        kind,
                        name: name.to_string(),
                        outcome,
                    });
                } else {
                    Self::release_orphan(outcome, ctx);
                }
            }
            Notify::None => {}
        }
    }

    // The task that asked for this result is gone, give back what the result holds
    fn release_orphan(
        outcome: LoadOutcome,
        ctx: &mut TaskContext,
    ) {
        match outcome {
            Ok(Loaded::Asset(instance)) => {
                log::debug!("Releasing {} loaded for a task that is gone", instance.name());
                ctx.release_asset(instance.name());
            }
            Ok(Loaded::Bundle(bundle)) => {
                if ctx.database.is_bundle_unused(&bundle) {
                    ctx.schedule_unload(&bundle);
                }
            }
            _ => {}
        }
    }

    fn remove_task(
        &mut self,
        key: TaskKey,
        ctx: &mut TaskContext,
    ) -> Option<Task> {
        let task = self.tasks.remove(key)?;
        self.by_name.remove(&(task.body.kind(), task.name.clone()));
        self.lanes[task.priority.lane()].retain(|x| *x != key);
        if let Some(leftovers) = self.inbox.remove(&key) {
            for child in leftovers {
                Self::release_orphan(child.outcome, ctx);
            }
        }
        Some(task)
    }

    fn finish_task(
        &mut self,
        key: TaskKey,
        outcome: LoadOutcome,
        ctx: &mut TaskContext,
    ) {
        let mut task = match self.remove_task(key, ctx) {
            Some(task) => task,
            None => return,
        };
        task.state = TaskState::Finished;
        let kind = task.body.kind();

        match &outcome {
            Ok(_) => log::debug!(
                "{:?} task {} finished for {} requests",
                kind,
                task.name,
                task.requests.len()
            ),
            Err(e) => log::warn!("{:?} task {} failed: {}", kind, task.name, e),
        }

        for request in task.requests {
            let request_outcome = if request.cancelled {
                Err(LoadError::Cancelled)
            } else {
                outcome.clone()
            };
            self.deliver(request.notify, kind, &task.name, request_outcome, ctx);
        }
    }

    fn sweep_cancelled(
        &mut self,
        ctx: &mut TaskContext,
    ) {
        let keys: Vec<TaskKey> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.requests.iter().any(|x| x.cancelled))
            .map(|(key, _)| key)
            .collect();

        for key in keys {
            let (kind, name, cancelled, abandoned) = match self.tasks.get_mut(key) {
                Some(task) => {
                    let (cancelled, live): (Vec<_>, Vec<_>) =
                        task.requests.drain(..).partition(|x| x.cancelled);
                    task.requests = live;
                    let abandoned = task.requests.is_empty();
                    if abandoned && task.state == TaskState::Running {
                        task.body.abandon(ctx);
                    }
                    (task.body.kind(), task.name.clone(), cancelled, abandoned)
                }
                None => continue,
            };

            log::debug!(
                "{} request(s) cancelled on {:?} task {}",
                cancelled.len(),
                kind,
                name
            );
            if abandoned {
                self.remove_task(key, ctx);
            }

            for request in cancelled {
                self.deliver(request.notify, kind, &name, Err(LoadError::Cancelled), ctx);
            }
        }
    }

    /// Advances every task by one step. Must be called once per frame from the owning thread.
    #[profiling::function]
    pub fn tick(
        &mut self,
        ctx: &mut TaskContext,
    ) {
        self.sweep_cancelled(ctx);

        let mut starts_remaining = ctx.config.max_task_starts_per_tick.max(1);
        for lane in (0..Priority::COUNT).rev() {
            let keys = self.lanes[lane].clone();
            for key in keys {
                let task = match self.tasks.get_mut(key) {
                    Some(task) => task,
                    None => continue,
                };

                let starting = match task.state {
                    TaskState::Waiting if starts_remaining > 0 => true,
                    TaskState::Running => false,
                    _ => continue,
                };

                let mut env = TaskEnv {
                    key,
                    live_requests: task.requests.len(),
                    children: self.inbox.remove(&key).unwrap_or_default(),
                };

                let step = if starting {
                    starts_remaining -= 1;
                    self.started_count += 1;
                    task.state = TaskState::Running;
                    task.body.run(ctx, &mut env)
                } else {
                    task.body.update(ctx, &mut env)
                };

                if !env.children.is_empty() {
                    self.inbox.entry(key).or_default().append(&mut env.children);
                }

                if let Step::Finished(outcome) = step {
                    self.finish_task(key, outcome, ctx);
                }
            }
        }

        self.apply_commands(ctx);
    }

    /// Submits commands queued by tasks. Commands may queue more commands (e.g. releases that
    /// leave bundles unused), so this runs until the queue is empty.
    pub fn apply_commands(
        &mut self,
        ctx: &mut TaskContext,
    ) {
        loop {
            let commands = std::mem::take(&mut ctx.commands);
            if commands.is_empty() {
                break;
            }

            for command in commands {
                if let Submitted::Completed(Err(e)) = self.submit(command, ctx) {
                    log::trace!("Command resolved immediately with {}", e);
                }
            }
        }
    }
}
