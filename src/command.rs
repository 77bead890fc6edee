//! The command side of a live coding server.
//!
//! Every connected client gets its own command thread. Commands arrive over a
//! channel and are handled one at a time on that thread. Batch work, such as
//! loading the modules of a newly enabled batch, is fanned out to the
//! [`Scheduler`] as child tasks of an empty root task. Patching brackets the
//! backend's work with the [`SyncPoint`] so that instrumented code in the
//! watched processes holds still.
//!
//! The server state is shared by all command threads. Registering modules and
//! applying a patch are serialized by a single action lock, so a patch never
//! observes a half-registered batch.

use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use kempt::Set;
use livecode_scheduler::sync::CriticalSection;
use livecode_scheduler::{Scheduler, TaskHandle};
use livecode_sync_point::SyncPoint;
use parking_lot::Mutex;

use crate::telemetry::TimedScope;

/// The work a server delegates to its environment.
pub trait LiveBackend: Send + Sync + 'static {
    /// A module loaded into the server.
    type Module: Send + 'static;

    /// Loads the module at `path`. Called from scheduler threads, possibly for
    /// several modules at once.
    fn load_module(&self, path: &str) -> Option<Self::Module>;

    /// Caches the environment the build tool at `tool` runs in. Called from
    /// scheduler threads.
    fn update_environment_cache(&self, tool: &str) -> bool;

    /// Applies a patch to the registered modules.
    ///
    /// Called while instrumented code is parked at the sync point.
    fn apply_patch(&self, modules: &[Self::Module]) -> bool;
}

/// Shared state of a live coding server and the factory for client command
/// threads.
pub struct CommandServer<B>
where
    B: LiveBackend,
{
    state: Arc<ServerState<B>>,
}

struct ServerState<B>
where
    B: LiveBackend,
{
    backend: B,
    scheduler: Scheduler,
    sync_point: Arc<SyncPoint>,
    // Held while modules are registered and while a patch is applied.
    actions: CriticalSection,
    registry: Mutex<ModuleRegistry<B::Module>>,
    next_client: AtomicUsize,
}

struct ModuleRegistry<M> {
    paths: Set<String>,
    modules: Vec<M>,
}

impl<B> CommandServer<B>
where
    B: LiveBackend,
{
    /// Returns a server patching through `backend`, running batch work on
    /// `scheduler`, and pausing instrumented code through `sync_point`.
    pub fn new(backend: B, scheduler: Scheduler, sync_point: Arc<SyncPoint>) -> Self {
        Self {
            state: Arc::new(ServerState {
                backend,
                scheduler,
                sync_point,
                actions: CriticalSection::new(),
                registry: Mutex::new(ModuleRegistry {
                    paths: Set::new(),
                    modules: Vec::new(),
                }),
                next_client: AtomicUsize::new(0),
            }),
        }
    }

    /// Spawns a command thread for a newly connected client.
    ///
    /// # Panics
    ///
    /// Panics if the thread cannot be spawned.
    #[must_use]
    pub fn connect(&self) -> CommandHandle {
        let client = self.state.next_client.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = flume::unbounded();
        let thread = thread::Builder::new()
            .name(format!("livecode-command-{client}"))
            .spawn({
                let state = self.state.clone();
                move || state.run(client, &receiver)
            })
            .expect("error spawning command thread");

        CommandHandle {
            client,
            sender,
            thread: Some(thread),
        }
    }

    /// The backend commands are delegated to.
    pub fn backend(&self) -> &B {
        &self.state.backend
    }

    /// The scheduler batch work runs on.
    pub fn scheduler(&self) -> &Scheduler {
        &self.state.scheduler
    }

    /// The number of modules registered by every client so far.
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.state.registry.lock().modules.len()
    }

    /// Returns true if a module loaded from `path` is registered.
    #[must_use]
    pub fn is_enabled(&self, path: &str) -> bool {
        self.state
            .registry
            .lock()
            .paths
            .contains(&String::from(path))
    }
}

impl<B> Debug for CommandServer<B>
where
    B: LiveBackend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandServer")
            .field("scheduler", &self.state.scheduler)
            .field("modules", &self.module_count())
            .finish_non_exhaustive()
    }
}

impl<B> ServerState<B>
where
    B: LiveBackend,
{
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn run(self: Arc<Self>, client: usize, commands: &Receiver<Command>) {
        debug!(client, "command thread started");
        while let Ok(command) = commands.recv() {
            match command {
                Command::EnableModules { paths, reply } => {
                    let _ = reply.send(self.enable_modules(paths));
                }
                Command::PrewarmEnvironment { tools, reply } => {
                    let _ = reply.send(self.prewarm_environment(tools));
                }
                Command::ApplyPatch { reply } => {
                    let _ = reply.send(self.apply_patch());
                }
                Command::Disconnect => break,
            }
        }
        debug!(client, "command thread stopped");
    }

    fn enable_modules(self: &Arc<Self>, paths: Vec<String>) -> Vec<String> {
        let _scope = TimedScope::new("enabling modules");

        let pending: Vec<String> = {
            let registry = self.registry.lock();
            paths
                .into_iter()
                .filter(|path| {
                    let known = registry.paths.contains(path);
                    if known {
                        warn!(path = %path, "module is already enabled");
                    }
                    !known
                })
                .collect()
        };

        // Load every module of the batch concurrently.
        let scheduler = &self.scheduler;
        let root = scheduler.create_empty_task();
        let tasks: Vec<TaskHandle<Option<(String, B::Module)>>> = pending
            .into_iter()
            .map(|path| {
                let state = self.clone();
                let task = scheduler.create_child_task(&root, move || {
                    let module = state.backend.load_module(&path);
                    if module.is_none() {
                        warn!(path = %path, "module could not be loaded");
                    }
                    module.map(|module| (path, module))
                });
                scheduler.run_task(&task);
                task
            })
            .collect();

        scheduler.run_task(&root);
        scheduler.wait_for_task(&root);

        // Register in submission order.
        let mut enabled = Vec::with_capacity(tasks.len());
        let actions = self.actions.enter();
        let mut registry = self.registry.lock();
        for (path, module) in tasks.iter().filter_map(TaskHandle::take_result).flatten() {
            if registry.paths.insert(path.clone()) {
                registry.modules.push(module);
                enabled.push(path);
            }
        }
        drop(registry);
        actions.leave();

        self.destroy(&root, &tasks);
        debug!(enabled = enabled.len(), "enabled modules");
        enabled
    }

    fn prewarm_environment(self: &Arc<Self>, tools: Vec<String>) -> usize {
        let _scope = TimedScope::new("prewarming environment cache");

        let mut seen = Set::new();
        let mut unique = Vec::with_capacity(tools.len());
        for tool in tools {
            if tool.is_empty() {
                warn!("not prewarming the environment of an empty tool path");
            } else if seen.insert(tool.clone()) {
                unique.push(tool);
            }
        }

        let scheduler = &self.scheduler;
        let root = scheduler.create_empty_task();
        let tasks: Vec<TaskHandle<bool>> = unique
            .into_iter()
            .map(|tool| {
                let state = self.clone();
                let task = scheduler.create_child_task(&root, move || {
                    state.backend.update_environment_cache(&tool)
                });
                scheduler.run_task(&task);
                task
            })
            .collect();

        scheduler.run_task(&root);
        scheduler.wait_for_task(&root);

        let warmed = tasks
            .iter()
            .filter(|task| task.take_result().unwrap_or(false))
            .count();
        self.destroy(&root, &tasks);
        warmed
    }

    fn apply_patch(&self) -> bool {
        let _scope = TimedScope::new("applying patch");

        // No module can be registered while patching.
        let _actions = self.actions.enter();
        let paused = self.sync_point.pause();
        if !paused.synchronized() {
            debug!("no instrumented code has reached the sync point");
        }

        let registry = self.registry.lock();
        self.backend.apply_patch(&registry.modules)
    }

    fn destroy<R>(&self, root: &TaskHandle<bool>, children: &[TaskHandle<R>])
    where
        R: Send + 'static,
    {
        if let Err(err) = self.scheduler.destroy_tasks(children) {
            error!(%err, "error destroying batch tasks");
        }
        if let Err(err) = self.scheduler.destroy_task(root) {
            error!(%err, "error destroying batch root");
        }
    }
}

enum Command {
    EnableModules {
        paths: Vec<String>,
        reply: Sender<Vec<String>>,
    },
    PrewarmEnvironment {
        tools: Vec<String>,
        reply: Sender<usize>,
    },
    ApplyPatch {
        reply: Sender<bool>,
    },
    Disconnect,
}

/// A client's connection to its command thread.
///
/// Dropping the handle stops the command thread once it finishes its current
/// command, without waiting for it.
#[derive(Debug)]
pub struct CommandHandle {
    client: usize,
    sender: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl CommandHandle {
    /// The id of this client, unique per server.
    #[must_use]
    pub const fn client(&self) -> usize {
        self.client
    }

    /// Loads and registers the modules at `paths`.
    ///
    /// Returns the paths that were newly enabled, in the order given. Paths
    /// that were already enabled or failed to load are left out.
    pub fn enable_modules<I>(&self, paths: I) -> Result<Vec<String>, CommandError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let paths = paths.into_iter().map(Into::into).collect();
        self.request(|reply| Command::EnableModules { paths, reply })
    }

    /// Warms the environment cache of every distinct, non-empty tool path.
    ///
    /// Returns how many tools were warmed successfully.
    pub fn prewarm<I>(&self, tools: I) -> Result<usize, CommandError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let tools = tools.into_iter().map(Into::into).collect();
        self.request(|reply| Command::PrewarmEnvironment { tools, reply })
    }

    /// Pauses instrumented code and applies a patch to every registered
    /// module, returning the backend's result.
    pub fn apply_patch(&self) -> Result<bool, CommandError> {
        self.request(|reply| Command::ApplyPatch { reply })
    }

    /// Stops the command thread and waits for it to exit.
    pub fn disconnect(mut self) -> Result<(), CommandError> {
        self.sender
            .send(Command::Disconnect)
            .map_err(|_| CommandError::Disconnected)?;
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| CommandError::Panicked),
            None => Ok(()),
        }
    }

    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> Command) -> Result<T, CommandError> {
        let (reply, response) = flume::bounded(1);
        self.sender
            .send(command(reply))
            .map_err(|_| CommandError::Disconnected)?;
        response.recv().map_err(|_| CommandError::Disconnected)
    }
}

impl Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::EnableModules { paths, .. } => {
                f.debug_struct("EnableModules").field("paths", paths).finish()
            }
            Command::PrewarmEnvironment { tools, .. } => f
                .debug_struct("PrewarmEnvironment")
                .field("tools", tools)
                .finish(),
            Command::ApplyPatch { .. } => f.write_str("ApplyPatch"),
            Command::Disconnect => f.write_str("Disconnect"),
        }
    }
}

/// Errors talking to a command thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// The command thread has exited.
    Disconnected,
    /// The command thread panicked.
    Panicked,
}

impl Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Disconnected => f.write_str("command thread disconnected"),
            CommandError::Panicked => f.write_str("command thread panicked"),
        }
    }
}

impl std::error::Error for CommandError {}
