//! The executor: accepts requests and runs them through the chain.
//!
//! `submit` resolves the action, registers the log entry in the global and
//! per-action indices, and returns straight away. The chain then runs on
//! its own task. Whatever step the chain stops at, the entry is marked
//! finished and listeners hear about it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::adapters::{CommandRunner, ShellRunner};
use crate::config::Config;
use crate::domain::{ActionBinding, ExecutionRequest, InternalLogEntry};

use super::access::{AccessPolicy, ConfigAccessPolicy};
use super::entity::{entity_prefix, EntityVariables};
use super::listener::{ExecutionEvent, ExecutionListener, ListenerHub};
use super::log_store::{lock, LogStore, SharedLogEntry};
use super::steps::{default_chain, ExecutionContext, ExecutionStep};

/// Awaitable completion of one submitted request
pub struct ExecutionHandle {
    tracking_id: String,
    task: JoinHandle<InternalLogEntry>,
}

impl ExecutionHandle {
    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    /// Wait for the chain to end and return the final log entry.
    ///
    /// Returns `None` only if the chain task panicked or was cancelled; the
    /// entry is still marked finished in that case.
    pub async fn wait(self) -> Option<InternalLogEntry> {
        self.task.await.ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Marks the entry finished and notifies listeners when the chain ends,
/// including when a step panics
struct FinishGuard<'a> {
    executor: &'a Executor,
    tracking_id: &'a str,
    entry: SharedLogEntry,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.executor.remove_kill_switch(self.tracking_id);

        let snapshot = {
            let mut entry = lock(&self.entry);
            entry.finish();
            entry.clone()
        };

        self.executor.listeners.notify(ExecutionEvent::Finished {
            entry: Box::new(snapshot),
        });
    }
}

/// Runs execution requests
pub struct Executor {
    config: RwLock<Arc<Config>>,
    bindings: RwLock<Vec<Arc<ActionBinding>>>,
    chain: Vec<Box<dyn ExecutionStep>>,
    kill_switches: Mutex<HashMap<String, mpsc::UnboundedSender<()>>>,

    pub(crate) logs: LogStore,
    pub(crate) listeners: ListenerHub,
    pub(crate) entities: EntityVariables,
    pub(crate) policy: Arc<dyn AccessPolicy>,
    pub(crate) runner: Arc<dyn CommandRunner>,
}

impl Executor {
    /// Create an executor using configured ACLs and the platform shell
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_components(config, Arc::new(ConfigAccessPolicy), Arc::new(ShellRunner::new()))
    }

    /// Create an executor with a specific access policy
    pub fn with_access_policy(config: Config, policy: Arc<dyn AccessPolicy>) -> Arc<Self> {
        Self::with_components(config, policy, Arc::new(ShellRunner::new()))
    }

    /// Create an executor with a specific access policy and runner
    pub fn with_components(
        config: Config,
        policy: Arc<dyn AccessPolicy>,
        runner: Arc<dyn CommandRunner>,
    ) -> Arc<Self> {
        let executor = Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            bindings: RwLock::new(Vec::new()),
            chain: default_chain(),
            kill_switches: Mutex::new(HashMap::new()),
            logs: LogStore::new(),
            listeners: ListenerHub::new(),
            entities: EntityVariables::new(),
            policy,
            runner,
        });

        executor.rebuild_action_map();
        executor
    }

    /// The configuration new requests will run with
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Submit a request. Returns once the log entry is registered; the
    /// chain runs in the background. Must be called within a Tokio runtime.
    pub fn submit(self: &Arc<Self>, request: ExecutionRequest) -> (ExecutionHandle, String) {
        let config = self.config();
        let binding = self.resolve_binding(&config, &request);
        let action_id = binding.as_ref().map(|b| b.action.id.clone());

        let (tracking_id, entry) = self.logs.register(
            &request.tracking_id,
            action_id.as_deref(),
            |id| {
                let mut entry = InternalLogEntry::new(id);
                entry.tags = request.tags.clone();
                entry.username = request.authenticated_user.username.clone();
                entry
            },
        );

        debug!(tracking_id = %tracking_id, action_title = %request.action_title, "Request submitted");

        let mut ctx = ExecutionContext {
            executor: Arc::clone(self),
            config,
            request,
            tracking_id: tracking_id.clone(),
            binding,
            entry,
            final_command: String::new(),
        };

        let executor = Arc::clone(self);
        let task = tokio::spawn(async move { executor.run_chain(&mut ctx).await });

        (
            ExecutionHandle {
                tracking_id: tracking_id.clone(),
                task,
            },
            tracking_id,
        )
    }

    async fn run_chain(&self, ctx: &mut ExecutionContext) -> InternalLogEntry {
        let tracking_id = ctx.tracking_id.clone();
        let guard = FinishGuard {
            executor: self,
            tracking_id: &tracking_id,
            entry: Arc::clone(&ctx.entry),
        };

        for step in &self.chain {
            if !step.run(ctx).await {
                debug!(tracking_id = %tracking_id, step = step.name(), "Chain stopped");
                break;
            }
        }

        drop(guard);
        ctx.with_entry(|e| e.clone())
    }

    /// Find the binding a request names: by binding ID first, then by
    /// title. A title lookup never carries an entity prefix.
    fn resolve_binding(&self, config: &Config, request: &ExecutionRequest) -> Option<Arc<ActionBinding>> {
        if let Some(binding_id) = &request.binding_id {
            if let Some(binding) = self.binding(binding_id) {
                return Some(binding);
            }
        }

        if request.action_title.is_empty() {
            return None;
        }

        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        if let Some(binding) = bindings
            .iter()
            .find(|b| b.entity_prefix.is_empty() && b.action.title == request.action_title)
        {
            return Some(Arc::clone(binding));
        }
        drop(bindings);

        let (config_order, action) = config
            .actions
            .iter()
            .enumerate()
            .find(|(_, a)| a.title == request.action_title)?;

        Some(Arc::new(ActionBinding {
            id: action.id.clone(),
            action: Arc::new(action.clone()),
            entity_prefix: String::new(),
            config_order,
        }))
    }

    /// Register a listener. Must be called within a Tokio runtime.
    pub fn add_listener(&self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.add(listener);
    }

    /// Rebuild the action map from the current configuration.
    ///
    /// Plain actions get one binding keyed by action ID. Entity-bound
    /// actions get one binding per entity instance, keyed
    /// `<actionID>.<entity>.<index>`.
    pub fn rebuild_action_map(&self) {
        let config = self.config();

        let mut variables = HashMap::new();
        for entity in config.entities.keys() {
            for (index, properties) in config.entity_instances(entity).into_iter().enumerate() {
                let prefix = entity_prefix(entity, index);
                for (key, value) in properties {
                    variables.insert(format!("{}.{}", prefix, key), value);
                }
            }
        }
        self.entities.replace_all(variables);

        let mut bindings = Vec::new();
        for (config_order, action) in config.actions.iter().enumerate() {
            let action = Arc::new(action.clone());

            if action.entity.is_empty() {
                bindings.push(Arc::new(ActionBinding {
                    id: action.id.clone(),
                    action,
                    entity_prefix: String::new(),
                    config_order,
                }));
                continue;
            }

            let instances = config.entity_instances(&action.entity).len();
            for index in 0..instances {
                let prefix = entity_prefix(&action.entity, index);
                bindings.push(Arc::new(ActionBinding {
                    id: format!("{}.{}", action.id, prefix),
                    action: Arc::clone(&action),
                    entity_prefix: prefix,
                    config_order,
                }));
            }
        }

        let count = bindings.len();
        *self.bindings.write().unwrap_or_else(|e| e.into_inner()) = bindings;

        info!(bindings = count, "Action map rebuilt");
        self.listeners.notify(ExecutionEvent::ActionMapRebuilt);
    }

    /// Swap in a new configuration. Requests already running keep the
    /// configuration they were submitted with.
    pub fn reload(&self, config: Config) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
        self.rebuild_action_map();
    }

    /// All bindings in configuration order
    pub fn bindings(&self) -> Vec<Arc<ActionBinding>> {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn binding(&self, binding_id: &str) -> Option<Arc<ActionBinding>> {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|b| b.id == binding_id)
            .cloned()
    }

    /// Ask a running execution to stop. Returns whether the request was
    /// handed to an execution still in its exec step; a process that exits
    /// at the same moment may never see it. Calling it again or after the
    /// chain has finished is harmless and returns `false`.
    pub fn kill(&self, tracking_id: &str) -> bool {
        let switches = lock(&self.kill_switches);
        match switches.get(tracking_id) {
            Some(kill_tx) => {
                info!(tracking_id = %tracking_id, "Killing execution");
                kill_tx.send(()).is_ok()
            }
            None => {
                debug!(tracking_id = %tracking_id, "Kill requested, but nothing is running");
                false
            }
        }
    }

    pub(crate) fn register_kill_switch(&self, tracking_id: &str, kill_tx: mpsc::UnboundedSender<()>) {
        lock(&self.kill_switches).insert(tracking_id.to_string(), kill_tx);
    }

    pub(crate) fn remove_kill_switch(&self, tracking_id: &str) {
        lock(&self.kill_switches).remove(tracking_id);
    }

    /// Snapshot of one log entry
    pub fn log(&self, tracking_id: &str) -> Option<InternalLogEntry> {
        self.logs.get(tracking_id)
    }

    /// Snapshots of an action's log entries, oldest first
    pub fn logs_for_action(&self, action_id: &str) -> Vec<InternalLogEntry> {
        self.logs.for_action(action_id)
    }

    /// Snapshots of every log entry, oldest first
    pub fn logs(&self) -> Vec<InternalLogEntry> {
        self.logs.all()
    }
}
