//! The execution chain.
//!
//! Each step gets the request's context and returns whether the chain
//! should continue. The first `false` stops the chain; finishing the log
//! entry and notifying listeners happen afterwards regardless (see
//! `Executor::run_chain`).
//!
//! Order: resolve action, concurrency check, rate check, ACL check, parse
//! arguments, log start, exec, exec after, log finish, save log, trigger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{argument_env, ProcessObserver, ProcessSpec, SIGNALED_EXIT_CODE};
use crate::config::Config;
use crate::domain::{Action, ActionArgument, ActionBinding, ExecutionRequest, InternalLogEntry};

use super::admission::{check_concurrency, check_rate};
use super::arguments::{parse_action_arguments, RAW_STRING_TYPE};
use super::executor::Executor;
use super::listener::{ExecutionEvent, ListenerHub};
use super::log_store::{lock, SharedLogEntry};
use super::persist::{save_log, LogDirectories};

/// Everything a step can see and change about one request
pub struct ExecutionContext {
    pub executor: Arc<Executor>,

    /// Configuration captured when the request was submitted
    pub config: Arc<Config>,

    pub request: ExecutionRequest,
    pub tracking_id: String,

    /// `None` when the requested action could not be found
    pub binding: Option<Arc<ActionBinding>>,

    pub entry: SharedLogEntry,

    /// Shell command after argument substitution
    pub final_command: String,
}

impl ExecutionContext {
    pub fn action(&self) -> Option<Arc<Action>> {
        self.binding.as_ref().map(|b| Arc::clone(&b.action))
    }

    pub fn entity_prefix(&self) -> &str {
        self.binding
            .as_ref()
            .map(|b| b.entity_prefix.as_str())
            .unwrap_or("")
    }

    /// What the caller asked for, for messages
    pub fn requested_name(&self) -> &str {
        self.request
            .binding_id
            .as_deref()
            .filter(|_| self.request.action_title.is_empty())
            .unwrap_or(&self.request.action_title)
    }

    /// Mutate the log entry. The lock is released before this returns.
    pub fn with_entry<R>(&self, f: impl FnOnce(&mut InternalLogEntry) -> R) -> R {
        f(&mut lock(&self.entry))
    }

    pub fn action_title(&self) -> String {
        self.with_entry(|e| e.action_title.clone())
    }

    /// Mark the entry blocked with a reason and log it
    pub fn block(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(action_title = %self.action_title(), tracking_id = %self.tracking_id, "{}", reason);
        self.with_entry(|e| e.mark_blocked(reason));
    }
}

/// One link of the chain
#[async_trait]
pub trait ExecutionStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `false` to stop the chain
    async fn run(&self, ctx: &mut ExecutionContext) -> bool;
}

/// The steps every request goes through, in order
pub fn default_chain() -> Vec<Box<dyn ExecutionStep>> {
    vec![
        Box::new(ResolveAction),
        Box::new(ConcurrencyCheck),
        Box::new(RateCheck),
        Box::new(AclCheck),
        Box::new(ParseArgs),
        Box::new(LogStart),
        Box::new(Exec),
        Box::new(ExecAfter),
        Box::new(LogFinish),
        Box::new(SaveLog),
        Box::new(Trigger),
    ]
}

pub struct ResolveAction;

#[async_trait]
impl ExecutionStep for ResolveAction {
    fn name(&self) -> &'static str {
        "resolve_action"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(binding) = ctx.binding.clone() else {
            let requested = ctx.requested_name().to_string();
            warn!(action_title = %requested, "Action requested, but not found");
            ctx.with_entry(|e| e.output = format!("Action not found: {}", requested));
            return false;
        };

        let title = ctx
            .executor
            .entities
            .replace_entity_vars(&binding.entity_prefix, &binding.action.title);

        ctx.with_entry(|e| {
            e.action_title = title.clone();
            e.action_icon = binding.action.icon.clone();
            e.action_id = binding.action.id.clone();
        });

        info!(action_title = %title, tags = ?ctx.request.tags, "Action requested");
        true
    }
}

pub struct ConcurrencyCheck;

#[async_trait]
impl ExecutionStep for ConcurrencyCheck {
    fn name(&self) -> &'static str {
        "concurrency_check"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(action) = ctx.action() else {
            return false;
        };

        let result = ctx
            .executor
            .logs
            .with_action_logs(&action.id, |entries| {
                check_concurrency(entries, action.max_concurrent)
            });

        match result {
            Ok(()) => true,
            Err(violation) => {
                ctx.block(violation.to_string());
                false
            }
        }
    }
}

pub struct RateCheck;

#[async_trait]
impl ExecutionStep for RateCheck {
    fn name(&self) -> &'static str {
        "rate_check"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(action) = ctx.action() else {
            return false;
        };

        let now = Utc::now();
        let result = ctx
            .executor
            .logs
            .with_action_logs(&action.id, |entries| check_rate(entries, &action.max_rate, now));

        match result {
            Ok(()) => true,
            Err(violation) => {
                ctx.block(violation.to_string());
                false
            }
        }
    }
}

pub struct AclCheck;

#[async_trait]
impl ExecutionStep for AclCheck {
    fn name(&self) -> &'static str {
        "acl_check"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(action) = ctx.action() else {
            return false;
        };

        let user = &ctx.request.authenticated_user;
        if ctx.executor.policy.is_allowed_exec(&ctx.config, user, &action) {
            return true;
        }

        ctx.block(format!(
            "Permission denied: {} is not allowed to execute this action.",
            user.username
        ));
        false
    }
}

pub struct ParseArgs;

#[async_trait]
impl ExecutionStep for ParseArgs {
    fn name(&self) -> &'static str {
        "parse_args"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(action) = ctx.action() else {
            return false;
        };

        let parsed = parse_action_arguments(
            &action.shell,
            &ctx.request.arguments,
            &action,
            ctx.entity_prefix(),
            &ctx.executor.entities,
        );

        match parsed {
            Ok(command) => {
                ctx.final_command = command;
                true
            }
            Err(e) => {
                ctx.block(e.to_string());
                false
            }
        }
    }
}

pub struct LogStart;

#[async_trait]
impl ExecutionStep for LogStart {
    fn name(&self) -> &'static str {
        "log_start"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(action) = ctx.action() else {
            return false;
        };

        let action_title = ctx.action_title();
        info!(action_title = %action_title, timeout = action.timeout, "Action starting");

        ctx.executor
            .listeners
            .notify(ExecutionEvent::Started { action_title });
        true
    }
}

/// Appends process output to the log entry and fans it out to listeners
struct EntrySink<'a> {
    entry: &'a SharedLogEntry,
    listeners: &'a ListenerHub,
    tracking_id: &'a str,
    raw: Mutex<Vec<u8>>,
}

impl<'a> EntrySink<'a> {
    fn new(entry: &'a SharedLogEntry, listeners: &'a ListenerHub, tracking_id: &'a str) -> Self {
        Self {
            entry,
            listeners,
            tracking_id,
            raw: Mutex::new(Vec::new()),
        }
    }

    /// The complete output, decoded once so multi-byte characters split
    /// across chunks survive
    fn into_output(self) -> String {
        let raw = self.raw.into_inner().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&raw).into_owned()
    }
}

impl ProcessObserver for EntrySink<'_> {
    fn on_spawn(&self, pid: Option<u32>) {
        lock(self.entry).process_id = pid;
    }

    fn on_output(&self, chunk: &[u8]) {
        lock(&self.raw).extend_from_slice(chunk);
        lock(self.entry)
            .output
            .push_str(&String::from_utf8_lossy(chunk));

        self.listeners.notify(ExecutionEvent::OutputChunk {
            chunk: chunk.to_vec(),
            tracking_id: self.tracking_id.to_string(),
        });
    }
}

pub struct Exec;

#[async_trait]
impl ExecutionStep for Exec {
    fn name(&self) -> &'static str {
        "exec"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(action) = ctx.action() else {
            return false;
        };

        let spec = ProcessSpec::new(ctx.final_command.clone(), action.timeout_duration())
            .with_env(argument_env(&ctx.request.arguments));

        let executor = Arc::clone(&ctx.executor);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        executor.register_kill_switch(&ctx.tracking_id, kill_tx);

        ctx.with_entry(|e| e.execution_started = true);

        let sink = EntrySink::new(&ctx.entry, &executor.listeners, &ctx.tracking_id);
        let outcome = executor.runner.run_streaming(&spec, &sink, kill_rx).await;
        let output = sink.into_output();

        executor.remove_kill_switch(&ctx.tracking_id);

        let tags = ctx.request.tags.clone();
        ctx.with_entry(|e| {
            e.output = output;
            if let Some(exit_code) = outcome.exit_code {
                e.exit_code = exit_code;
            }
            if let Some(errors) = outcome.error_text() {
                e.prepend_error(&errors);
            }
            e.timed_out = outcome.timed_out;
            e.process_id = None;
            e.tags = tags;
            e.datetime_finished = Some(Utc::now());
        });

        true
    }
}

/// Placeholders available to `shell_after_completed`
const HOOK_OUTPUT_ARG: &str = "output";
const HOOK_EXIT_CODE_ARG: &str = "exitCode";

/// The action as seen by its after-completion hook: only `output` and
/// `exitCode` are declared. A type the action declares for either wins.
fn hook_action(action: &Action) -> Action {
    let mut hook = action.clone();
    hook.arguments = [HOOK_OUTPUT_ARG, HOOK_EXIT_CODE_ARG]
        .iter()
        .map(|name| {
            action
                .find_arg(name)
                .cloned()
                .unwrap_or_else(|| ActionArgument::typed(*name, RAW_STRING_TYPE))
        })
        .collect();
    hook
}

pub struct ExecAfter;

#[async_trait]
impl ExecutionStep for ExecAfter {
    fn name(&self) -> &'static str {
        "exec_after"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(action) = ctx.action() else {
            return false;
        };

        if action.shell_after_completed.is_empty() {
            return true;
        }

        let (output, exit_code) = ctx.with_entry(|e| (e.output.clone(), e.exit_code.to_string()));

        let mut values = HashMap::new();
        values.insert(HOOK_OUTPUT_ARG.to_string(), output.clone());
        values.insert(HOOK_EXIT_CODE_ARG.to_string(), exit_code.clone());

        let command = match parse_action_arguments(
            &action.shell_after_completed,
            &values,
            &hook_action(&action),
            ctx.entity_prefix(),
            &ctx.executor.entities,
        ) {
            Ok(command) => command,
            Err(e) => {
                warn!(action_title = %ctx.action_title(), error = %e, "shellAfterCompleted not run");
                ctx.with_entry(|entry| {
                    entry.output.push_str(&format!(
                        "Your shellAfterCompleted command could not be run: {}",
                        e
                    ))
                });
                return true;
            }
        };

        let mut env = HashMap::new();
        env.insert("OUTPUT".to_string(), output);
        env.insert("EXITCODE".to_string(), exit_code);

        let spec = ProcessSpec::new(command, action.timeout_duration()).with_env(env);
        let captured = ctx.executor.runner.run_captured(&spec).await;

        ctx.with_entry(|e| {
            e.output.push_str(&format!("---\n{}", captured.stdout));
            e.output.push_str(&format!("---\n{}", captured.stderr));

            if let Some(error) = &captured.error {
                e.prepend_error(&error.to_string());
            }

            if captured.timed_out {
                e.output.push_str("Your shellAfterCompleted command timed out.\n");
            }

            e.output.push_str(&format!(
                "Your shellAfterCompleted command exited with code {}",
                captured.exit_code.unwrap_or(SIGNALED_EXIT_CODE)
            ));
        });

        true
    }
}

pub struct LogFinish;

#[async_trait]
impl ExecutionStep for LogFinish {
    fn name(&self) -> &'static str {
        "log_finish"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let (action_title, output_length, timed_out, exit_code) = ctx.with_entry(|e| {
            e.finish();
            (e.action_title.clone(), e.output.len(), e.timed_out, e.exit_code)
        });

        info!(
            action_title = %action_title,
            output_length,
            timed_out,
            exit_code,
            "Action finished"
        );
        true
    }
}

pub struct SaveLog;

#[async_trait]
impl ExecutionStep for SaveLog {
    fn name(&self) -> &'static str {
        "save_log"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(action) = ctx.action() else {
            return false;
        };

        let dirs = LogDirectories::resolve(&action.save_logs, &ctx.config.save_logs);
        if dirs == LogDirectories::default() {
            return true;
        }

        let snapshot = ctx.with_entry(|e| e.clone());
        save_log(&snapshot, &dirs).await;
        true
    }
}

pub struct Trigger;

#[async_trait]
impl ExecutionStep for Trigger {
    fn name(&self) -> &'static str {
        "trigger"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(action) = ctx.action() else {
            return false;
        };

        if action.trigger.is_empty() {
            return true;
        }

        let request = ExecutionRequest::for_title(action.trigger.clone())
            .with_tracking_id(Uuid::new_v4().to_string())
            .with_tag("trigger")
            .with_user(ctx.request.authenticated_user.clone());

        let (_handle, tracking_id) = ctx.executor.submit(request);

        info!(
            action_title = %ctx.action_title(),
            trigger = %action.trigger,
            tracking_id = %tracking_id,
            "Action triggered"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order() {
        let names: Vec<&str> = default_chain().iter().map(|s| s.name()).collect();

        assert_eq!(
            names,
            vec![
                "resolve_action",
                "concurrency_check",
                "rate_check",
                "acl_check",
                "parse_args",
                "log_start",
                "exec",
                "exec_after",
                "log_finish",
                "save_log",
                "trigger",
            ]
        );
    }

    #[test]
    fn test_hook_action_declares_builtins() {
        let action = Action::new("Backup", "tar czf backup.tgz /srv");
        let hook = hook_action(&action);

        assert_eq!(hook.arguments.len(), 2);
        assert_eq!(hook.find_arg("output").unwrap().arg_type, RAW_STRING_TYPE);
        assert_eq!(hook.find_arg("exitCode").unwrap().arg_type, RAW_STRING_TYPE);
    }

    #[test]
    fn test_hook_action_keeps_declared_type() {
        let mut action = Action::new("Backup", "tar czf backup.tgz /srv");
        action.arguments.push(ActionArgument::typed("exitCode", "int"));
        action.arguments.push(ActionArgument::typed("path", "ascii"));

        let hook = hook_action(&action);

        assert_eq!(hook.find_arg("exitCode").unwrap().arg_type, "int");
        assert!(hook.find_arg("path").is_none());
    }
}
