//! Command-line interface for shelldeck.
//!
//! Provides commands for running a single action, listing the action map,
//! checking configuration, and serving requests read from stdin.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{load_config, Config};
use crate::core::{ExecutionHandle, ExecutionListener, Executor};
use crate::domain::{AuthenticatedUser, ExecutionRequest, InternalLogEntry};
use crate::watch::watch_file_write;

/// shelldeck - Run configured shell actions safely
#[derive(Parser, Debug)]
#[command(name = "shelldeck")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./config.yaml, then the user config dir)
    #[arg(short, long, global = true, env = "SHELLDECK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one action and wait for it (and anything it triggers)
    Exec {
        /// Action title
        title: String,

        /// Argument as name=value (repeatable)
        #[arg(short, long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,

        /// Tag to attach to the execution (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Username to execute as
        #[arg(short, long, default_value = "guest")]
        user: String,

        /// Usergroup to execute as
        #[arg(short, long)]
        group: Option<String>,

        /// Tracking ID to request
        #[arg(long)]
        tracking_id: Option<String>,
    },

    /// List the action map
    Actions,

    /// Validate the configuration
    Check,

    /// Read JSON requests from stdin, one per line, and write JSON events
    /// to stdout. The config file is reloaded when it changes.
    Serve {
        /// Debounce window for config reloads, in milliseconds
        #[arg(long, default_value = "500")]
        reload_delay_ms: u64,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid argument '{}', expected name=value", s))?;
    Ok((key.to_string(), value.to_string()))
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let explicit = self.config.as_deref();

        match self.command {
            Commands::Exec {
                title,
                args,
                tags,
                user,
                group,
                tracking_id,
            } => {
                let mut request = ExecutionRequest::for_title(title).with_user(AuthenticatedUser {
                    username: user,
                    usergroup: group.unwrap_or_default(),
                });
                for (name, value) in args {
                    request = request.with_argument(name, value);
                }
                for tag in tags {
                    request = request.with_tag(tag);
                }
                if let Some(tracking_id) = tracking_id {
                    request = request.with_tracking_id(tracking_id);
                }

                run_exec(explicit, request).await
            }
            Commands::Actions => list_actions(explicit),
            Commands::Check => check_config(explicit),
            Commands::Serve { reload_delay_ms } => {
                serve(explicit, Duration::from_millis(reload_delay_ms)).await
            }
        }
    }
}

fn load_and_report(explicit: Option<&Path>) -> Result<(Config, PathBuf)> {
    let (config, path) = load_config(explicit)?;

    for problem in config.validate() {
        warn!(config = %path.display(), "{}", problem);
    }

    Ok((config, path))
}

/// Prints output chunks as they arrive and forwards finished entries
struct ConsoleListener {
    finished_tx: mpsc::UnboundedSender<InternalLogEntry>,
}

impl ExecutionListener for ConsoleListener {
    fn on_output_chunk(&self, chunk: &[u8], _tracking_id: &str) {
        print!("{}", String::from_utf8_lossy(chunk));
    }

    fn on_execution_finished(&self, entry: &InternalLogEntry) {
        let _ = self.finished_tx.send(entry.clone());
    }
}

/// Run one action, stream its output, and exit with its exit code
async fn run_exec(explicit: Option<&Path>, request: ExecutionRequest) -> Result<()> {
    let (config, _) = load_and_report(explicit)?;
    let executor = Executor::new(config);

    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
    executor.add_listener(Arc::new(ConsoleListener { finished_tx }));

    let (_handle, tracking_id) = executor.submit(request);

    // Wait for this execution and anything it triggered
    let mut result = None;
    while let Some(entry) = finished_rx.recv().await {
        if entry.execution_tracking_id == tracking_id {
            result = Some(entry);
        }

        if result.is_some() && executor.logs().iter().all(|e| e.execution_finished) {
            break;
        }
    }

    let entry = result.context("Execution ended without a result")?;

    if entry.blocked || !entry.was_executed() {
        eprintln!("\n[{} not executed: {}]", entry.action_title, entry.output.trim());
        std::process::exit(1);
    }

    if entry.timed_out {
        eprintln!("\n[{} timed out, exit code {}]", entry.action_title, entry.exit_code);
    } else {
        eprintln!("\n[{} exited with code {}]", entry.action_title, entry.exit_code);
    }

    if entry.exit_code != 0 {
        std::process::exit(entry.exit_code);
    }

    Ok(())
}

/// List every binding in configuration order
fn list_actions(explicit: Option<&Path>) -> Result<()> {
    let (config, path) = load_and_report(explicit)?;
    let executor = Executor::new(config);
    let bindings = executor.bindings();

    if bindings.is_empty() {
        println!("No actions in {}", path.display());
        return Ok(());
    }

    println!("{:<36} {:<30} {:<12} {:<8}", "BINDING ID", "TITLE", "ENTITY", "TIMEOUT");
    println!("{}", "-".repeat(90));

    for binding in bindings {
        println!(
            "{:<36} {:<30} {:<12} {:<8}",
            binding.id,
            binding.action.title,
            binding.entity_prefix,
            format!("{}s", binding.action.timeout)
        );
    }

    Ok(())
}

/// Report configuration problems; fails if there are any
fn check_config(explicit: Option<&Path>) -> Result<()> {
    let (config, path) = load_config(explicit)?;
    let problems = config.validate();

    if problems.is_empty() {
        println!("{}: {} actions, no problems found", path.display(), config.actions.len());
        return Ok(());
    }

    for problem in &problems {
        println!("  {}", problem);
    }
    anyhow::bail!("{} problem(s) found in {}", problems.len(), path.display())
}

/// One line of serve input
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServeRequest {
    Exec {
        #[serde(default)]
        action: String,
        #[serde(default)]
        binding_id: Option<String>,
        #[serde(default)]
        arguments: std::collections::HashMap<String, String>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        tracking_id: String,
        #[serde(default)]
        user: Option<AuthenticatedUser>,
    },
    Kill {
        tracking_id: String,
    },
    Logs {
        #[serde(default)]
        action_id: Option<String>,
    },
}

/// One line of serve output
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ServeEvent<'a> {
    Submitted { tracking_id: &'a str },
    Started { action_title: &'a str },
    Output { tracking_id: &'a str, chunk: String },
    Finished { entry: &'a InternalLogEntry },
    ActionMapRebuilt,
    Killed { tracking_id: &'a str, killed: bool },
    Logs { entries: &'a [InternalLogEntry] },
    Error { message: String },
}

fn emit(event: &ServeEvent<'_>) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to serialize event"),
    }
}

/// Writes every listener notification as a JSON line
struct JsonListener;

impl ExecutionListener for JsonListener {
    fn on_execution_started(&self, action_title: &str) {
        emit(&ServeEvent::Started { action_title });
    }

    fn on_execution_finished(&self, entry: &InternalLogEntry) {
        emit(&ServeEvent::Finished { entry });
    }

    fn on_output_chunk(&self, chunk: &[u8], tracking_id: &str) {
        emit(&ServeEvent::Output {
            tracking_id,
            chunk: String::from_utf8_lossy(chunk).into_owned(),
        });
    }

    fn on_action_map_rebuilt(&self) {
        emit(&ServeEvent::ActionMapRebuilt);
    }
}

fn handle_serve_line(executor: &Arc<Executor>, line: &str, running: &mut Vec<ExecutionHandle>) {
    let request: ServeRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            emit(&ServeEvent::Error {
                message: format!("Invalid request: {}", e),
            });
            return;
        }
    };

    match request {
        ServeRequest::Exec {
            action,
            binding_id,
            arguments,
            tags,
            tracking_id,
            user,
        } => {
            let request = ExecutionRequest {
                action_title: action,
                binding_id,
                arguments,
                tracking_id,
                tags,
                authenticated_user: user.unwrap_or_else(AuthenticatedUser::guest),
            };

            let (handle, tracking_id) = executor.submit(request);
            emit(&ServeEvent::Submitted {
                tracking_id: &tracking_id,
            });
            running.push(handle);
        }
        ServeRequest::Kill { tracking_id } => {
            let killed = executor.kill(&tracking_id);
            emit(&ServeEvent::Killed {
                tracking_id: &tracking_id,
                killed,
            });
        }
        ServeRequest::Logs { action_id } => {
            let entries = match action_id {
                Some(action_id) => executor.logs_for_action(&action_id),
                None => executor.logs(),
            };
            emit(&ServeEvent::Logs { entries: &entries });
        }
    }

    running.retain(|handle| !handle.is_finished());
}

/// Serve requests from stdin until EOF
async fn serve(explicit: Option<&Path>, reload_delay: Duration) -> Result<()> {
    let (config, path) = load_and_report(explicit)?;
    let executor = Executor::new(config);
    executor.add_listener(Arc::new(JsonListener));

    let reload_executor = Arc::clone(&executor);
    let reload_path = path.clone();
    let watcher = watch_file_write(&path, reload_delay, move || {
        match Config::from_file(&reload_path) {
            Ok(config) => {
                for problem in config.validate() {
                    warn!(config = %reload_path.display(), "{}", problem);
                }
                info!(config = %reload_path.display(), "Reloading configuration");
                reload_executor.reload(config);
            }
            Err(e) => warn!(error = %e, "Config reload failed, keeping current configuration"),
        }
    })
    .context("Failed to watch config file")?;

    info!(config = %path.display(), "Serving requests from stdin");

    let mut running = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        handle_serve_line(&executor, line, &mut running);
    }

    info!(in_flight = running.len(), "Input closed, waiting for running executions");
    for handle in running {
        handle.wait().await;
    }

    watcher.stop().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("host=web1"),
            Ok(("host".to_string(), "web1".to_string()))
        );
        assert_eq!(
            parse_key_val("query=a=b"),
            Ok(("query".to_string(), "a=b".to_string()))
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn test_cli_parses_exec() {
        let cli = Cli::parse_from([
            "shelldeck", "--config", "/tmp/c.yaml", "exec", "Ping host", "-a", "host=web1", "--tag",
            "manual",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
        match cli.command {
            Commands::Exec {
                title, args, tags, user, ..
            } => {
                assert_eq!(title, "Ping host");
                assert_eq!(args, vec![("host".to_string(), "web1".to_string())]);
                assert_eq!(tags, vec!["manual"]);
                assert_eq!(user, "guest");
            }
            other => panic!("Expected exec, got {:?}", other),
        }
    }

    #[test]
    fn test_serve_request_parsing() {
        let request: ServeRequest = serde_json::from_str(
            r#"{"op":"exec","action":"Ping host","arguments":{"host":"web1"},"user":{"username":"alice"}}"#,
        )
        .unwrap();

        match request {
            ServeRequest::Exec {
                action,
                arguments,
                user,
                ..
            } => {
                assert_eq!(action, "Ping host");
                assert_eq!(arguments.get("host").map(String::as_str), Some("web1"));
                assert_eq!(user.unwrap().username, "alice");
            }
            other => panic!("Expected exec, got {:?}", other),
        }

        let request: ServeRequest =
            serde_json::from_str(r#"{"op":"kill","tracking_id":"t1"}"#).unwrap();
        assert!(matches!(request, ServeRequest::Kill { tracking_id } if tracking_id == "t1"));
    }
}
