//! Executor Integration Tests
//!
//! End-to-end runs through the full chain with real shell processes.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use shelldeck::core::ExecutionListener;
use shelldeck::domain::{AuthenticatedUser, EXIT_CODE_NOT_EXECUTED};
use shelldeck::{Config, ExecutionRequest, Executor, InternalLogEntry};

fn executor_from(yaml: &str) -> Arc<Executor> {
    Executor::new(Config::from_yaml(yaml).unwrap())
}

/// Poll until `count` entries exist and all of them are finished
async fn wait_for_finished(executor: &Executor, count: usize) -> Vec<InternalLogEntry> {
    for _ in 0..100 {
        let logs = executor.logs();
        if logs.len() >= count && logs.iter().all(|e| e.execution_finished) {
            return logs;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Executions did not finish in time");
}

#[tokio::test]
async fn test_echo_with_argument() {
    let executor = executor_from(
        r#"
actions:
  - title: Greet
    shell: echo {{ name }}
    arguments:
      - name: name
        type: ascii
"#,
    );

    let (handle, _) = executor.submit(ExecutionRequest::for_title("Greet").with_argument("name", "world"));
    let entry = handle.wait().await.unwrap();

    assert_eq!(entry.output, "world\n");
    assert_eq!(entry.exit_code, 0);
    assert!(!entry.blocked);
    assert!(!entry.timed_out);
    assert!(entry.execution_started);
    assert!(entry.execution_finished);
    assert!(entry.datetime_finished.is_some());
}

#[tokio::test]
async fn test_injection_is_blocked_before_spawn() {
    let executor = executor_from(
        r#"
actions:
  - title: Greet
    shell: echo {{ name }}
    arguments:
      - name: name
        type: ascii
"#,
    );

    let (handle, _) =
        executor.submit(ExecutionRequest::for_title("Greet").with_argument("name", "; rm -rf /"));
    let entry = handle.wait().await.unwrap();

    assert!(entry.blocked);
    assert!(!entry.execution_started);
    assert_eq!(entry.exit_code, EXIT_CODE_NOT_EXECUTED);
    assert_eq!(entry.output, "invalid argument name, doesn't match ascii");
}

#[tokio::test]
async fn test_url_with_newline_is_blocked_before_spawn() {
    let executor = executor_from(
        r#"
actions:
  - title: Fetch
    shell: echo fetching {{ u }}
    arguments:
      - name: u
        type: url
"#,
    );

    let (handle, _) = executor.submit(
        ExecutionRequest::for_title("Fetch").with_argument("u", "https://example.com/\necho INJECTED"),
    );
    let entry = handle.wait().await.unwrap();

    assert!(entry.blocked);
    assert!(!entry.execution_started);
    assert_eq!(entry.exit_code, EXIT_CODE_NOT_EXECUTED);
    assert!(!entry.output.contains("fetching"));
}

#[tokio::test]
async fn test_arguments_are_exported_as_env() {
    let executor = executor_from(
        r#"
actions:
  - title: Env
    shell: echo "$NAME $SHELLDECK"
    arguments:
      - name: name
        type: ascii
"#,
    );

    let (handle, _) = executor.submit(ExecutionRequest::for_title("Env").with_argument("name", "world"));
    let entry = handle.wait().await.unwrap();

    assert_eq!(entry.output, "world 1\n");
}

#[tokio::test]
async fn test_timeout_kills_process() {
    let executor = executor_from(
        r#"
actions:
  - title: Slow
    shell: sleep 5
    timeout: 1
"#,
    );

    let (handle, _) = executor.submit(ExecutionRequest::for_title("Slow"));
    let entry = handle.wait().await.unwrap();

    assert!(entry.timed_out);
    assert!(entry.execution_started);
    assert_ne!(entry.exit_code, EXIT_CODE_NOT_EXECUTED);
    assert!(entry.process_id.is_none());
}

#[tokio::test]
async fn test_nonzero_exit_code_is_recorded() {
    let executor = executor_from(
        r#"
actions:
  - title: Fail
    shell: echo oops 1>&2; exit 7
"#,
    );

    let (handle, _) = executor.submit(ExecutionRequest::for_title("Fail"));
    let entry = handle.wait().await.unwrap();

    assert_eq!(entry.exit_code, 7);
    assert_eq!(entry.output, "oops\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit() {
    let executor = executor_from(
        r#"
actions:
  - title: Busy
    shell: sleep 1
    max_concurrent: 2
"#,
    );

    let handles: Vec<_> = (0..3)
        .map(|_| executor.submit(ExecutionRequest::for_title("Busy")).0)
        .collect();

    let mut entries = Vec::new();
    for handle in handles {
        entries.push(handle.wait().await.unwrap());
    }

    let executed = entries.iter().filter(|e| e.execution_started).count();
    let blocked: Vec<_> = entries.iter().filter(|e| e.blocked).collect();

    assert!(executed <= 2);
    assert!(!blocked.is_empty());
    assert!(blocked[0].output.contains("maxConcurrent set to 2"));
}

#[tokio::test]
async fn test_finished_run_frees_concurrency_slot() {
    let executor = executor_from(
        r#"
actions:
  - title: Quick
    shell: "true"
"#,
    );

    for _ in 0..3 {
        let (handle, _) = executor.submit(ExecutionRequest::for_title("Quick"));
        let entry = handle.wait().await.unwrap();
        assert!(!entry.blocked);
        assert_eq!(entry.exit_code, 0);
    }
}

#[tokio::test]
async fn test_rate_limit_blocks_over_limit() {
    let executor = executor_from(
        r#"
actions:
  - title: Limited
    shell: "true"
    max_concurrent: 10
    max_rate:
      - limit: 2
        duration: 1m
"#,
    );

    let mut entries = Vec::new();
    for _ in 0..3 {
        let (handle, _) = executor.submit(ExecutionRequest::for_title("Limited"));
        entries.push(handle.wait().await.unwrap());
    }

    assert!(!entries[0].blocked);
    assert!(!entries[1].blocked);
    assert!(entries[2].blocked);
    assert_eq!(
        entries[2].output,
        "Blocked from executing. This action has run 2 out of 2 allowed times in the last 1m."
    );

    // Blocked attempts don't use up the allowance
    let (handle, _) = executor.submit(ExecutionRequest::for_title("Limited"));
    assert!(handle.wait().await.unwrap().blocked);
}

#[tokio::test]
async fn test_rate_window_slides() {
    let executor = executor_from(
        r#"
actions:
  - title: Spaced
    shell: "true"
    max_rate:
      - limit: 1
        duration: 300ms
"#,
    );

    for _ in 0..2 {
        let (handle, _) = executor.submit(ExecutionRequest::for_title("Spaced"));
        assert!(!handle.wait().await.unwrap().blocked);
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
}

#[tokio::test]
async fn test_trigger_fires_once() {
    let executor = executor_from(
        r#"
actions:
  - title: Parent
    shell: echo parent
    trigger: Child
  - title: Child
    shell: echo child
"#,
    );

    let user = AuthenticatedUser::new("alice");
    let (handle, parent_id) =
        executor.submit(ExecutionRequest::for_title("Parent").with_user(user));
    handle.wait().await.unwrap();

    let logs = wait_for_finished(&executor, 2).await;
    assert_eq!(logs.len(), 2);

    let child = logs
        .iter()
        .find(|e| e.execution_tracking_id != parent_id)
        .unwrap();
    assert_eq!(child.action_title, "Child");
    assert_eq!(child.tags, vec!["trigger"]);
    assert_eq!(child.username, "alice");
    assert_eq!(child.output, "child\n");
}

#[tokio::test]
async fn test_no_trigger_no_extra_execution() {
    let executor = executor_from(
        r#"
actions:
  - title: Alone
    shell: echo alone
"#,
    );

    let (handle, _) = executor.submit(ExecutionRequest::for_title("Alone"));
    handle.wait().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(executor.logs().len(), 1);
}

#[tokio::test]
async fn test_blocked_parent_does_not_trigger() {
    let executor = executor_from(
        r#"
actions:
  - title: Parent
    shell: echo {{ n }}
    trigger: Child
    arguments:
      - name: n
        type: int
  - title: Child
    shell: echo child
"#,
    );

    let (handle, _) = executor.submit(ExecutionRequest::for_title("Parent").with_argument("n", "x"));
    assert!(handle.wait().await.unwrap().blocked);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(executor.logs().len(), 1);
}

#[tokio::test]
async fn test_after_completed_hook() {
    let executor = executor_from(
        r#"
actions:
  - title: Hooked
    shell: echo main; exit 3
    shell_after_completed: echo "code {{ exitCode }}"; echo "$EXITCODE" 1>&2
"#,
    );

    let (handle, _) = executor.submit(ExecutionRequest::for_title("Hooked"));
    let entry = handle.wait().await.unwrap();

    assert_eq!(entry.exit_code, 3);
    assert_eq!(
        entry.output,
        "main\n---\ncode 3\n---\n3\nYour shellAfterCompleted command exited with code 0"
    );
}

#[tokio::test]
async fn test_kill_running_execution() {
    let executor = executor_from(
        r#"
actions:
  - title: Long
    shell: sleep 5
    timeout: 30
"#,
    );

    let (handle, tracking_id) = executor.submit(ExecutionRequest::for_title("Long"));

    for _ in 0..100 {
        if executor.log(&tracking_id).and_then(|e| e.process_id).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(executor.kill(&tracking_id));
    let entry = handle.wait().await.unwrap();

    assert!(!entry.timed_out);
    assert_eq!(entry.exit_code, -1);
    assert!(!executor.kill(&tracking_id));
}

#[tokio::test]
async fn test_unknown_action() {
    let executor = executor_from("actions: []\n");

    let (handle, tracking_id) = executor.submit(ExecutionRequest::for_title("Missing"));
    let entry = handle.wait().await.unwrap();

    assert_eq!(entry.output, "Action not found: Missing");
    assert_eq!(entry.action_title, "notfound");
    assert!(entry.execution_finished);
    assert!(executor.log(&tracking_id).unwrap().execution_finished);
}

#[tokio::test]
async fn test_permission_denied() {
    let executor = executor_from(
        r#"
default_permissions:
  exec: false
access_control_lists:
  - name: admins
    match_usernames: [alice]
    permissions:
      exec: true
actions:
  - title: Reboot
    shell: echo rebooting
    acls: [admins]
"#,
    );

    let (handle, _) = executor.submit(ExecutionRequest::for_title("Reboot"));
    let entry = handle.wait().await.unwrap();
    assert!(entry.blocked);
    assert!(entry.output.starts_with("Permission denied"));

    let (handle, _) = executor.submit(
        ExecutionRequest::for_title("Reboot").with_user(AuthenticatedUser::new("alice")),
    );
    assert_eq!(handle.wait().await.unwrap().output, "rebooting\n");
}

#[tokio::test]
async fn test_tracking_id_collision_is_regenerated() {
    let executor = executor_from(
        r#"
actions:
  - title: Quick
    shell: "true"
    max_concurrent: 5
"#,
    );

    let (first, first_id) =
        executor.submit(ExecutionRequest::for_title("Quick").with_tracking_id("dup"));
    let (second, second_id) =
        executor.submit(ExecutionRequest::for_title("Quick").with_tracking_id("dup"));

    assert_eq!(first_id, "dup");
    assert_ne!(second_id, "dup");
    assert_eq!(second.tracking_id(), second_id);

    first.wait().await.unwrap();
    second.wait().await.unwrap();
    assert_eq!(executor.logs().len(), 2);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl ExecutionListener for Recorder {
    fn on_execution_started(&self, action_title: &str) {
        self.events.lock().unwrap().push(format!("started {}", action_title));
    }

    fn on_execution_finished(&self, entry: &InternalLogEntry) {
        self.events
            .lock()
            .unwrap()
            .push(format!("finished {} {}", entry.action_title, entry.exit_code));
    }

    fn on_output_chunk(&self, chunk: &[u8], _tracking_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("output {}", String::from_utf8_lossy(chunk).trim()));
    }
}

#[tokio::test]
async fn test_listeners_see_execution() {
    let executor = executor_from(
        r#"
actions:
  - title: Hello
    shell: echo hi
"#,
    );
    let recorder = Arc::new(Recorder::default());
    executor.add_listener(recorder.clone());

    let (handle, _) = executor.submit(ExecutionRequest::for_title("Hello"));
    handle.wait().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(events, vec!["started Hello", "output hi", "finished Hello 0"]);
}

#[tokio::test]
async fn test_listeners_hear_about_blocked_requests() {
    let executor = executor_from("actions: []\n");
    let recorder = Arc::new(Recorder::default());
    executor.add_listener(recorder.clone());

    let (handle, _) = executor.submit(ExecutionRequest::for_title("Missing"));
    handle.wait().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(events, vec![format!("finished notfound {}", EXIT_CODE_NOT_EXECUTED)]);
}
