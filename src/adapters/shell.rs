//! Shell process runner.
//!
//! Commands run through `sh -c` (`cmd /C` on Windows) with stdin closed.
//! Every run carries `SHELLDECK=1` in its environment, and callers usually
//! add their arguments as upper-cased variables (see `argument_env`).

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::{
    CapturedOutput, CommandRunner, ProcessObserver, ProcessSpec, RunOutcome, RunnerError,
    SIGNALED_EXIT_CODE,
};

/// Environment variable marking processes launched by shelldeck
pub const LAUNCHED_BY_ENV: &str = "SHELLDECK";

const READ_BUFFER_SIZE: usize = 4096;

/// How long to keep reading output after the process has exited. A killed
/// shell can leave grandchildren holding the pipes open.
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Expose caller arguments as upper-cased environment variables
pub fn argument_env(arguments: &HashMap<String, String>) -> HashMap<String, String> {
    arguments
        .iter()
        .map(|(name, value)| (name.to_uppercase(), value.clone()))
        .collect()
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", command]);
    cmd
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    cmd
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(SIGNALED_EXIT_CODE)
}

async fn forward_output<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        if tx.send(buf[..n].to_vec()).is_err() {
            return Ok(());
        }
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Output(Option<Vec<u8>>),
    Deadline,
    Kill,
}

/// Runs commands through the platform shell
#[derive(Debug, Clone)]
pub struct ShellRunner {
    drain_grace: Duration,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Override how long output is drained after exit
    pub fn with_drain_grace(mut self, drain_grace: Duration) -> Self {
        self.drain_grace = drain_grace;
        self
    }

    fn prepare(&self, spec: &ProcessSpec) -> Command {
        let mut cmd = shell_command(&spec.command);
        cmd.envs(&spec.env)
            .env(LAUNCHED_BY_ENV, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    fn name(&self) -> &str {
        "shell"
    }

    async fn run_streaming(
        &self,
        spec: &ProcessSpec,
        observer: &dyn ProcessObserver,
        mut kill_rx: mpsc::UnboundedReceiver<()>,
    ) -> RunOutcome {
        let mut child = match self.prepare(spec).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(cmd = %spec.command, error = %e, "Failed to spawn command");
                return RunOutcome {
                    errors: vec![RunnerError::Spawn(e)],
                    ..Default::default()
                };
            }
        };

        let pid = child.id();
        observer.on_spawn(pid);
        debug!(?pid, timeout = ?spec.timeout, "Command spawned");

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut readers: Vec<JoinHandle<std::io::Result<()>>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_output(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_output(stderr, tx.clone())));
        }
        drop(tx);

        let mut outcome = RunOutcome {
            pid,
            ..Default::default()
        };

        let deadline = sleep(spec.timeout);
        tokio::pin!(deadline);

        let mut output_open = true;
        let mut kill_sent = false;

        let status = loop {
            let wake = tokio::select! {
                status = child.wait() => Wake::Exited(status),
                chunk = rx.recv(), if output_open => Wake::Output(chunk),
                _ = &mut deadline, if !kill_sent => Wake::Deadline,
                Some(()) = kill_rx.recv(), if !kill_sent => Wake::Kill,
            };

            match wake {
                Wake::Exited(status) => break status,
                Wake::Output(Some(chunk)) => observer.on_output(&chunk),
                Wake::Output(None) => output_open = false,
                Wake::Deadline => {
                    warn!(?pid, timeout = ?spec.timeout, "Command timed out, killing");
                    outcome.timed_out = true;
                    kill_sent = true;
                    if let Err(e) = child.start_kill() {
                        outcome.errors.push(RunnerError::Kill(e));
                    }
                }
                Wake::Kill => {
                    warn!(?pid, "Kill requested");
                    outcome.killed = true;
                    kill_sent = true;
                    if let Err(e) = child.start_kill() {
                        outcome.errors.push(RunnerError::Kill(e));
                    }
                }
            }
        };

        match status {
            Ok(status) => outcome.exit_code = Some(exit_code_of(status)),
            Err(e) => outcome.errors.push(RunnerError::Wait(e)),
        }

        if output_open {
            let drain = async {
                while let Some(chunk) = rx.recv().await {
                    observer.on_output(&chunk);
                }
            };

            if timeout(self.drain_grace, drain).await.is_err() {
                warn!(?pid, "Output still open after exit, no longer reading");
            }
        }

        for reader in readers {
            if !reader.is_finished() {
                reader.abort();
                continue;
            }

            if let Ok(Err(e)) = reader.await {
                outcome.errors.push(RunnerError::Read(e));
            }
        }

        debug!(?pid, exit_code = ?outcome.exit_code, timed_out = outcome.timed_out, "Command finished");
        outcome
    }

    async fn run_captured(&self, spec: &ProcessSpec) -> CapturedOutput {
        let child = match self.prepare(spec).spawn() {
            Ok(child) => child,
            Err(e) => {
                return CapturedOutput {
                    error: Some(RunnerError::Spawn(e)),
                    ..Default::default()
                }
            }
        };

        // On timeout the child is dropped, which kills it
        match timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CapturedOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: Some(exit_code_of(output.status)),
                ..Default::default()
            },
            Ok(Err(e)) => CapturedOutput {
                error: Some(RunnerError::Wait(e)),
                ..Default::default()
            },
            Err(_) => CapturedOutput {
                timed_out: true,
                ..Default::default()
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect {
        output: Mutex<Vec<u8>>,
        pid: Mutex<Option<u32>>,
    }

    impl Collect {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.output.lock().unwrap()).into_owned()
        }
    }

    impl ProcessObserver for Collect {
        fn on_spawn(&self, pid: Option<u32>) {
            *self.pid.lock().unwrap() = pid;
        }

        fn on_output(&self, chunk: &[u8]) {
            self.output.lock().unwrap().extend_from_slice(chunk);
        }
    }

    fn no_kill() -> mpsc::UnboundedReceiver<()> {
        mpsc::unbounded_channel().1
    }

    #[test]
    fn test_argument_env_is_upper_cased() {
        let mut args = HashMap::new();
        args.insert("host".to_string(), "web1".to_string());

        let env = argument_env(&args);
        assert_eq!(env.get("HOST").map(String::as_str), Some("web1"));
        assert!(!env.contains_key("host"));
    }

    #[tokio::test]
    async fn test_streams_stdout_and_stderr() {
        let observer = Collect::default();
        let spec = ProcessSpec::new("echo out; echo err 1>&2; exit 3", Duration::from_secs(5));

        let outcome = ShellRunner::new()
            .run_streaming(&spec, &observer, no_kill())
            .await;

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
        assert!(outcome.errors.is_empty());
        assert!(observer.pid.lock().unwrap().is_some());

        let text = observer.text();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }

    #[tokio::test]
    async fn test_environment_is_passed() {
        let observer = Collect::default();
        let mut env = HashMap::new();
        env.insert("NAME".to_string(), "world".to_string());
        let spec = ProcessSpec::new("echo $SHELLDECK $NAME", Duration::from_secs(5)).with_env(env);

        ShellRunner::new().run_streaming(&spec, &observer, no_kill()).await;

        assert_eq!(observer.text(), "1 world\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let observer = Collect::default();
        let spec = ProcessSpec::new("sleep 5", Duration::from_millis(300));

        let started = std::time::Instant::now();
        let outcome = ShellRunner::new()
            .with_drain_grace(Duration::from_millis(200))
            .run_streaming(&spec, &observer, no_kill())
            .await;

        assert!(outcome.timed_out);
        assert!(outcome.exit_code.is_some());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_kill_channel_stops_process() {
        let observer = Collect::default();
        let spec = ProcessSpec::new("sleep 5", Duration::from_secs(30));
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let runner = ShellRunner::new().with_drain_grace(Duration::from_millis(200));
        let run = runner.run_streaming(&spec, &observer, kill_rx);
        kill_tx.send(()).unwrap();
        let outcome = run.await;

        assert!(outcome.killed);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, Some(SIGNALED_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_captured_keeps_streams_apart() {
        let spec = ProcessSpec::new("echo out; echo err 1>&2", Duration::from_secs(5));
        let captured = ShellRunner::new().run_captured(&spec).await;

        assert_eq!(captured.stdout, "out\n");
        assert_eq!(captured.stderr, "err\n");
        assert_eq!(captured.exit_code, Some(0));
        assert!(captured.error.is_none());
    }

    #[tokio::test]
    async fn test_captured_timeout() {
        let spec = ProcessSpec::new("sleep 5", Duration::from_millis(200));
        let captured = ShellRunner::new().run_captured(&spec).await;

        assert!(captured.timed_out);
        assert_eq!(captured.exit_code, None);
    }
}
