//! Spawns the provisioning binary and classifies how it exited.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::downgrade::{self, ShellContext};
use crate::error::{BackendError, ExitStatus, ProcessFailure, Result};
use crate::paths::{prepend_search_path, Paths};

/// Name of the bundled provisioning binary.
pub const BINARY: &str = "minikube";
/// Variable pinning the binary's profile-data home.
pub const HOME_VAR: &str = "MINIKUBE_HOME";
/// Exit code the binary uses when its driver lacks privileges.
pub const ESCALATION_EXIT_CODE: i32 = 80;
/// Stdout marker accompanying [`ESCALATION_EXIT_CODE`] for the hyperkit driver.
pub const HYPERKIT_MARKER: &str = "The \"hyperkit\" driver should run with elevated permissions";
/// Driver binary that must be setuid root on macOS.
pub const HYPERKIT_DRIVER: &str = "docker-machine-driver-hyperkit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Delete,
    /// Remote command over the cluster's management channel
    Ssh,
}

impl Operation {
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
            Self::Ssh => "ssh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Other
        }
    }

    /// VM driver handed to the provisioning binary.
    pub fn driver(self) -> &'static str {
        match self {
            Self::MacOs => "hyperkit",
            Self::Linux => "kvm2",
            Self::Windows => "hyperv",
            Self::Other => "none",
        }
    }

    /// Stdout marker that, with [`ESCALATION_EXIT_CODE`], asks for privilege escalation.
    pub fn escalation_marker(self, op: Operation) -> Option<&'static str> {
        match (self, op) {
            (Self::MacOs, Operation::Start) => Some(HYPERKIT_MARKER),
            _ => None,
        }
    }
}

/// Classified result of one subprocess run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { stdout: String, stderr: String },
    /// Driver needs elevated permissions; carries the run's diagnostic
    EscalationRequired(ProcessFailure),
    /// Ended by `SIGINT`, or exited after an interrupt was requested
    Interrupted,
    Failed(ProcessFailure),
}

/// Maps an exit status and captured output to an [`Outcome`].
pub fn classify(
    op: Operation,
    platform: Platform,
    status: ExitStatus,
    interrupted: bool,
    stdout: String,
    stderr: String,
) -> Outcome {
    match status {
        ExitStatus::Code(0) => return Outcome::Success { stdout, stderr },
        ExitStatus::Signal(libc::SIGINT) => return Outcome::Interrupted,
        _ => {}
    }
    if interrupted {
        return Outcome::Interrupted;
    }
    let failure = ProcessFailure {
        context: format!("{BINARY} {}", op.subcommand()),
        status,
        message: stderr,
    };
    let escalate = status == ExitStatus::Code(ESCALATION_EXIT_CODE)
        && platform
            .escalation_marker(op)
            .is_some_and(|marker| stdout.contains(marker));
    if escalate {
        Outcome::EscalationRequired(failure)
    } else {
        Outcome::Failed(failure)
    }
}

/// Runs the provisioning binary on behalf of the lifecycle controller.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Runs `<binary> <args>`; cancelling `interrupt` delivers `SIGINT` to the child.
    async fn run(&self, op: Operation, args: Vec<String>, interrupt: Option<CancellationToken>) -> Result<Outcome>;

    /// One-time privilege escalation requested by [`Outcome::EscalationRequired`].
    async fn escalate(&self) -> Result<()>;
}

/// [`Provisioner`] spawning the bundled binary with an isolated profile home.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    paths: Paths,
    platform: Platform,
}

impl Orchestrator {
    pub fn new(paths: Paths) -> Self {
        Self::with_platform(paths, Platform::current())
    }

    pub fn with_platform(paths: Paths, platform: Platform) -> Self {
        Self { paths, platform }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Locates the binary on the resource-prepended search path.
    pub fn binary(&self) -> PathBuf {
        let search = prepend_search_path(&self.paths.resources);
        let cwd = std::env::current_dir().unwrap_or_else(|_| self.paths.resources.clone());
        which::which_in(BINARY, search, cwd).unwrap_or_else(|_| self.paths.resources.join(BINARY))
    }

    fn command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.env(HOME_VAR, &self.paths.home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = prepend_search_path(&self.paths.resources) {
            cmd.env("PATH", path);
        }
        cmd
    }
}

#[async_trait]
impl Provisioner for Orchestrator {
    async fn run(&self, op: Operation, args: Vec<String>, interrupt: Option<CancellationToken>) -> Result<Outcome> {
        let program = self.binary();
        log::info!(
            "{HOME_VAR}={} {} {}",
            self.paths.home.display(),
            program.display(),
            shell_words::join(&args)
        );

        let mut child = self
            .command(&program)
            .args(&args)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: program.display().to_string(),
                source,
            })?;

        let stdout = tokio::spawn(collect(child.stdout.take(), op, "stdout"));
        let stderr = tokio::spawn(collect(child.stderr.take(), op, "stderr"));

        let (status, interrupted) = wait(&mut child, interrupt).await?;
        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();
        log::info!("{BINARY} {} exited with {status}", op.subcommand());

        let mut outcome = classify(op, self.platform, status, interrupted, stdout, stderr);
        if op == Operation::Start {
            if let Outcome::Failed(failure) = &mut outcome {
                let shell = ShellContext {
                    home_var: HOME_VAR,
                    home: &self.paths.home,
                    binary: &program,
                };
                failure.message = downgrade::rewrite(&failure.message, shell);
            }
        }
        Ok(outcome)
    }

    async fn escalate(&self) -> Result<()> {
        if self.platform != Platform::MacOs {
            return Err(BackendError::NotImplemented("privilege escalation"));
        }
        let driver = self.paths.resources.join(HYPERKIT_DRIVER);
        let driver = shell_words::quote(&driver.to_string_lossy()).into_owned();
        let script = format!(
            "do shell script \"chown root:wheel {driver} && chmod u+s {driver}\" with administrator privileges"
        );
        log::info!("requesting administrator privileges for {HYPERKIT_DRIVER}");

        let output = Command::new("osascript")
            .args(["-e", &script])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BackendError::Spawn {
                program: "osascript".to_string(),
                source,
            })?;
        if output.status.success() {
            return Ok(());
        }
        Err(BackendError::Start(ProcessFailure {
            context: "privilege escalation".to_string(),
            status: exit_status(output.status),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        }))
    }
}

/// Accumulates a pipe's raw output while logging it line by line.
async fn collect<R>(pipe: Option<R>, op: Operation, stream: &'static str) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return String::new();
    };
    let mut reader = BufReader::new(pipe);
    let mut raw = Vec::new();
    loop {
        let start = raw.len();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw[start..]);
                log::debug!("[{BINARY} {} {stream}] {}", op.subcommand(), line.trim_end());
            }
            Err(e) => {
                log::warn!("[{BINARY} {} {stream}] read error: {e}", op.subcommand());
                break;
            }
        }
    }
    String::from_utf8_lossy(&raw).into_owned()
}

/// Waits for exit, forwarding an interrupt request to the child as `SIGINT`.
async fn wait(child: &mut Child, interrupt: Option<CancellationToken>) -> Result<(ExitStatus, bool)> {
    let mut interrupted = false;
    if let Some(token) = interrupt {
        tokio::select! {
            status = child.wait() => return Ok((exit_status(status?), false)),
            _ = token.cancelled() => {
                interrupted = true;
                send_interrupt(child);
            }
        }
    }
    let status = child.wait().await?;
    Ok((exit_status(status), interrupted))
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    log::info!("interrupting {BINARY} (pid {pid})");
    // SAFETY: kill(2) has no memory-safety preconditions; pid is our own child.
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if result != 0 {
        log::warn!("failed to interrupt pid {pid}: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        log::warn!("failed to interrupt {BINARY}: {e}");
    }
}

fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        return ExitStatus::Code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::Signal(signal);
        }
    }
    ExitStatus::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_sigint() {
        let ok = classify(Operation::Stop, Platform::Linux, ExitStatus::Code(0), false, "out".into(), String::new());
        assert!(matches!(ok, Outcome::Success { .. }));

        let sigint = classify(
            Operation::Start,
            Platform::Linux,
            ExitStatus::Signal(libc::SIGINT),
            false,
            String::new(),
            String::new(),
        );
        assert_eq!(sigint, Outcome::Interrupted);
    }

    #[test]
    fn escalation_needs_platform_operation_code_and_marker() {
        let stdout = format!("! {HYPERKIT_MARKER}.\n");
        let run = |platform, op, code, stdout: &str| {
            classify(op, platform, ExitStatus::Code(code), false, stdout.to_string(), "vmnet: denied\n".to_string())
        };

        let escalation = run(Platform::MacOs, Operation::Start, ESCALATION_EXIT_CODE, &stdout);
        let Outcome::EscalationRequired(failure) = escalation else {
            panic!("expected escalation, got {escalation:?}");
        };
        assert_eq!(failure.status, ExitStatus::Code(ESCALATION_EXIT_CODE));
        assert_eq!(failure.message, "vmnet: denied\n");
        assert!(matches!(run(Platform::Linux, Operation::Start, ESCALATION_EXIT_CODE, &stdout), Outcome::Failed(_)));
        assert!(matches!(run(Platform::MacOs, Operation::Stop, ESCALATION_EXIT_CODE, &stdout), Outcome::Failed(_)));
        assert!(matches!(run(Platform::MacOs, Operation::Start, 1, &stdout), Outcome::Failed(_)));
        assert!(matches!(run(Platform::MacOs, Operation::Start, ESCALATION_EXIT_CODE, "nope"), Outcome::Failed(_)));
    }

    #[test]
    fn failure_carries_raw_stderr() {
        let failed = classify(
            Operation::Delete,
            Platform::Linux,
            ExitStatus::Signal(libc::SIGKILL),
            false,
            String::new(),
            "killed\n".into(),
        );
        let Outcome::Failed(failure) = failed else {
            panic!("expected failure");
        };
        assert_eq!(failure.context, "minikube delete");
        assert_eq!(failure.status, ExitStatus::Signal(libc::SIGKILL));
        assert_eq!(failure.message, "killed\n");
    }

    #[test]
    fn exit_after_interrupt_counts_as_interrupted() {
        let outcome = classify(Operation::Start, Platform::Linux, ExitStatus::Code(130), true, String::new(), String::new());
        assert_eq!(outcome, Outcome::Interrupted);
    }

    #[cfg(unix)]
    mod spawn {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        // Serializes script writes and spawns so no forked child inherits an open script fd.
        static SPAWN: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

        fn orchestrator(dir: &Path, script: &str, platform: Platform) -> Orchestrator {
            let resources = dir.join("resources");
            std::fs::create_dir_all(&resources).unwrap();
            let binary = resources.join(BINARY);
            std::fs::write(&binary, format!("#!/bin/sh\n{script}\n")).unwrap();
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
            let paths = Paths {
                home: dir.join("home"),
                resources,
                kubeconfig: vec![],
            };
            Orchestrator::with_platform(paths, platform)
        }

        #[tokio::test]
        async fn passes_home_and_arguments() {
            let _guard = SPAWN.lock().await;
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(dir.path(), "echo \"$MINIKUBE_HOME $*\"", Platform::Linux);

            let outcome = orch
                .run(Operation::Stop, vec!["stop".into(), "-p".into(), "cluster-backend".into()], None)
                .await
                .unwrap();
            let Outcome::Success { stdout, .. } = outcome else {
                panic!("expected success, got {outcome:?}");
            };
            let home = dir.path().join("home");
            assert_eq!(stdout, format!("{} stop -p cluster-backend\n", home.display()));
        }

        #[tokio::test]
        async fn failure_keeps_stderr() {
            let _guard = SPAWN.lock().await;
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(dir.path(), "echo progress\necho 'disk full' >&2\nexit 3", Platform::Linux);

            let outcome = orch.run(Operation::Start, vec!["start".into()], None).await.unwrap();
            let Outcome::Failed(failure) = outcome else {
                panic!("expected failure, got {outcome:?}");
            };
            assert_eq!(failure.status, ExitStatus::Code(3));
            assert_eq!(failure.message, "disk full\n");
        }

        #[tokio::test]
        async fn escalation_marker_on_stdout() {
            let _guard = SPAWN.lock().await;
            let dir = tempfile::tempdir().unwrap();
            let script = format!(
                "printf '%s\\n' '! {HYPERKIT_MARKER}.'\necho 'hyperkit: permission denied' >&2\nexit {ESCALATION_EXIT_CODE}"
            );
            let orch = orchestrator(dir.path(), &script, Platform::MacOs);

            let outcome = orch.run(Operation::Start, vec!["start".into()], None).await.unwrap();
            let Outcome::EscalationRequired(failure) = outcome else {
                panic!("expected escalation, got {outcome:?}");
            };
            assert_eq!(failure.message, "hyperkit: permission denied\n");
        }

        #[tokio::test]
        async fn interrupt_sends_sigint() {
            let _guard = SPAWN.lock().await;
            let dir = tempfile::tempdir().unwrap();
            let orch = orchestrator(dir.path(), "exec sleep 30", Platform::Linux);

            let token = CancellationToken::new();
            let trigger = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });
            let outcome = orch.run(Operation::Start, vec!["start".into()], Some(token)).await.unwrap();
            assert_eq!(outcome, Outcome::Interrupted);
        }

        #[tokio::test]
        async fn missing_binary_is_a_spawn_error() {
            let _guard = SPAWN.lock().await;
            let dir = tempfile::tempdir().unwrap();
            let paths = Paths {
                home: dir.path().join("home"),
                resources: dir.path().join("empty"),
                kubeconfig: vec![],
            };
            let orch = Orchestrator::with_platform(paths, Platform::Linux);
            if which::which(BINARY).is_ok() {
                return;
            }
            let err = orch.run(Operation::Stop, vec![], None).await.unwrap_err();
            assert!(matches!(err, BackendError::Spawn { .. }));
        }
    }
}
