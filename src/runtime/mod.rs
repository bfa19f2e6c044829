//! Client for the Singularity OCI runtime command line interface.
//!
//! Every operation maps to one invocation of the runtime binary; instance
//! state changes are observed separately over the sync socket (see
//! [`observe`]).

pub mod buildcfg;
pub mod observe;
pub mod state;

pub use buildcfg::BuildConfig;
pub use observe::{expect_state, observe_state};
pub use state::{OciState, State};

use crate::{error::RuntimeError, sync::Cancel};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::{CopyGetters, Getters, Setters};
use log::{debug, warn};
use nix::{sys::signal::Signal, unistd::Pid};
use std::{
    fmt::{self, Debug},
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    string::ToString,
};
use strum::AsRefStr;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    process::{ChildStdin, Command},
};

/// The stderr marker by which the runtime reports a missing instance.
const NO_INSTANCE_FOUND: &str = "no instance found";

/// Environment prefix the runtime uses to inject variables into processes.
const ENV_PREFIX: &str = "SINGULARITYENV_";

#[derive(Builder, Debug, Getters, Setters)]
#[builder(pattern = "owned", setter(into))]
/// Client for one installed OCI runtime binary.
pub struct RuntimeClient {
    #[builder(private, default = "Box::new(DefaultExecCommand)")]
    exec: Box<dyn ExecCommand>,

    #[get = "pub"]
    /// Path to the runtime binary.
    binary: PathBuf,
}

impl RuntimeClient {
    /// Build a client for the first `singularity` binary found in `PATH`.
    pub fn from_path() -> Result<Self> {
        let binary = which::which("singularity").context("find singularity binary")?;
        Ok(RuntimeClientBuilder::default().binary(binary).build()?)
    }

    /// Query the runtime for the state of instance `id`.
    pub async fn state(&self, id: &str) -> Result<OciState> {
        let output = self
            .run(&["-q".into()], &Subcommand::State(id.into()))
            .await?;
        ensure_success(id, "state", &output)?;
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("decode oci state of {}", id))
    }

    /// Create an instance from `bundle` without waiting for it.
    ///
    /// Progress is reported over the sync socket passed in `args`. Returns
    /// the write end of the instance's stdin when `attach_stdin` is set.
    pub async fn create(
        &self,
        id: &str,
        args: Vec<OciArgs>,
        attach_stdin: bool,
    ) -> Result<Option<ChildStdin>> {
        let mut command = Command::new(&self.binary);
        command
            .args(Subcommand::Create((id.into(), args)).build_cmd())
            .stdin(if attach_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command.spawn().context("spawn oci create")?;
        let stdin = child.stdin.take();
        reap_in_background("create", id, child);
        Ok(stdin)
    }

    /// Create and start an instance in one step, without waiting for it.
    pub async fn run_instance(&self, id: &str, args: Vec<OciArgs>) -> Result<()> {
        let mut command = Command::new(&self.binary);
        command
            .args(Subcommand::Run((id.into(), args)).build_cmd())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let child = command.spawn().context("spawn oci run")?;
        reap_in_background("run", id, child);
        Ok(())
    }

    /// Execute the user defined process of a created instance.
    pub async fn start(&self, id: &str) -> Result<()> {
        let output = self.run(&[], &Subcommand::Start(id.into())).await?;
        ensure_success(id, "start", &output)?;
        Ok(())
    }

    /// Send SIGTERM, or SIGKILL when `force` is set, to the instance.
    pub async fn kill(&self, id: &str, force: bool) -> Result<()> {
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        self.signal(id, signal).await
    }

    /// Send an arbitrary signal to the instance.
    pub async fn signal(&self, id: &str, signal: Signal) -> Result<()> {
        let output = self
            .run(&[], &Subcommand::Kill((id.into(), signal)))
            .await?;
        ensure_success(id, "kill", &output)?;
        Ok(())
    }

    /// Release all runtime resources of the instance.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let output = self.run(&[], &Subcommand::Delete(id.into())).await?;
        ensure_success(id, "delete", &output)?;
        Ok(())
    }

    /// Run `cmd` inside the instance and collect its output.
    pub async fn exec_sync(
        &self,
        id: &str,
        cmd: &[String],
        envs: &[(String, String)],
        cancel: Option<&Cancel>,
    ) -> Result<ExecResult> {
        let mut command = self.prepare_exec(id, cmd, envs);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().context("spawn oci exec")?;
        let pid = child.id().map(|p| Pid::from_raw(p as i32));

        let output_fut = child.wait_with_output();
        tokio::pin!(output_fut);
        let output = tokio::select! {
            output = &mut output_fut => output.context("wait for oci exec")?,
            _ = canceled(cancel) => {
                if let Some(pid) = pid {
                    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
                }
                let _ = (&mut output_fut).await;
                bail!("exec in {} canceled", id);
            }
        };

        Ok(ExecResult {
            exit_code: exit_code(&output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Run `cmd` inside the instance with the provided standard streams
    /// attached. Returns the process exit code.
    pub async fn exec<I, O, E>(
        &self,
        id: &str,
        cmd: &[String],
        envs: &[(String, String)],
        stdin: Option<I>,
        stdout: Option<O>,
        stderr: Option<E>,
        cancel: Option<&Cancel>,
    ) -> Result<i32>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let mut command = self.prepare_exec(id, cmd, envs);
        command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().context("spawn oci exec")?;
        let pid = child.id().map(|p| Pid::from_raw(p as i32));

        if let (Some(mut from), Some(mut to)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut from, &mut to).await;
                let _ = to.shutdown().await;
            });
        }
        let out_pump = pump(child.stdout.take(), stdout);
        let err_pump = pump(child.stderr.take(), stderr);

        let wait_fut = child.wait();
        tokio::pin!(wait_fut);
        let status = tokio::select! {
            status = &mut wait_fut => status.context("wait for oci exec")?,
            _ = canceled(cancel) => {
                if let Some(pid) = pid {
                    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
                }
                (&mut wait_fut).await.context("reap canceled oci exec")?
            }
        };

        if let Some(handle) = out_pump {
            let _ = handle.await;
        }
        if let Some(handle) = err_pump {
            let _ = handle.await;
        }
        Ok(exit_code(&status))
    }

    /// Assemble a ready-to-spawn exec command for the instance.
    pub fn prepare_exec(
        &self,
        id: &str,
        cmd: &[String],
        envs: &[(String, String)],
    ) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(Subcommand::Exec((id.into(), cmd.to_vec())).build_cmd());
        for (key, value) in envs {
            command.env(format!("{}{}", ENV_PREFIX, key), value);
        }
        command
    }

    /// Update the resource limits of a running instance.
    pub async fn update_resources(
        &self,
        id: &str,
        resources: &crate::oci_spec::LinuxResources,
    ) -> Result<()> {
        let payload = serde_json::to_vec(resources).context("serialize resources")?;

        let mut command = Command::new(&self.binary);
        command
            .args(Subcommand::Update(id.into()).build_cmd())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command.spawn().context("spawn oci update")?;
        let mut stdin = child.stdin.take().context("no stdin for oci update")?;
        stdin
            .write_all(&payload)
            .await
            .context("write resources to oci update")?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .context("wait for oci update")?;
        ensure_success(id, "update", &output)?;
        Ok(())
    }

    /// Read the compile time configuration of the runtime binary.
    pub async fn build_config(&self) -> Result<BuildConfig> {
        let output = self.run(&[], &Subcommand::Buildcfg).await?;
        ensure_success("buildcfg", "buildcfg", &output)?;
        BuildConfig::from_reader(&output.stdout[..]).context("parse buildcfg output")
    }

    async fn run(&self, global_args: &[String], subcommand: &Subcommand) -> Result<Output> {
        let mut args = global_args.to_vec();
        args.extend(subcommand.build_cmd());
        debug!("Invoking {} {}", self.binary.display(), args.join(" "));
        self.exec.run_output(&self.binary, &args).await
    }
}

/// Map a finished command to the typed runtime errors.
fn ensure_success(
    id: &str,
    command: &str,
    output: &Output,
) -> std::result::Result<(), RuntimeError> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains(NO_INSTANCE_FOUND) {
        return Err(RuntimeError::NotFound(id.into()));
    }
    Err(RuntimeError::CommandFailed {
        command: command.into(),
        code: output.status.code(),
        stderr: stderr.trim().into(),
    })
}

/// Exit code from a wait status, following the shell convention for
/// signal-terminated processes.
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

async fn canceled(cancel: Option<&Cancel>) {
    match cancel {
        Some(cancel) => cancel.canceled().await,
        None => futures::future::pending().await,
    }
}

fn pump<R, O>(from: Option<R>, to: Option<O>) -> Option<tokio::task::JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    match (from, to) {
        (Some(mut from), Some(mut to)) => Some(tokio::spawn(async move {
            let _ = tokio::io::copy(&mut from, &mut to).await;
        })),
        _ => None,
    }
}

/// Reap a detached runtime invocation, logging its stderr on failure.
fn reap_in_background(action: &'static str, id: &str, child: tokio::process::Child) {
    let id = id.to_string();
    tokio::spawn(async move {
        match child.wait_with_output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                "Detached oci {} of {} failed (exit code {:?}): {}",
                action,
                id,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("Failed to reap oci {} of {}: {}", action, id, e),
        }
    });
}

#[async_trait]
trait ExecCommand: Debug + DynClone + Send + Sync {
    /// Run a command and return its `Output`.
    async fn run_output(&self, binary: &Path, args: &[String]) -> Result<Output> {
        Command::new(binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("run {}", binary.display()))
    }
}

clone_trait_object!(ExecCommand);

#[derive(Clone, Debug, Default)]
struct DefaultExecCommand;

impl ExecCommand for DefaultExecCommand {}

type InstanceId = String;

#[derive(AsRefStr, Clone, Debug, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
/// Subcommands of the runtime's OCI engine.
pub enum Subcommand {
    Create((InstanceId, Vec<OciArgs>)),
    Run((InstanceId, Vec<OciArgs>)),
    Start(InstanceId),
    State(InstanceId),
    Kill((InstanceId, Signal)),
    Delete(InstanceId),
    Exec((InstanceId, Vec<String>)),
    Update(InstanceId),
    Buildcfg,
}

impl Subcommand {
    /// Build the argument vector for this subcommand.
    fn build_cmd(&self) -> Vec<String> {
        use Subcommand::*;
        let mut cmd = match self {
            // buildcfg is a top level subcommand, everything else lives
            // below `oci`.
            Buildcfg => return vec![self.as_ref().into()],
            _ => vec!["oci".into(), self.as_ref().into()],
        };
        match self {
            Create((id, args)) | Run((id, args)) => {
                cmd.extend(args.iter().map(ToString::to_string));
                cmd.push(id.into());
            }
            Start(id) | State(id) | Delete(id) => cmd.push(id.into()),
            Kill((id, signal)) => {
                cmd.push("-s".into());
                cmd.push(signal.to_string());
                cmd.push(id.into());
            }
            Exec((id, user_cmd)) => {
                cmd.push(id.into());
                cmd.extend(user_cmd.iter().cloned());
            }
            Update(id) => {
                cmd.push("--from-file".into());
                cmd.push("-".into());
                cmd.push(id.into());
            }
            Buildcfg => unreachable!("handled above"),
        }
        cmd
    }
}

#[derive(AsRefStr, Clone, Debug, Eq, PartialEq)]
#[strum(serialize_all = "kebab_case")]
/// Available arguments for `oci create` and `oci run`.
pub enum OciArgs {
    /// Path to the root of the bundle directory
    Bundle(PathBuf),
    /// Path to the socket receiving state transitions
    SyncSocket(PathBuf),
    /// Path to the instance's log file
    LogPath(PathBuf),
    /// Create the instance without a user process (pod infra)
    EmptyProcess,
}

fn write_kv<K, V>(f: &mut fmt::Formatter<'_>, key: K, value: V) -> fmt::Result
where
    K: AsRef<str>,
    V: fmt::Display,
{
    write!(f, "{}={}", key.as_ref(), value)
}

impl fmt::Display for OciArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use OciArgs::*;
        write!(f, "--")?;

        match self {
            Bundle(path) => write_kv(f, self, path.display()),
            SyncSocket(path) => write_kv(f, self, path.display()),
            LogPath(path) => write_kv(f, self, path.display()),
            _ => write!(f, "{}", self.as_ref()),
        }
    }
}

#[derive(Clone, Debug, CopyGetters, Getters)]
/// Collected output of a synchronous exec.
pub struct ExecResult {
    #[get = "pub"]
    stdout: Vec<u8>,

    #[get = "pub"]
    stderr: Vec<u8>,

    #[get_copy = "pub"]
    exit_code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt as StdExitStatusExt;

    #[derive(Clone, Debug)]
    struct MockExecCommand(Output);

    #[async_trait]
    impl ExecCommand for MockExecCommand {
        async fn run_output(&self, _binary: &Path, _args: &[String]) -> Result<Output> {
            Ok(Output {
                status: self.0.status,
                stdout: self.0.stdout.clone(),
                stderr: self.0.stderr.clone(),
            })
        }
    }

    fn echo_client() -> Result<RuntimeClient> {
        Ok(RuntimeClientBuilder::default()
            .binary(which::which("echo")?)
            .build()?)
    }

    fn mock_client(output: Output) -> Result<RuntimeClient> {
        Ok(RuntimeClientBuilder::default()
            .binary("/does/not/matter")
            .exec(Box::new(MockExecCommand(output)) as Box<dyn ExecCommand>)
            .build()?)
    }

    #[test]
    fn subcommand_arg_assembly() {
        assert_eq!(
            Subcommand::State("id1".into()).build_cmd(),
            vec!["oci", "state", "id1"]
        );
        assert_eq!(
            Subcommand::Create((
                "id1".into(),
                vec![
                    OciArgs::Bundle("/b".into()),
                    OciArgs::SyncSocket("/s.sock".into()),
                    OciArgs::EmptyProcess,
                ],
            ))
            .build_cmd(),
            vec![
                "oci",
                "create",
                "--bundle=/b",
                "--sync-socket=/s.sock",
                "--empty-process",
                "id1"
            ]
        );
        assert_eq!(
            Subcommand::Kill(("id1".into(), Signal::SIGTERM)).build_cmd(),
            vec!["oci", "kill", "-s", "SIGTERM", "id1"]
        );
        assert_eq!(
            Subcommand::Exec(("id1".into(), vec!["ls".into(), "-la".into()])).build_cmd(),
            vec!["oci", "exec", "id1", "ls", "-la"]
        );
        assert_eq!(
            Subcommand::Update("id1".into()).build_cmd(),
            vec!["oci", "update", "--from-file", "-", "id1"]
        );
        assert_eq!(Subcommand::Buildcfg.build_cmd(), vec!["buildcfg"]);
    }

    #[test]
    fn oci_args_to_string() {
        assert_eq!(
            OciArgs::LogPath("/var/log/c.log".into()).to_string(),
            "--log-path=/var/log/c.log"
        );
        assert_eq!(OciArgs::EmptyProcess.to_string(), "--empty-process");
    }

    #[tokio::test]
    async fn start_passes_args_through() -> Result<()> {
        // echo exits successfully no matter the args, so start succeeds.
        echo_client()?.start("id1").await
    }

    #[tokio::test]
    async fn state_decodes_runtime_output() -> Result<()> {
        let json = br#"{"ociVersion":"1.0.0","id":"id1","status":"running","pid":42,"bundle":"/b","annotations":{}}"#;
        let client = mock_client(Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: json.to_vec(),
            stderr: Vec::new(),
        })?;

        let state = client.state("id1").await?;
        assert_eq!(state.state(), State::Running);
        assert_eq!(state.pid, Some(42));
        Ok(())
    }

    #[tokio::test]
    async fn missing_instance_maps_to_not_found() -> Result<()> {
        let client = mock_client(Output {
            status: std::process::ExitStatus::from_raw(256),
            stdout: Vec::new(),
            stderr: b"FATAL: no instance found for id1".to_vec(),
        })?;

        let err = client.delete("id1").await.unwrap_err();
        assert!(RuntimeError::is_not_found(&err));
        Ok(())
    }

    #[tokio::test]
    async fn failure_wraps_stderr() -> Result<()> {
        let client = mock_client(Output {
            status: std::process::ExitStatus::from_raw(256),
            stdout: Vec::new(),
            stderr: b"FATAL: bundle not found".to_vec(),
        })?;

        let err = client.start("id1").await.unwrap_err();
        let runtime_err = err.downcast_ref::<RuntimeError>().expect("typed error");
        match runtime_err {
            RuntimeError::CommandFailed { code, stderr, .. } => {
                assert_eq!(*code, Some(1));
                assert!(stderr.contains("bundle not found"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn exec_sync_collects_output() -> Result<()> {
        let client = echo_client()?;
        let result = client
            .exec_sync("id1", &["hello".into()], &[], None)
            .await?;
        assert_eq!(result.exit_code(), 0);
        assert_eq!(
            String::from_utf8_lossy(result.stdout()),
            "oci exec id1 hello\n"
        );
        Ok(())
    }

    #[test]
    fn exit_code_of_signaled_process() {
        let status = std::process::ExitStatus::from_raw(9);
        assert_eq!(exit_code(&status), 137);
    }

    #[test]
    fn client_requires_binary() {
        assert!(RuntimeClientBuilder::default().build().is_err());
    }
}
