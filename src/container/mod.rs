//! Container lifecycle.
//!
//! A container owns its bundle mounts, sync socket, log file and image
//! borrow; the pod it belongs to outlives it and is only reached through a
//! weak reference.

pub mod config;

pub use config::ContainerConfig;

use crate::{
    bundle::{translate, Bundle, Teardown},
    cgroup,
    config::Config,
    container::config::{LinuxContainerResources, SecurityProfiles},
    error::RuntimeError,
    fs::Usage,
    image::ImageInfo,
    index::generate_id,
    oci_spec::{LinuxCpuBuilder, LinuxMemoryBuilder, LinuxResources, LinuxResourcesBuilder},
    pod::Pod,
    runtime::{expect_state, observe_state, ExecResult, OciState, RuntimeClient, State},
    sync::{Cancel, OnceAction},
};
use anyhow::{Context, Result};
use getset::{CopyGetters, Getters};
use log::{debug, info, warn};
use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use strum::{AsRefStr, Display};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    process::ChildStdin,
    sync::{mpsc, Mutex as AsyncMutex},
};

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "shouty_snake_case")]
/// The public, cluster-facing state of a container.
pub enum ContainerState {
    ContainerCreated,
    ContainerRunning,
    ContainerExited,
    ContainerUnknown,
}

#[derive(CopyGetters, Debug, Getters)]
/// Point-in-time resource usage of a container.
pub struct ContainerStats {
    /// Disk usage of the container's base directory.
    #[get = "pub"]
    fs: Usage,

    /// Total CPU time consumed, in nanoseconds.
    #[get_copy = "pub"]
    cpu_usage_nanos: u64,

    /// Current memory usage, in bytes.
    #[get_copy = "pub"]
    memory_usage_bytes: u64,
}

#[derive(Debug, Default)]
struct Status {
    runtime_state: State,
    oci: Option<OciState>,
}

#[derive(Debug, Default)]
struct SyncChannel {
    rx: Option<mpsc::Receiver<State>>,
    cancel: Option<Cancel>,
}

/// A container and the host resources it owns.
pub struct Container {
    id: String,
    config: ContainerConfig,
    me: Weak<Container>,
    pod: Weak<Pod>,
    image: Arc<ImageInfo>,
    runtime: Arc<RuntimeClient>,
    base_dir: PathBuf,
    trash_dir: Option<PathBuf>,
    fakesh: PathBuf,
    exec_envs: Vec<(String, String)>,

    status: Mutex<Status>,
    sync: AsyncMutex<SyncChannel>,
    stdin: Mutex<Option<ChildStdin>>,

    create_once: OnceAction,
    is_stopped: AtomicBool,
    is_removed: AtomicBool,
    is_stdin_closed: AtomicBool,
}

impl Container {
    /// Construct a container inside `pod` from its immutable configuration.
    pub fn new(
        config: ContainerConfig,
        pod: &Arc<Pod>,
        image: Arc<ImageInfo>,
        runtime: Arc<RuntimeClient>,
        engine: &Config,
    ) -> Arc<Self> {
        let id = generate_id();
        let base_dir = engine.container_base_dir().join(&id);
        let exec_envs = merge_env_pairs(image.env(), config.envs());
        let pod = Arc::downgrade(pod);
        let trash_dir = engine.trash_dir().clone();
        let fakesh = engine.fakesh().clone();

        Arc::new_cyclic(|me| Self {
            id,
            config,
            me: me.clone(),
            pod,
            image,
            runtime,
            base_dir,
            trash_dir,
            fakesh,
            exec_envs,
            status: Mutex::default(),
            sync: AsyncMutex::default(),
            stdin: Mutex::default(),
            create_once: OnceAction::new(),
            is_stopped: AtomicBool::new(false),
            is_removed: AtomicBool::new(false),
            is_stdin_closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// The pod this container belongs to.
    pub fn pod(&self) -> Result<Arc<Pod>> {
        self.pod.upgrade().context("pod of container is gone")
    }

    pub fn bundle(&self) -> Bundle {
        Bundle::new(&self.base_dir)
    }

    pub fn sync_socket_path(&self) -> PathBuf {
        self.base_dir.join("sync.sock")
    }

    /// The container's log file below the pod's log directory, if a log
    /// path is configured.
    pub fn log_file_path(&self) -> Option<PathBuf> {
        if self.config.log_path().as_os_str().is_empty() {
            return None;
        }
        let pod = self.pod.upgrade()?;
        Some(pod.log_directory().join(self.config.log_path()))
    }

    /// The flattened environment: image-provided values overridden by the
    /// container configuration.
    pub fn exec_envs(&self) -> &[(String, String)] {
        &self.exec_envs
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopped.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.is_removed.load(Ordering::SeqCst)
    }

    fn runtime_state(&self) -> State {
        self.status
            .lock()
            .expect("poisoned container status lock")
            .runtime_state
    }

    /// The last observed OCI state snapshot.
    pub fn oci_state(&self) -> Option<OciState> {
        self.status
            .lock()
            .expect("poisoned container status lock")
            .oci
            .clone()
    }

    /// The pid of the container process, once created.
    pub fn pid(&self) -> Option<i32> {
        self.status
            .lock()
            .expect("poisoned container status lock")
            .oci
            .as_ref()
            .and_then(|oci| oci.pid)
    }

    /// The public state derived from the runtime state.
    pub fn state(&self) -> ContainerState {
        match self.runtime_state() {
            State::Created => ContainerState::ContainerCreated,
            State::Running => ContainerState::ContainerRunning,
            State::Exited => ContainerState::ContainerExited,
            _ => ContainerState::ContainerUnknown,
        }
    }

    /// A human readable reason for the current state.
    pub fn state_reason(&self) -> String {
        let status = self.status.lock().expect("poisoned container status lock");
        state_reason(status.runtime_state, status.oci.as_ref())
    }

    /// Socket for attaching to the container's standard streams.
    pub fn attach_socket(&self) -> Option<String> {
        self.oci_state()
            .and_then(|oci| oci.attach_socket().map(String::from))
    }

    /// Socket accepting runtime control requests.
    pub fn control_socket(&self) -> Option<String> {
        self.oci_state()
            .and_then(|oci| oci.control_socket().map(String::from))
    }

    /// Create the container. Repeated or concurrent invocations replay the
    /// first outcome.
    pub async fn create(&self) -> Result<()> {
        self.create_once
            .run(|| async move { self.do_create().await })
            .await
    }

    async fn do_create(&self) -> Result<()> {
        let profiles = self.config.validate()?;
        let pod = self.pod()?;

        if let Some(log_file) = self.log_file_path() {
            if let Some(parent) = log_file.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
        }

        self.image.borrow(&self.id);
        let res = async {
            self.spawn_oci_container(&pod, &profiles).await?;
            self.update_state().await
        }
        .await;

        match res {
            Ok(()) => {
                if let Some(me) = self.me.upgrade() {
                    pod.add_container(me);
                }
                info!("Created container {} in pod {}", self.id, pod.id());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to create container {}: {:#}", self.id, e);
                let sync = self.sync.lock().await;
                if let Some(cancel) = &sync.cancel {
                    cancel.cancel();
                }
                drop(sync);
                let _ = self.cleanup_files(Teardown::BestEffort);
                self.image.return_borrow(&self.id);
                Err(e)
            }
        }
    }

    /// Build the bundle, open the sync socket and drive the runtime to the
    /// created state.
    async fn spawn_oci_container(
        &self,
        pod: &Arc<Pod>,
        profiles: &SecurityProfiles,
    ) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("create container dir {}", self.base_dir.display()))?;

        let bundle = self.bundle();
        bundle.prepare_container(self.image.path())?;

        let namespaces = pod.namespaces();
        let hostname_file = pod.hostname_file_path();
        let resolv_conf = pod.resolv_conf_file_path();
        let rootfs = bundle.rootfs();
        let sync_socket = self.sync_socket_path();
        let spec = translate::container_spec(&translate::ContainerSpecParams {
            config: &self.config,
            profiles,
            pod_config: pod.config(),
            pod_namespaces: &namespaces,
            hostname_file: &hostname_file,
            resolv_conf_file: resolv_conf.as_deref(),
            cgroup_parent: pod.cgroup_parent(),
            rootfs: &rootfs,
            image_env: self.image.env(),
            fakesh: &self.fakesh,
            container_id: &self.id,
            sync_socket: &sync_socket,
        })?;
        bundle.write_spec(&spec)?;

        let (rx, cancel) = observe_state(self.sync_socket_path())?;
        {
            let mut sync = self.sync.lock().await;
            sync.rx = Some(rx);
            sync.cancel = Some(cancel);
        }

        let mut args = vec![
            crate::runtime::OciArgs::Bundle(bundle.path().clone()),
            crate::runtime::OciArgs::SyncSocket(self.sync_socket_path()),
        ];
        if let Some(log_file) = self.log_file_path() {
            args.push(crate::runtime::OciArgs::LogPath(log_file));
        }
        let stdin = self
            .runtime
            .create(&self.id, args, self.config.stdin())
            .await?;
        *self.stdin.lock().expect("poisoned stdin lock") = stdin;

        let mut sync = self.sync.lock().await;
        let rx = sync.rx.as_mut().context("sync channel missing")?;
        expect_state(rx, State::Creating).await?;
        expect_state(rx, State::Created).await?;
        Ok(())
    }

    /// Start the created container.
    pub async fn start(&self) -> Result<()> {
        self.update_state().await?;
        if self.runtime_state() != State::Created {
            return Err(RuntimeError::NotCreated.into());
        }
        self.runtime.start(&self.id).await?;
        {
            let mut sync = self.sync.lock().await;
            if let Some(rx) = sync.rx.as_mut() {
                expect_state(rx, State::Running).await?;
            }
        }
        self.update_state().await?;
        info!("Started container {}", self.id);
        Ok(())
    }

    /// Stop the container, giving it `timeout` seconds after SIGTERM before
    /// escalating. Idempotent.
    pub async fn stop(&self, timeout: i64) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        self.update_state().await?;
        self.terminate(timeout).await?;
        self.update_state().await?;
        self.is_stopped.store(true, Ordering::SeqCst);
        info!("Stopped container {}", self.id);
        Ok(())
    }

    /// Remove the container and every host resource it owns. Idempotent.
    pub async fn remove(&self) -> Result<()> {
        if self.is_removed() {
            return Ok(());
        }

        let known = match self.runtime.state(&self.id).await {
            Ok(oci) => {
                let mut status = self.status.lock().expect("poisoned container status lock");
                status.runtime_state = oci.state();
                status.oci = Some(oci);
                true
            }
            Err(e) if RuntimeError::is_not_found(&e) => false,
            Err(e) => return Err(e),
        };
        if known {
            self.kill().await?;
            match self.runtime.delete(&self.id).await {
                Ok(()) => {}
                Err(e) if RuntimeError::is_not_found(&e) => {}
                Err(e) => return Err(e),
            }
        }

        self.close_stdin();
        self.archive_to_trash();
        self.cleanup_files(Teardown::Strict)?;
        self.image.return_borrow(&self.id);
        if let Some(pod) = self.pod.upgrade() {
            pod.remove_container(&self.id);
        }
        self.is_stopped.store(true, Ordering::SeqCst);
        self.is_removed.store(true, Ordering::SeqCst);
        info!("Removed container {}", self.id);
        Ok(())
    }

    /// Refresh the container's view of the runtime state.
    ///
    /// A missing instance is tolerated; the last snapshot stays in place.
    pub async fn update_state(&self) -> Result<()> {
        match self.runtime.state(&self.id).await {
            Ok(oci) => {
                let mut status = self.status.lock().expect("poisoned container status lock");
                status.runtime_state = oci.state();
                status.oci = Some(oci);
                Ok(())
            }
            Err(e) if RuntimeError::is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Ask the process to terminate, escalating to SIGKILL after `timeout`
    /// seconds. A timeout of zero kills immediately.
    async fn terminate(&self, timeout: i64) -> Result<()> {
        if self.runtime_state() == State::Exited {
            return Ok(());
        }
        if timeout == 0 {
            return self.kill().await;
        }

        match self.runtime.kill(&self.id, false).await {
            Ok(()) => {}
            Err(e) if RuntimeError::is_not_found(&e) => {
                self.mark_exited();
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let exited = {
            let mut sync = self.sync.lock().await;
            match sync.rx.as_mut() {
                Some(rx) => {
                    let deadline = tokio::time::sleep(Duration::from_secs(timeout as u64));
                    tokio::pin!(deadline);
                    loop {
                        tokio::select! {
                            got = rx.recv() => match got {
                                Some(State::Exited) | None => break true,
                                Some(_) => continue,
                            },
                            _ = &mut deadline => break false,
                        }
                    }
                }
                None => true,
            }
        };

        if exited {
            self.cancel_sync().await;
            self.mark_exited();
            Ok(())
        } else {
            debug!(
                "Container {} survived SIGTERM for {}s, escalating",
                self.id, timeout
            );
            self.kill().await
        }
    }

    /// Force-kill the process and wait for the exited transition.
    async fn kill(&self) -> Result<()> {
        if self.runtime_state() == State::Exited {
            return Ok(());
        }
        match self.runtime.kill(&self.id, true).await {
            Ok(()) => {}
            Err(e) if RuntimeError::is_not_found(&e) => {
                self.mark_exited();
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let res = {
            let mut sync = self.sync.lock().await;
            match sync.rx.as_mut() {
                Some(rx) => expect_state(rx, State::Exited).await,
                None => Ok(()),
            }
        };
        self.cancel_sync().await;
        res?;
        self.mark_exited();
        Ok(())
    }

    async fn cancel_sync(&self) {
        let sync = self.sync.lock().await;
        if let Some(cancel) = &sync.cancel {
            cancel.cancel();
        }
    }

    fn mark_exited(&self) {
        self.status
            .lock()
            .expect("poisoned container status lock")
            .runtime_state = State::Exited;
    }

    /// Compute filesystem and cgroup statistics of the container.
    pub async fn stat(&self) -> Result<ContainerStats> {
        let fs_usage = crate::fs::usage(&self.base_dir)?;
        let pid = self.pid().context("container has no pid")?;
        let cgroup = cgroup::stats(pid)?;
        Ok(ContainerStats {
            fs: fs_usage,
            cpu_usage_nanos: cgroup.cpu_usage_nanos(),
            memory_usage_bytes: cgroup.memory_usage_bytes(),
        })
    }

    /// Apply new resource limits to the running container.
    pub async fn update_resources(&self, resources: &LinuxContainerResources) -> Result<()> {
        let update = partial_resources(resources)?;
        self.runtime.update_resources(&self.id, &update).await?;

        if resources.oom_score_adj() != 0 {
            let pid = self
                .pid()
                .context("container has no pid for oom adjustment")?;
            let path = format!("/proc/{}/oom_adj", pid);
            fs::write(&path, resources.oom_score_adj().to_string())
                .with_context(|| format!("write {}", path))?;
        }
        Ok(())
    }

    /// Ask the runtime to reopen the container's log file.
    pub async fn reopen_log_file(&self) -> Result<()> {
        let socket = self
            .control_socket()
            .context("container has no control socket")?;
        let mut stream = UnixStream::connect(&socket)
            .await
            .with_context(|| format!("connect control socket {}", socket))?;

        let msg = serde_json::json!({ "reopen_log": true });
        stream
            .write_all(&serde_json::to_vec(&msg).context("encode control message")?)
            .await
            .context("write control message")?;

        let mut ack = [0u8; 1];
        stream
            .read_exact(&mut ack)
            .await
            .context("read control acknowledgement")?;
        Ok(())
    }

    /// Run `cmd` inside the container and collect its output.
    pub async fn exec_sync(
        &self,
        cmd: &[String],
        cancel: Option<&Cancel>,
    ) -> Result<ExecResult> {
        self.runtime
            .exec_sync(&self.id, cmd, &self.exec_envs, cancel)
            .await
    }

    /// Run `cmd` inside the container with streams attached.
    pub async fn exec<I, O, E>(
        &self,
        cmd: &[String],
        stdin: Option<I>,
        stdout: Option<O>,
        stderr: Option<E>,
        cancel: Option<&Cancel>,
    ) -> Result<i32>
    where
        I: tokio::io::AsyncRead + Unpin + Send + 'static,
        O: tokio::io::AsyncWrite + Unpin + Send + 'static,
        E: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        self.runtime
            .exec(&self.id, cmd, &self.exec_envs, stdin, stdout, stderr, cancel)
            .await
    }

    /// A ready-to-spawn exec command with the container's environment.
    pub fn prepare_exec(&self, cmd: &[String]) -> tokio::process::Command {
        self.runtime.prepare_exec(&self.id, cmd, &self.exec_envs)
    }

    /// Take the write end of the container's stdin, if any.
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.stdin.lock().expect("poisoned stdin lock").take()
    }

    /// Close the container's stdin; honoured once for stdin-once sessions.
    pub fn close_stdin(&self) {
        let mut stdin = self.stdin.lock().expect("poisoned stdin lock");
        if stdin.take().is_some() {
            debug!("Closed stdin of container {}", self.id);
        }
        self.is_stdin_closed.store(true, Ordering::SeqCst);
    }

    pub fn is_stdin_closed(&self) -> bool {
        self.is_stdin_closed.load(Ordering::SeqCst)
    }

    /// Archive the last OCI config and log files before removal.
    fn archive_to_trash(&self) {
        let trash_dir = match &self.trash_dir {
            Some(trash_dir) => trash_dir,
            None => return,
        };
        let pod_id = self
            .pod
            .upgrade()
            .map(|pod| pod.id().to_string())
            .unwrap_or_else(|| String::from("orphaned"));
        let dest = trash_dir.join(pod_id).join(&self.id);

        let res = (|| -> Result<()> {
            fs::create_dir_all(&dest)?;
            let config_file = self.bundle().config_file();
            if config_file.exists() {
                fs::copy(&config_file, dest.join("config.json"))?;
            }
            if let Some(log_file) = self.log_file_path() {
                if log_file.exists() {
                    let logs = dest.join("logs");
                    fs::create_dir_all(&logs)?;
                    if let Some(name) = log_file.file_name() {
                        fs::copy(&log_file, logs.join(name))?;
                    }
                }
            }
            Ok(())
        })();
        match res {
            Ok(()) => debug!("Archived container {} to {}", self.id, dest.display()),
            Err(e) => warn!("Failed to archive container {}: {:#}", self.id, e),
        }
    }

    /// Release the container's host files: bundle mounts, sync socket, the
    /// base directory and its log file.
    fn cleanup_files(&self, mode: Teardown) -> Result<()> {
        self.bundle().teardown(mode)?;
        mode.step("remove sync socket", || {
            crate::fs::remove_file_if_exists(&self.sync_socket_path())
        })?;
        mode.step("remove container dir", || {
            crate::fs::remove_tree_if_exists(&self.base_dir)
        })?;

        if let (Some(log_file), Some(pod)) = (self.log_file_path(), self.pod.upgrade()) {
            mode.step("remove log file", || {
                crate::fs::remove_file_if_exists(&log_file)
            })?;
            if let Some(parent) = log_file.parent() {
                // A per-container log subdirectory goes away with the
                // container; the pod's shared log directory stays.
                if parent != pod.log_directory().as_path() {
                    mode.step("remove log dir", || crate::fs::remove_tree_if_exists(parent))?;
                }
            }
        }
        Ok(())
    }
}

/// The reason string accompanying the public container state.
fn state_reason(state: State, oci: Option<&OciState>) -> String {
    match state {
        State::Running => String::new(),
        State::Exited => match oci.and_then(|o| o.exit_code()) {
            Some(0) => String::from("Completed"),
            Some(_) => String::from("Error"),
            None => oci
                .and_then(|o| o.exit_desc())
                .unwrap_or_default()
                .to_string(),
        },
        _ => oci
            .and_then(|o| o.exit_desc())
            .unwrap_or_default()
            .to_string(),
    }
}

/// Image-provided environment pairs overridden by the configuration.
fn merge_env_pairs(
    image: &[(String, String)],
    overrides: &[(String, String)],
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = image.to_vec();
    for (key, value) in overrides {
        match merged.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.clone(),
            None => merged.push((key.clone(), value.clone())),
        }
    }
    merged
}

/// A resources object carrying only the non-zero fields of the request.
fn partial_resources(resources: &LinuxContainerResources) -> Result<LinuxResources> {
    let mut builder = LinuxResourcesBuilder::default();

    let mut cpu = LinuxCpuBuilder::default();
    let mut cpu_set = false;
    if !resources.cpuset_cpus().is_empty() {
        cpu = cpu.cpus(resources.cpuset_cpus().clone());
        cpu_set = true;
    }
    if !resources.cpuset_mems().is_empty() {
        cpu = cpu.mems(resources.cpuset_mems().clone());
        cpu_set = true;
    }
    if resources.cpu_period() != 0 {
        cpu = cpu.period(resources.cpu_period() as u64);
        cpu_set = true;
    }
    if resources.cpu_quota() != 0 {
        cpu = cpu.quota(resources.cpu_quota());
        cpu_set = true;
    }
    if resources.cpu_shares() != 0 {
        cpu = cpu.shares(resources.cpu_shares() as u64);
        cpu_set = true;
    }
    if cpu_set {
        builder = builder.cpu(cpu.build()?);
    }
    if resources.memory_limit_in_bytes() != 0 {
        builder = builder.memory(
            LinuxMemoryBuilder::default()
                .limit(resources.memory_limit_in_bytes())
                .build()?,
        );
    }
    Ok(builder.build()?)
}
