//! Translation of pod and container configurations into OCI runtime specs.

use crate::{
    bundle::user,
    capability::Capabilities,
    container::config::{ContainerConfig, SecurityProfiles, SeccompProfile},
    error::ConfigError,
    namespace::{Namespace, NamespaceType},
    oci_spec::{
        LinuxBuilder, LinuxCapabilities, LinuxCpuBuilder, LinuxDevice,
        LinuxDeviceBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxMemoryBuilder,
        LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType, LinuxResources,
        LinuxResourcesBuilder, Mount, MountBuilder, ProcessBuilder, RootBuilder, Spec,
        SpecBuilder, UserBuilder, OCI_VERSION,
    },
    pod::config::{NamespaceMode, PodConfig},
    runtime::state::{ANNOTATION_RUNTIME_TYPE, ANNOTATION_SYNC_SOCKET, RUNTIME_TYPE_POD},
};
use anyhow::{Context, Result};
use nix::sys::stat::{self, SFlag};
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

/// Action script executed for images started without an explicit command.
const RUN_SCRIPT: &str = "/.singularity.d/actions/run";
/// Action script executed for images started with an explicit command.
const EXEC_SCRIPT: &str = "/.singularity.d/actions/exec";

/// Everything the pod spec translation needs.
pub struct PodSpecParams<'a> {
    pub config: &'a PodConfig,
    pub namespaces: &'a [Namespace],
    /// Effective hostname after defaulting.
    pub hostname: &'a str,
    /// Effective cgroup parent after defaulting.
    pub cgroup_parent: &'a str,
    /// Socket over which the runtime reports state transitions.
    pub sync_socket: &'a Path,
}

/// Everything the container spec translation needs; the pod side is the
/// narrow accessor surface a container may use.
pub struct ContainerSpecParams<'a> {
    pub config: &'a ContainerConfig,
    pub profiles: &'a SecurityProfiles,
    pub pod_config: &'a PodConfig,
    pub pod_namespaces: &'a [Namespace],
    pub hostname_file: &'a Path,
    pub resolv_conf_file: Option<&'a Path>,
    pub cgroup_parent: &'a str,
    pub rootfs: &'a Path,
    pub image_env: &'a [(String, String)],
    pub fakesh: &'a Path,
    pub container_id: &'a str,
    /// Socket over which the runtime reports state transitions.
    pub sync_socket: &'a Path,
}

/// Assemble the minimal spec of a pod infra instance.
pub fn pod_spec(params: &PodSpecParams) -> Result<Spec> {
    let security = params.config.security_context();
    let privileged = security.map(|sc| sc.privileged()).unwrap_or(false);

    let mut user = UserBuilder::default();
    if let Some(uid) = security.and_then(|sc| *sc.run_as_user()) {
        user = user.uid(uid as u32);
    }
    if let Some(gid) = security.and_then(|sc| *sc.run_as_group()) {
        user = user.gid(gid as u32);
    }

    let mut process = ProcessBuilder::default()
        .user(user.build()?)
        .args(vec!["true".to_string()])
        .cwd("/");
    if privileged {
        process = process.capabilities(LinuxCapabilities::from_names(
            Capabilities::all().names(),
        ));
    }

    let mut namespaces = vec![anonymous_namespace(LinuxNamespaceType::Mount)];
    for ns in params.namespaces {
        let mut builder = LinuxNamespaceBuilder::default().typ(oci_namespace_type(*ns.typ()));
        if let Some(path) = ns.path() {
            builder = builder.path(path.clone());
        }
        namespaces.push(builder.build()?);
    }

    let mut linux = LinuxBuilder::default()
        .namespaces(namespaces)
        .cgroups_path(params.cgroup_parent);
    let sysctls = params.config.sysctls();
    if !sysctls.is_empty() {
        linux = linux.sysctl(sysctls);
    }

    let mut annotations: HashMap<String, String> = params.config.annotations().clone();
    annotations.insert(ANNOTATION_RUNTIME_TYPE.into(), RUNTIME_TYPE_POD.into());
    annotations.insert(
        ANNOTATION_SYNC_SOCKET.into(),
        params.sync_socket.display().to_string(),
    );

    let root = RootBuilder::default()
        .path("rootfs")
        .readonly(
            security
                .map(|sc| sc.readonly_rootfs())
                .unwrap_or(false),
        )
        .build()?;

    Ok(SpecBuilder::default()
        .version(OCI_VERSION)
        .root(root)
        .hostname(params.hostname)
        .process(process.build()?)
        .mounts(pod_mounts())
        .annotations(annotations)
        .linux(linux.build()?)
        .build()?)
}

/// Assemble the full spec of a container instance.
pub fn container_spec(params: &ContainerSpecParams) -> Result<Spec> {
    let config = params.config;
    let security = config.security_context();
    let privileged = config.privileged();

    let readonly = security.map(|sc| sc.readonly_rootfs()).unwrap_or(false);
    let root = RootBuilder::default()
        .path(params.rootfs)
        .readonly(readonly)
        .build()?;

    let mounts = container_mounts(params)?;
    let (devices, device_rules) = translate_devices(config, privileged)?;

    // Process section.
    let resolved = resolve_user(params)?;
    let mut process = ProcessBuilder::default()
        .user(resolved)
        .args(process_args(config))
        .env(merge_envs(params.image_env, config.envs()))
        .cwd(if config.working_dir().is_empty() {
            "/".to_string()
        } else {
            config.working_dir().clone()
        })
        .terminal(config.tty());

    if let Some(sc) = security {
        if sc.no_new_privs() {
            process = process.no_new_privileges(true);
        }
    }

    let caps = Capabilities::default_set()
        .apply(params.profiles.caps_add(), params.profiles.caps_drop());
    process = process.capabilities(LinuxCapabilities::from_names(caps.names()));

    let selinux = security
        .and_then(|sc| sc.selinux_options().as_ref())
        .filter(|opts| opts.is_set());
    if let Some(opts) = selinux {
        process = process.selinux_label(opts.label());
    }
    if let Some(profile) = params.profiles.apparmor() {
        process = process.apparmor_profile(profile.clone());
    }
    if let Some(resources) = config.resources() {
        if resources.oom_score_adj() != 0 {
            process = process.oom_score_adj(resources.oom_score_adj());
        }
    }

    // Linux section.
    let mut linux = LinuxBuilder::default()
        .namespaces(container_namespaces(params)?)
        .cgroups_path(format!("{}/{}", params.cgroup_parent, params.container_id));
    if let Some(resources) = translate_resources(config, device_rules)? {
        linux = linux.resources(resources);
    }
    if let Some(opts) = selinux {
        linux = linux.mount_label(opts.label());
    }
    if !devices.is_empty() {
        linux = linux.devices(devices);
    }
    if !privileged {
        if let SeccompProfile::Localhost(profile) = params.profiles.seccomp() {
            linux = linux.seccomp(load_seccomp(profile)?);
        }
    }

    let mut annotations: HashMap<String, String> = config.annotations().clone();
    annotations.insert(
        ANNOTATION_SYNC_SOCKET.into(),
        params.sync_socket.display().to_string(),
    );

    let mut spec = SpecBuilder::default()
        .version(OCI_VERSION)
        .root(root)
        .mounts(mounts)
        .annotations(annotations)
        .linux(linux.build()?);

    // Privileged is applied last and wins over the profile translation.
    if privileged {
        process = process
            .capabilities(LinuxCapabilities::from_names(Capabilities::all().names()));
    }
    spec = spec.process(process.build()?);

    Ok(spec.build()?)
}

/// The argument vector of the container process.
///
/// Without an explicit command the image's run action interprets the args;
/// with one, the exec action runs the command directly.
fn process_args(config: &ContainerConfig) -> Vec<String> {
    let mut args = Vec::new();
    if config.command().is_empty() {
        args.push(RUN_SCRIPT.to_string());
        args.extend(config.args().iter().cloned());
    } else {
        args.push(EXEC_SCRIPT.to_string());
        args.extend(config.command().iter().cloned());
        args.extend(config.args().iter().cloned());
    }
    args
}

/// Image-provided environment overridden by the container configuration.
fn merge_envs(image_env: &[(String, String)], overrides: &[(String, String)]) -> Vec<String> {
    let mut merged: Vec<(String, String)> = image_env.to_vec();
    for (key, value) in overrides {
        match merged.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.clone(),
            None => merged.push((key.clone(), value.clone())),
        }
    }
    merged
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

fn resolve_user(params: &ContainerSpecParams) -> Result<crate::oci_spec::User> {
    let security = params.config.security_context();

    let username = security
        .map(|sc| sc.run_as_username().as_str())
        .unwrap_or_default();
    let mut resolved = if !username.is_empty() {
        user::resolve(params.rootfs, username)?
    } else {
        user::ResolvedUser::default()
    };

    if let Some(uid) = security.and_then(|sc| *sc.run_as_user()) {
        resolved.uid = uid as u32;
    }
    if let Some(gid) = security.and_then(|sc| *sc.run_as_group()) {
        resolved.gid = gid as u32;
    }

    let mut gids: Vec<u32> = if username.is_empty() {
        Vec::new()
    } else {
        user::supplementary_gids(params.rootfs, username)?
    };
    if let Some(sc) = security {
        for gid in sc.supplemental_groups() {
            let gid = *gid as u32;
            if !gids.contains(&gid) {
                gids.push(gid);
            }
        }
    }

    let mut builder = UserBuilder::default()
        .uid(resolved.uid)
        .gid(resolved.gid);
    if !gids.is_empty() {
        builder = builder.additional_gids(gids);
    }
    Ok(builder.build()?)
}

/// Mounts every container gets, mirroring the runtime's defaults.
fn default_mounts() -> Vec<(&'static str, &'static str, &'static str, &'static [&'static str])> {
    vec![
        ("/proc", "proc", "proc", &[]),
        (
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        (
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        (
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        ("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        ("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
    ]
}

fn pod_mounts() -> Vec<Mount> {
    [
        ("/proc", "proc", "proc"),
        ("/dev", "tmpfs", "tmpfs"),
    ]
    .iter()
    .map(|(dest, typ, source)| {
        MountBuilder::default()
            .destination(*dest)
            .typ(typ.to_string())
            .source(*source)
            .build()
            .expect("static mount")
    })
    .collect()
}

fn container_mounts(params: &ContainerSpecParams) -> Result<Vec<Mount>> {
    let privileged = params.config.privileged();
    let mut mounts = Vec::new();
    for (dest, typ, source, options) in default_mounts() {
        // Privileged containers see the host's devices instead of a fresh
        // tmpfs.
        if privileged && dest == "/dev" {
            mounts.push(bind_mount("/dev", "/dev", false, None)?);
            continue;
        }
        mounts.push(
            MountBuilder::default()
                .destination(dest)
                .typ(typ.to_string())
                .source(source)
                .options(options.iter().map(|o| o.to_string()).collect::<Vec<_>>())
                .build()?,
        );
    }

    if let Some(resolv_conf) = params.resolv_conf_file {
        mounts.push(bind_mount("/etc/resolv.conf", resolv_conf, true, None)?);
    }
    mounts.push(bind_mount("/etc/hostname", params.hostname_file, true, None)?);

    if !params.rootfs.join("bin/sh").exists() {
        mounts.push(bind_mount("/bin/sh", params.fakesh, true, None)?);
    }

    for mount in params.config.mounts() {
        let source = mount
            .host_path()
            .canonicalize()
            .map_err(|_| ConfigError::InvalidBindMount(mount.host_path().clone()))?;
        mounts.push(bind_mount(
            mount.container_path(),
            &source,
            mount.readonly(),
            Some(mount.propagation().option()),
        )?);
    }
    Ok(mounts)
}

fn bind_mount<D: AsRef<Path>, S: AsRef<Path>>(
    dest: D,
    source: S,
    readonly: bool,
    propagation: Option<&str>,
) -> Result<Mount> {
    let mut options = vec!["rbind".to_string()];
    if let Some(propagation) = propagation {
        options.push(propagation.to_string());
    }
    if readonly {
        options.push("ro".to_string());
    }
    Ok(MountBuilder::default()
        .destination(dest.as_ref())
        .typ("bind".to_string())
        .source(source.as_ref())
        .options(options)
        .build()?)
}

/// Namespaces of a container: an anonymous mount namespace, the pod's UTS
/// namespace, and IPC/network/PID per the container's namespace options.
fn container_namespaces(params: &ContainerSpecParams) -> Result<Vec<LinuxNamespace>> {
    let mut namespaces = vec![anonymous_namespace(LinuxNamespaceType::Mount)];

    if let Some(path) = pod_namespace_path(params.pod_namespaces, NamespaceType::Uts) {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Uts)
                .path(path)
                .build()?,
        );
    } else {
        namespaces.push(anonymous_namespace(LinuxNamespaceType::Uts));
    }

    let options = params
        .config
        .security_context()
        .and_then(|sc| sc.namespace_options().as_ref());
    for ns in [NamespaceType::Ipc, NamespaceType::Net, NamespaceType::Pid].iter() {
        let mode = options
            .map(|opts| match ns {
                NamespaceType::Net => opts.network(),
                NamespaceType::Pid => opts.pid(),
                _ => opts.ipc(),
            })
            .unwrap_or_default();
        match mode {
            NamespaceMode::Container => {
                namespaces.push(anonymous_namespace(oci_namespace_type(*ns)))
            }
            NamespaceMode::Pod => {
                if let Some(path) = pod_namespace_path(params.pod_namespaces, *ns) {
                    namespaces.push(
                        LinuxNamespaceBuilder::default()
                            .typ(oci_namespace_type(*ns))
                            .path(path)
                            .build()?,
                    );
                }
            }
            NamespaceMode::Node => {}
        }
    }
    Ok(namespaces)
}

fn pod_namespace_path(namespaces: &[Namespace], typ: NamespaceType) -> Option<PathBuf> {
    namespaces
        .iter()
        .find(|ns| *ns.typ() == typ)
        .and_then(|ns| ns.path().clone())
}

fn anonymous_namespace(typ: LinuxNamespaceType) -> LinuxNamespace {
    LinuxNamespaceBuilder::default()
        .typ(typ)
        .build()
        .expect("anonymous namespace")
}

fn oci_namespace_type(typ: NamespaceType) -> LinuxNamespaceType {
    match typ {
        NamespaceType::Mount => LinuxNamespaceType::Mount,
        NamespaceType::Uts => LinuxNamespaceType::Uts,
        NamespaceType::Ipc => LinuxNamespaceType::Ipc,
        NamespaceType::User => LinuxNamespaceType::User,
        NamespaceType::Net => LinuxNamespaceType::Network,
        NamespaceType::Pid => LinuxNamespaceType::Pid,
        NamespaceType::Cgroup => LinuxNamespaceType::Cgroup,
    }
}

/// Device nodes plus their cgroup allowlist entries.
fn translate_devices(
    config: &ContainerConfig,
    privileged: bool,
) -> Result<(Vec<LinuxDevice>, Vec<LinuxDeviceCgroup>)> {
    if privileged {
        // Every device access is allowed; the host's /dev arrives through
        // the mount translation.
        let rule = LinuxDeviceCgroupBuilder::default()
            .allow(true)
            .access("rwm")
            .build()?;
        return Ok((Vec::new(), vec![rule]));
    }

    let mut devices = Vec::new();
    let mut rules = Vec::new();
    for device in config.devices() {
        let host_path = device.host_path();
        let stat = stat::stat(host_path)
            .with_context(|| format!("stat device {}", host_path.display()))?;

        let kind = SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits());
        let typ = if kind == SFlag::S_IFBLK {
            "b"
        } else if kind == SFlag::S_IFCHR {
            "c"
        } else {
            return Err(ConfigError::UnsupportedDeviceType(host_path.clone()).into());
        };

        let major = stat::major(stat.st_rdev) as i64;
        let minor = stat::minor(stat.st_rdev) as i64;

        devices.push(
            LinuxDeviceBuilder::default()
                .path(device.container_path())
                .typ(typ.to_string())
                .major(major)
                .minor(minor)
                .file_mode(stat.st_mode & 0o7777)
                .uid(stat.st_uid)
                .gid(stat.st_gid)
                .build()?,
        );
        rules.push(
            LinuxDeviceCgroupBuilder::default()
                .allow(true)
                .typ(typ.to_string())
                .major(major)
                .minor(minor)
                .access(device.permissions().clone())
                .build()?,
        );
    }
    Ok((devices, rules))
}

/// Resource limits; zero valued fields stay unset.
fn translate_resources(
    config: &ContainerConfig,
    device_rules: Vec<LinuxDeviceCgroup>,
) -> Result<Option<LinuxResources>> {
    let resources = config.resources();
    let mut builder = LinuxResourcesBuilder::default();
    let mut any = false;

    if !device_rules.is_empty() {
        builder = builder.devices(device_rules);
        any = true;
    }

    if let Some(res) = resources {
        let mut cpu = LinuxCpuBuilder::default();
        let mut cpu_set = false;
        if !res.cpuset_cpus().is_empty() {
            cpu = cpu.cpus(res.cpuset_cpus().clone());
            cpu_set = true;
        }
        if !res.cpuset_mems().is_empty() {
            cpu = cpu.mems(res.cpuset_mems().clone());
            cpu_set = true;
        }
        if res.cpu_period() != 0 {
            cpu = cpu.period(res.cpu_period() as u64);
            cpu_set = true;
        }
        if res.cpu_quota() != 0 {
            cpu = cpu.quota(res.cpu_quota());
            cpu_set = true;
        }
        if res.cpu_shares() != 0 {
            cpu = cpu.shares(res.cpu_shares() as u64);
            cpu_set = true;
        }
        if cpu_set {
            builder = builder.cpu(cpu.build()?);
            any = true;
        }
        if res.memory_limit_in_bytes() != 0 {
            builder = builder.memory(
                LinuxMemoryBuilder::default()
                    .limit(res.memory_limit_in_bytes())
                    .build()?,
            );
            any = true;
        }
    }

    if any {
        Ok(Some(builder.build()?))
    } else {
        Ok(None)
    }
}

fn load_seccomp(profile: &Path) -> Result<serde_json::Value> {
    let file = File::open(profile)
        .with_context(|| format!("open seccomp profile {}", profile.display()))?;
    serde_json::from_reader(file)
        .with_context(|| format!("decode seccomp profile {}", profile.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        container::config::{
            ContainerConfigBuilder, ContainerLinuxConfigBuilder,
            ContainerSecurityContextBuilder, DeviceConfigBuilder,
            LinuxContainerResourcesBuilder, MountConfigBuilder, MountPropagation,
        },
        pod::config::{
            NamespaceOptionsBuilder, PodConfigBuilder, PodLinuxConfigBuilder,
            PodSecurityContextBuilder,
        },
    };
    use std::fs;
    use tempfile::TempDir;

    fn pod_namespaces(dir: &Path) -> Vec<Namespace> {
        vec![
            Namespace::new(NamespaceType::Uts, Some(dir.join("uts"))),
            Namespace::new(NamespaceType::Net, Some(dir.join("net"))),
            Namespace::new(NamespaceType::Pid, None),
        ]
    }

    struct Fixture {
        _dir: TempDir,
        rootfs: PathBuf,
        hostname_file: PathBuf,
        sync_socket: PathBuf,
        namespaces: Vec<Namespace>,
        pod_config: PodConfig,
    }

    fn fixture() -> Result<Fixture> {
        let dir = TempDir::new()?;
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(rootfs.join("bin"))?;
        fs::write(rootfs.join("bin/sh"), "")?;
        let hostname_file = dir.path().join("hostname");
        fs::write(&hostname_file, "pod-1\n")?;
        Ok(Fixture {
            namespaces: pod_namespaces(dir.path()),
            rootfs,
            hostname_file,
            sync_socket: dir.path().join("sync.sock"),
            pod_config: PodConfigBuilder::default().build()?,
            _dir: dir,
        })
    }

    fn params<'a>(
        fixture: &'a Fixture,
        config: &'a ContainerConfig,
        profiles: &'a SecurityProfiles,
    ) -> ContainerSpecParams<'a> {
        ContainerSpecParams {
            config,
            profiles,
            pod_config: &fixture.pod_config,
            pod_namespaces: &fixture.namespaces,
            hostname_file: &fixture.hostname_file,
            resolv_conf_file: None,
            cgroup_parent: "/singularity/pod1",
            rootfs: &fixture.rootfs,
            image_env: &[],
            fakesh: Path::new("/usr/local/bin/sycri-bin/fakesh"),
            container_id: "c1",
            sync_socket: &fixture.sync_socket,
        }
    }

    #[test]
    fn merge_envs_overrides_image_values() {
        let image = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("LANG".to_string(), "C".to_string()),
        ];
        let config = vec![
            ("LANG".to_string(), "en_US.UTF-8".to_string()),
            ("EXTRA".to_string(), "1".to_string()),
        ];
        assert_eq!(
            merge_envs(&image, &config),
            vec!["PATH=/usr/bin", "LANG=en_US.UTF-8", "EXTRA=1"]
        );
    }

    #[test]
    fn process_args_selection() -> Result<()> {
        let without_command = ContainerConfigBuilder::default()
            .args(vec!["serve".to_string()])
            .build()?;
        assert_eq!(
            process_args(&without_command),
            vec![RUN_SCRIPT.to_string(), "serve".to_string()]
        );

        let with_command = ContainerConfigBuilder::default()
            .command(vec!["/bin/server".to_string()])
            .args(vec!["--port".to_string(), "80".to_string()])
            .build()?;
        assert_eq!(
            process_args(&with_command),
            vec![
                EXEC_SCRIPT.to_string(),
                "/bin/server".to_string(),
                "--port".to_string(),
                "80".to_string()
            ]
        );
        Ok(())
    }

    #[test]
    fn container_spec_basics() -> Result<()> {
        let fixture = fixture()?;
        let config = ContainerConfigBuilder::default().build()?;
        let profiles = config.validate()?;
        let spec = container_spec(&params(&fixture, &config, &profiles))?;

        let root = spec.root().as_ref().expect("root");
        assert_eq!(root.path(), &fixture.rootfs);
        let linux = spec.linux().as_ref().expect("linux");
        assert_eq!(
            linux.cgroups_path().as_deref(),
            Some("/singularity/pod1/c1")
        );

        // UTS from the pod, anonymous mount ns, network and pid from the
        // pod's pins where present.
        let namespaces = linux.namespaces().as_ref().expect("namespaces");
        let uts = namespaces
            .iter()
            .find(|ns| *ns.typ() == LinuxNamespaceType::Uts)
            .expect("uts ns");
        assert!(uts.path().is_some());
        let net = namespaces
            .iter()
            .find(|ns| *ns.typ() == LinuxNamespaceType::Network)
            .expect("net ns");
        assert_eq!(net.path(), &fixture.namespaces[1].path().clone());
        // The pod pid namespace is not bound yet, so it is omitted.
        assert!(namespaces
            .iter()
            .all(|ns| *ns.typ() != LinuxNamespaceType::Pid));

        // /bin/sh exists in the fixture rootfs, no fakesh bind.
        let mounts = spec.mounts().as_ref().expect("mounts");
        assert!(mounts
            .iter()
            .all(|m| m.destination() != &PathBuf::from("/bin/sh")));
        assert!(mounts
            .iter()
            .any(|m| m.destination() == &PathBuf::from("/etc/hostname")));

        // Unprivileged containers get a fresh tmpfs /dev.
        let dev = mounts
            .iter()
            .find(|m| m.destination() == &PathBuf::from("/dev"))
            .expect("dev mount");
        assert_eq!(dev.typ().as_deref(), Some("tmpfs"));

        let annotations = spec.annotations().as_ref().expect("annotations");
        assert_eq!(
            annotations.get(ANNOTATION_SYNC_SOCKET),
            Some(&fixture.sync_socket.display().to_string())
        );
        Ok(())
    }

    #[test]
    fn container_without_shell_gets_fakesh() -> Result<()> {
        let fixture = fixture()?;
        fs::remove_file(fixture.rootfs.join("bin/sh"))?;
        let config = ContainerConfigBuilder::default().build()?;
        let profiles = config.validate()?;
        let spec = container_spec(&params(&fixture, &config, &profiles))?;

        let mounts = spec.mounts().as_ref().expect("mounts");
        let fakesh = mounts
            .iter()
            .find(|m| m.destination() == &PathBuf::from("/bin/sh"))
            .expect("fakesh bind");
        assert_eq!(
            fakesh.source().as_deref(),
            Some(Path::new("/usr/local/bin/sycri-bin/fakesh"))
        );
        Ok(())
    }

    #[test]
    fn user_mount_translation() -> Result<()> {
        let fixture = fixture()?;
        let host_dir = TempDir::new()?;
        let config = ContainerConfigBuilder::default()
            .mounts(vec![MountConfigBuilder::default()
                .container_path("/data")
                .host_path(host_dir.path())
                .readonly(true)
                .propagation(MountPropagation::HostToContainer)
                .build()?])
            .build()?;
        let profiles = config.validate()?;
        let spec = container_spec(&params(&fixture, &config, &profiles))?;

        let mounts = spec.mounts().as_ref().expect("mounts");
        let data = mounts
            .iter()
            .find(|m| m.destination() == &PathBuf::from("/data"))
            .expect("data mount");
        assert_eq!(
            data.options().as_deref(),
            Some(&["rbind".to_string(), "rslave".to_string(), "ro".to_string()][..])
        );
        Ok(())
    }

    #[test]
    fn invalid_bind_source_is_rejected() -> Result<()> {
        let fixture = fixture()?;
        let config = ContainerConfigBuilder::default()
            .mounts(vec![MountConfigBuilder::default()
                .container_path("/data")
                .host_path("/definitely/not/there")
                .build()?])
            .build()?;
        let profiles = config.validate()?;
        let err = container_spec(&params(&fixture, &config, &profiles)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidBindMount(_))
        ));
        Ok(())
    }

    #[test]
    fn resources_skip_zero_values() -> Result<()> {
        let fixture = fixture()?;
        let config = ContainerConfigBuilder::default()
            .linux(
                ContainerLinuxConfigBuilder::default()
                    .resources(
                        LinuxContainerResourcesBuilder::default()
                            .cpu_shares(512i64)
                            .memory_limit_in_bytes(1024i64 * 1024)
                            .build()?,
                    )
                    .build()?,
            )
            .build()?;
        let profiles = config.validate()?;
        let spec = container_spec(&params(&fixture, &config, &profiles))?;

        let resources = spec
            .linux()
            .as_ref()
            .expect("linux")
            .resources()
            .as_ref()
            .expect("resources");
        let cpu = resources.cpu().as_ref().expect("cpu");
        assert_eq!(*cpu.shares(), Some(512));
        assert_eq!(*cpu.period(), None);
        assert_eq!(*cpu.quota(), None);
        assert_eq!(
            resources.memory().as_ref().and_then(|m| *m.limit()),
            Some(1024 * 1024)
        );
        Ok(())
    }

    #[test]
    fn privileged_container_gets_all_caps_host_dev_and_device_rule() -> Result<()> {
        let fixture = fixture()?;
        let config = ContainerConfigBuilder::default()
            .linux(
                ContainerLinuxConfigBuilder::default()
                    .security_context(
                        ContainerSecurityContextBuilder::default()
                            .privileged(true)
                            .build()?,
                    )
                    .build()?,
            )
            .build()?;
        let profiles = config.validate()?;
        let spec = container_spec(&params(&fixture, &config, &profiles))?;

        let caps = spec
            .process()
            .as_ref()
            .expect("process")
            .capabilities()
            .as_ref()
            .expect("capabilities");
        assert_eq!(caps.bounding().as_ref().expect("bounding").len(), 41);

        // The host's /dev is bound instead of a fresh tmpfs.
        let mounts = spec.mounts().as_ref().expect("mounts");
        let dev = mounts
            .iter()
            .find(|m| m.destination() == &PathBuf::from("/dev"))
            .expect("dev mount");
        assert_eq!(dev.typ().as_deref(), Some("bind"));
        assert_eq!(dev.source().as_deref(), Some(Path::new("/dev")));
        assert!(dev
            .options()
            .as_ref()
            .expect("dev options")
            .contains(&"rbind".to_string()));

        let rules = spec
            .linux()
            .as_ref()
            .expect("linux")
            .resources()
            .as_ref()
            .expect("resources")
            .devices()
            .as_ref()
            .expect("device rules");
        assert_eq!(rules.len(), 1);
        assert!(*rules[0].allow());
        assert_eq!(rules[0].access(), "rwm");
        Ok(())
    }

    #[test]
    fn device_translation_from_host_node() -> Result<()> {
        let fixture = fixture()?;
        let config = ContainerConfigBuilder::default()
            .devices(vec![DeviceConfigBuilder::default()
                .container_path("/dev/null")
                .host_path("/dev/null")
                .permissions("rw")
                .build()?])
            .build()?;
        let profiles = config.validate()?;
        let spec = container_spec(&params(&fixture, &config, &profiles))?;

        let devices = spec
            .linux()
            .as_ref()
            .expect("linux")
            .devices()
            .as_ref()
            .expect("devices");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].typ(), "c");
        assert_eq!(*devices[0].major(), 1);
        assert_eq!(*devices[0].minor(), 3);
        Ok(())
    }

    #[test]
    fn unsupported_device_type_is_rejected() -> Result<()> {
        let fixture = fixture()?;
        let plain_file = TempDir::new()?;
        let file = plain_file.path().join("not-a-device");
        fs::write(&file, "")?;
        let config = ContainerConfigBuilder::default()
            .devices(vec![DeviceConfigBuilder::default()
                .container_path("/dev/custom")
                .host_path(file)
                .permissions("r")
                .build()?])
            .build()?;
        let profiles = config.validate()?;
        let err = container_spec(&params(&fixture, &config, &profiles)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnsupportedDeviceType(_))
        ));
        Ok(())
    }

    #[test]
    fn pod_spec_minimal_shape() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sysctls = HashMap::new();
        sysctls.insert("kernel.shmmax".to_string(), "4096".to_string());
        let config = PodConfigBuilder::default()
            .linux(
                PodLinuxConfigBuilder::default()
                    .sysctls(sysctls)
                    .security_context(
                        PodSecurityContextBuilder::default()
                            .namespace_options(NamespaceOptionsBuilder::default().build()?)
                            .run_as_user(1000i64)
                            .build()?,
                    )
                    .build()?,
            )
            .build()?;
        config.validate()?;

        let namespaces = pod_namespaces(dir.path());
        let sync_socket = dir.path().join("sync.sock");
        let spec = pod_spec(&PodSpecParams {
            config: &config,
            namespaces: &namespaces,
            hostname: "pod-host",
            cgroup_parent: "/singularity/pod1",
            sync_socket: &sync_socket,
        })?;

        assert_eq!(spec.hostname().as_deref(), Some("pod-host"));
        let process = spec.process().as_ref().expect("process");
        assert_eq!(process.args().as_deref(), Some(&["true".to_string()][..]));
        assert_eq!(*process.user().uid(), 1000);

        let linux = spec.linux().as_ref().expect("linux");
        assert_eq!(linux.cgroups_path().as_deref(), Some("/singularity/pod1"));
        assert_eq!(
            linux.sysctl().as_ref().and_then(|s| s.get("kernel.shmmax")),
            Some(&"4096".to_string())
        );
        // The unbound pid namespace is carried as anonymous.
        let namespaces = linux.namespaces().as_ref().expect("namespaces");
        let pid = namespaces
            .iter()
            .find(|ns| *ns.typ() == LinuxNamespaceType::Pid)
            .expect("pid ns");
        assert!(pid.path().is_none());

        let annotations = spec.annotations().as_ref().expect("annotations");
        assert_eq!(
            annotations.get(ANNOTATION_RUNTIME_TYPE),
            Some(&RUNTIME_TYPE_POD.to_string())
        );
        assert_eq!(
            annotations.get(ANNOTATION_SYNC_SOCKET),
            Some(&sync_socket.display().to_string())
        );
        Ok(())
    }
}
