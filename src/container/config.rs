//! Container configuration and validation.

use crate::{
    capability::{self, Capability},
    error::ConfigError,
    pod::config::{NamespaceOptions, SelinuxOptions},
};
use anyhow::Result;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use std::{collections::HashMap, path::PathBuf};

const PROFILE_RUNTIME_DEFAULT: &str = "runtime/default";
const PROFILE_DOCKER_DEFAULT: &str = "docker/default";
const PROFILE_UNCONFINED: &str = "unconfined";
const PROFILE_LOCALHOST_PREFIX: &str = "localhost/";

#[derive(Builder, Clone, Debug, Default, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Immutable configuration of a container.
pub struct ContainerConfig {
    #[get = "pub"]
    /// Identifying metadata of the container.
    metadata: ContainerMetadata,

    #[get = "pub"]
    /// Reference to the image the container runs.
    image: String,

    #[get = "pub"]
    /// Explicit entrypoint; empty means the image's run action.
    command: Vec<String>,

    #[get = "pub"]
    /// Arguments to the entrypoint.
    args: Vec<String>,

    #[get = "pub"]
    /// Working directory of the process.
    working_dir: String,

    #[get = "pub"]
    /// Environment variables; override image-provided values.
    envs: Vec<(String, String)>,

    #[get = "pub"]
    /// Volumes to bind into the container.
    mounts: Vec<MountConfig>,

    #[get = "pub"]
    /// Host devices exposed to the container.
    devices: Vec<DeviceConfig>,

    #[get = "pub"]
    /// Arbitrary labels of the container.
    labels: HashMap<String, String>,

    #[get = "pub"]
    /// Arbitrary metadata of the container.
    annotations: HashMap<String, String>,

    #[get = "pub"]
    /// Log file path relative to the pod's log directory.
    log_path: PathBuf,

    #[get_copy = "pub"]
    /// Keep stdin open.
    stdin: bool,

    #[get_copy = "pub"]
    /// Close stdin after the first attach session.
    stdin_once: bool,

    #[get_copy = "pub"]
    /// Allocate a tty for the process.
    tty: bool,

    #[get = "pub"]
    /// Linux specific configuration.
    linux: Option<ContainerLinuxConfig>,
}

impl ContainerConfig {
    /// Validate the configuration and normalise its security profiles.
    pub fn validate(&self) -> Result<SecurityProfiles> {
        let security = self
            .linux
            .as_ref()
            .and_then(|l| l.security_context().as_ref());

        let selinux_set = security
            .and_then(|sc| sc.selinux_options().as_ref())
            .map(SelinuxOptions::is_set)
            .unwrap_or(false);
        let apparmor_raw = security
            .map(|sc| sc.apparmor_profile().as_str())
            .unwrap_or_default();
        if selinux_set && !apparmor_raw.is_empty() {
            return Err(ConfigError::ApparmorConflictsSelinux.into());
        }

        let seccomp_raw = security
            .map(|sc| sc.seccomp_profile_path().as_str())
            .unwrap_or_default();

        let (caps_add, caps_drop) = match security.and_then(|sc| sc.capabilities().as_ref()) {
            Some(caps) => (
                capability::normalize(caps.add()),
                capability::normalize(caps.drop()),
            ),
            None => (Vec::new(), Vec::new()),
        };

        Ok(SecurityProfiles {
            apparmor: normalize_apparmor(apparmor_raw),
            seccomp: normalize_seccomp(seccomp_raw)?,
            caps_add,
            caps_drop,
        })
    }

    pub fn security_context(&self) -> Option<&ContainerSecurityContext> {
        self.linux
            .as_ref()
            .and_then(|l| l.security_context().as_ref())
    }

    pub fn resources(&self) -> Option<&LinuxContainerResources> {
        self.linux.as_ref().and_then(|l| l.resources().as_ref())
    }

    pub fn privileged(&self) -> bool {
        self.security_context()
            .map(|sc| sc.privileged())
            .unwrap_or(false)
    }
}

/// The normalised security configuration of a container.
#[derive(Clone, Debug, Default, Getters)]
pub struct SecurityProfiles {
    /// AppArmor profile name; `None` leaves the runtime's default in place.
    #[get = "pub"]
    pub(crate) apparmor: Option<String>,

    /// Normalised seccomp selection.
    #[get = "pub"]
    pub(crate) seccomp: SeccompProfile,

    #[get = "pub"]
    pub(crate) caps_add: Vec<Capability>,

    #[get = "pub"]
    pub(crate) caps_drop: Vec<Capability>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
/// Seccomp profile selection after normalisation.
pub enum SeccompProfile {
    /// No seccomp filtering.
    Unconfined,
    /// Whatever the runtime applies by default.
    RuntimeDefault,
    /// A profile file below the localhost profile root.
    Localhost(PathBuf),
}

impl Default for SeccompProfile {
    fn default() -> Self {
        SeccompProfile::Unconfined
    }
}

/// Normalise an AppArmor profile reference.
fn normalize_apparmor(profile: &str) -> Option<String> {
    if profile.is_empty() || profile == PROFILE_RUNTIME_DEFAULT {
        return None;
    }
    Some(
        profile
            .strip_prefix(PROFILE_LOCALHOST_PREFIX)
            .unwrap_or(profile)
            .to_string(),
    )
}

/// Normalise a seccomp profile reference.
fn normalize_seccomp(profile: &str) -> Result<SeccompProfile> {
    match profile {
        "" | PROFILE_UNCONFINED => Ok(SeccompProfile::Unconfined),
        PROFILE_RUNTIME_DEFAULT | PROFILE_DOCKER_DEFAULT => Ok(SeccompProfile::RuntimeDefault),
        path => match path.strip_prefix(PROFILE_LOCALHOST_PREFIX) {
            Some(stripped) => Ok(SeccompProfile::Localhost(PathBuf::from(stripped))),
            None => Err(ConfigError::InvalidSeccompProfile(path.into()).into()),
        },
    }
}

#[derive(Builder, Clone, Debug, Default, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// Identifying metadata of a container.
pub struct ContainerMetadata {
    #[get = "pub"]
    /// Name of the container.
    name: String,

    #[get_copy = "pub"]
    /// Creation attempt of the container.
    attempt: u32,
}

#[derive(Builder, Clone, Debug, Default, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// A volume bound into a container.
pub struct MountConfig {
    #[get = "pub"]
    /// Path inside the container.
    container_path: PathBuf,

    #[get = "pub"]
    /// Path on the host.
    host_path: PathBuf,

    #[get_copy = "pub"]
    /// Mount read-only.
    readonly: bool,

    #[get_copy = "pub"]
    /// Requested mount propagation.
    propagation: MountPropagation,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Propagation of a bind mount.
pub enum MountPropagation {
    Private,
    HostToContainer,
    Bidirectional,
}

impl MountPropagation {
    /// The OCI mount option implementing this propagation.
    pub fn option(self) -> &'static str {
        match self {
            MountPropagation::Private => "rprivate",
            MountPropagation::HostToContainer => "rslave",
            MountPropagation::Bidirectional => "rshared",
        }
    }
}

impl Default for MountPropagation {
    fn default() -> Self {
        MountPropagation::Private
    }
}

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// A host device exposed to a container.
pub struct DeviceConfig {
    #[get = "pub"]
    /// Path of the device inside the container.
    container_path: PathBuf,

    #[get = "pub"]
    /// Path of the device on the host.
    host_path: PathBuf,

    #[get = "pub"]
    /// Cgroup access permissions, a combination of `r`, `w` and `m`.
    permissions: String,
}

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Linux specific container configuration.
pub struct ContainerLinuxConfig {
    #[get = "pub"]
    /// Resource limits of the container.
    resources: Option<LinuxContainerResources>,

    #[get = "pub"]
    /// Security context of the container process.
    security_context: Option<ContainerSecurityContext>,
}

#[derive(Builder, Clone, Debug, Default, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// Resource limits of a container; zero values mean unset.
pub struct LinuxContainerResources {
    #[get_copy = "pub"]
    cpu_period: i64,

    #[get_copy = "pub"]
    cpu_quota: i64,

    #[get_copy = "pub"]
    cpu_shares: i64,

    #[get_copy = "pub"]
    memory_limit_in_bytes: i64,

    #[get_copy = "pub"]
    oom_score_adj: i64,

    #[get = "pub"]
    cpuset_cpus: String,

    #[get = "pub"]
    cpuset_mems: String,
}

#[derive(Builder, Clone, Debug, Default, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Security context of a container process.
pub struct ContainerSecurityContext {
    #[get = "pub"]
    /// Capabilities to add and drop.
    capabilities: Option<CapabilityConfig>,

    #[get_copy = "pub"]
    /// Run the process privileged.
    privileged: bool,

    #[get = "pub"]
    /// Which namespaces the container shares.
    namespace_options: Option<NamespaceOptions>,

    #[get = "pub"]
    /// SELinux context applied to the process and its mounts.
    selinux_options: Option<SelinuxOptions>,

    #[get = "pub"]
    /// UID the process runs as.
    run_as_user: Option<i64>,

    #[get = "pub"]
    /// GID the process runs as.
    run_as_group: Option<i64>,

    #[get = "pub"]
    /// User name resolved against the image's passwd file.
    run_as_username: String,

    #[get_copy = "pub"]
    /// Mount the container rootfs read-only.
    readonly_rootfs: bool,

    #[get = "pub"]
    /// Supplementary groups of the process.
    supplemental_groups: Vec<i64>,

    #[get = "pub"]
    /// AppArmor profile reference.
    apparmor_profile: String,

    #[get = "pub"]
    /// Seccomp profile reference.
    seccomp_profile_path: String,

    #[get_copy = "pub"]
    /// Prevent the process from gaining additional privileges.
    no_new_privs: bool,
}

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// Capabilities to add to and drop from the default set.
pub struct CapabilityConfig {
    #[get = "pub"]
    add: Vec<String>,

    #[get = "pub"]
    drop: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_security(sc: ContainerSecurityContext) -> Result<ContainerConfig> {
        Ok(ContainerConfigBuilder::default()
            .linux(
                ContainerLinuxConfigBuilder::default()
                    .security_context(sc)
                    .build()?,
            )
            .build()?)
    }

    #[test]
    fn apparmor_and_selinux_conflict() -> Result<()> {
        let config = config_with_security(
            ContainerSecurityContextBuilder::default()
                .apparmor_profile("localhost/custom")
                .selinux_options(
                    crate::pod::config::SelinuxOptionsBuilder::default()
                        .level("s0")
                        .build()?,
                )
                .build()?,
        )?;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ApparmorConflictsSelinux)
        ));
        Ok(())
    }

    #[test]
    fn apparmor_normalisation() -> Result<()> {
        assert_eq!(normalize_apparmor(""), None);
        assert_eq!(normalize_apparmor("runtime/default"), None);
        assert_eq!(
            normalize_apparmor("localhost/my-profile"),
            Some("my-profile".into())
        );
        assert_eq!(normalize_apparmor("plain"), Some("plain".into()));
        Ok(())
    }

    #[test]
    fn seccomp_normalisation() -> Result<()> {
        assert_eq!(normalize_seccomp("")?, SeccompProfile::Unconfined);
        assert_eq!(normalize_seccomp("unconfined")?, SeccompProfile::Unconfined);
        assert_eq!(
            normalize_seccomp("runtime/default")?,
            SeccompProfile::RuntimeDefault
        );
        assert_eq!(
            normalize_seccomp("docker/default")?,
            SeccompProfile::RuntimeDefault
        );
        assert_eq!(
            normalize_seccomp("localhost/profiles/audit.json")?,
            SeccompProfile::Localhost("profiles/audit.json".into())
        );

        let err = normalize_seccomp("/absolute/path.json").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidSeccompProfile(_))
        ));
        Ok(())
    }

    #[test]
    fn capability_normalisation_in_validate() -> Result<()> {
        let config = config_with_security(
            ContainerSecurityContextBuilder::default()
                .capabilities(
                    CapabilityConfigBuilder::default()
                        .add(vec!["SYS_ADMIN".to_string(), "BOGUS_CAP".to_string()])
                        .drop(vec!["CAP_CHOWN".to_string()])
                        .build()?,
                )
                .build()?,
        )?;
        let profiles = config.validate()?;
        assert_eq!(profiles.caps_add, vec![Capability::CapSysAdmin]);
        assert_eq!(profiles.caps_drop, vec![Capability::CapChown]);
        assert_eq!(profiles.apparmor, None);
        assert_eq!(profiles.seccomp, SeccompProfile::Unconfined);
        Ok(())
    }
}
