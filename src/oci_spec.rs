//! OCI runtime spec subset emitted into bundle `config.json` files.

use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};
use strum::{AsRefStr, Display};

pub const OCI_VERSION: &str = "1.0.0";

#[derive(Builder, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Spec is the base configuration for the container.
pub struct Spec {
    #[getset(get = "pub")]
    #[serde(rename = "ociVersion")]
    /// Version of the OCI runtime specification the bundle complies with.
    version: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Process configures the container process.
    process: Option<Process>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Root configures the container's root filesystem.
    root: Option<Root>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Hostname configures the container's hostname.
    hostname: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Mounts configures additional mounts (on top of Root).
    mounts: Option<Vec<Mount>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Annotations contains arbitrary metadata for the container.
    annotations: Option<HashMap<String, String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Linux is platform-specific configuration for Linux based containers.
    linux: Option<Linux>,
}

impl Spec {
    /// Load a spec from the provided file `Path`.
    pub fn from(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open file {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("deserialize OCI spec from file {}", path.display()))
    }

    /// Save the spec into the provided file `Path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file =
            File::create(path).with_context(|| format!("create file {}", path.display()))?;
        serde_json::to_writer(&mut file, self)
            .with_context(|| format!("serialize OCI spec to file {}", path.display()))
    }
}

#[derive(Builder, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
/// Process contains the application to start inside the container.
pub struct Process {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Terminal creates an interactive terminal for the container.
    terminal: Option<bool>,

    #[getset(get = "pub")]
    /// User specifies user information for the process.
    user: User,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Args specifies the binary and arguments for the application.
    args: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Env populates the process environment.
    env: Option<Vec<String>>,

    #[getset(get = "pub")]
    /// Cwd is the working directory relative to the container root.
    cwd: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Capabilities are Linux capabilities available to the process.
    capabilities: Option<LinuxCapabilities>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// NoNewPrivileges prevents gaining additional privileges.
    no_new_privileges: Option<bool>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// ApparmorProfile is the name of the profile the process runs under.
    apparmor_profile: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// OOMScoreAdj adjusts the kernel's out-of-memory killer score.
    oom_score_adj: Option<i64>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// SelinuxLabel is the SELinux context of the process.
    selinux_label: Option<String>,
}

#[derive(Builder, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
/// User identity the process runs as.
pub struct User {
    #[getset(get = "pub")]
    /// UID is the user id in the container namespace.
    uid: u32,

    #[getset(get = "pub")]
    /// GID is the group id in the container namespace.
    gid: u32,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// AdditionalGids are supplementary group ids.
    additional_gids: Option<Vec<u32>>,
}

#[derive(Builder, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Root contains information about the container's root filesystem.
pub struct Root {
    #[getset(get = "pub")]
    /// Path is the absolute path to the root filesystem.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Readonly makes the root filesystem immutable.
    readonly: Option<bool>,
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Mount specifies a mount for a container.
pub struct Mount {
    #[getset(get = "pub")]
    /// Destination of the mount inside the container.
    destination: PathBuf,

    #[getset(get = "pub")]
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    /// Type of the filesystem to mount.
    typ: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Source of the mount on the host.
    source: Option<PathBuf>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Options of the mount.
    options: Option<Vec<String>>,
}

#[derive(Builder, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
/// Linux platform-specific configuration.
pub struct Linux {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Sysctl contains kernel parameters to set in the container.
    sysctl: Option<HashMap<String, String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Resources contains the container's resource constraints.
    resources: Option<LinuxResources>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// CgroupsPath specifies the path to the container's cgroup.
    cgroups_path: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Namespaces contains the container's namespaces.
    namespaces: Option<Vec<LinuxNamespace>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Devices lists device nodes available in the container.
    devices: Option<Vec<LinuxDevice>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Seccomp specifies the seccomp syscall restrictions.
    seccomp: Option<serde_json::Value>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// MountLabel is the SELinux context applied to the mounts.
    mount_label: Option<String>,
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxNamespace is the configuration for a single namespace.
pub struct LinuxNamespace {
    #[getset(get = "pub")]
    #[serde(rename = "type")]
    /// Type of the namespace.
    typ: LinuxNamespaceType,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Path of an existing namespace to join; empty for a fresh one.
    path: Option<PathBuf>,
}

#[derive(
    AsRefStr, Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
/// Namespace kinds of the OCI runtime spec.
pub enum LinuxNamespaceType {
    Mount,
    Uts,
    Ipc,
    User,
    Network,
    Pid,
    Cgroup,
}

impl Default for LinuxNamespaceType {
    fn default() -> Self {
        LinuxNamespaceType::Mount
    }
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
/// LinuxResources are the container's resource constraints.
pub struct LinuxResources {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Devices configures the device allowlist.
    devices: Option<Vec<LinuxDeviceCgroup>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Memory restricts memory usage.
    memory: Option<LinuxMemory>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// CPU restricts processor usage.
    cpu: Option<LinuxCpu>,
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxMemory restricts the memory usage of a container.
pub struct LinuxMemory {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Limit of memory usage in bytes.
    limit: Option<i64>,
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxCpu restricts the processor usage of a container.
pub struct LinuxCpu {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Shares is a relative weight versus other containers.
    shares: Option<u64>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Quota of CPU time in a period, in microseconds.
    quota: Option<i64>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Period of CPU time measurement, in microseconds.
    period: Option<u64>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Cpus the container may run on.
    cpus: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Mems are the memory nodes the container may use.
    mems: Option<String>,
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
/// LinuxDevice is a device node to create inside the container.
pub struct LinuxDevice {
    #[getset(get = "pub")]
    /// Path of the device inside the container.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(rename = "type")]
    /// Type of the device: `b` (block) or `c` (character).
    typ: String,

    #[getset(get = "pub")]
    /// Major device number.
    major: i64,

    #[getset(get = "pub")]
    /// Minor device number.
    minor: i64,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// FileMode permission bits of the device node.
    file_mode: Option<u32>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// UID of the device node.
    uid: Option<u32>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// GID of the device node.
    gid: Option<u32>,
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxDeviceCgroup is an entry of the device cgroup allowlist.
pub struct LinuxDeviceCgroup {
    #[getset(get = "pub")]
    /// Allow or deny the matching devices.
    allow: bool,

    #[getset(get = "pub")]
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    /// Type of the device: `b`, `c` or `a` (all).
    typ: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Major device number; unset matches all.
    major: Option<i64>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Minor device number; unset matches all.
    minor: Option<i64>,

    #[getset(get = "pub")]
    /// Access is a combination of `r`, `w` and `m`.
    access: String,
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, PartialEq, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxCapabilities describes the five capability sets of a process.
pub struct LinuxCapabilities {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bounding: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    effective: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inheritable: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    permitted: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ambient: Option<Vec<String>>,
}

impl LinuxCapabilities {
    /// The same capability names applied to all five sets.
    pub fn from_names(names: Vec<String>) -> Self {
        Self {
            bounding: Some(names.clone()),
            effective: Some(names.clone()),
            inheritable: Some(names.clone()),
            permitted: Some(names.clone()),
            ambient: Some(names),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn spec_round_trip_through_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.json");

        let spec = SpecBuilder::default()
            .version(OCI_VERSION)
            .root(RootBuilder::default().path("/bundle/rootfs").build()?)
            .hostname("pod-1")
            .build()?;
        spec.save(&path)?;

        let loaded = Spec::from(&path)?;
        assert_eq!(loaded, spec);
        assert_eq!(loaded.hostname().as_deref(), Some("pod-1"));
        Ok(())
    }

    #[test]
    fn optional_fields_are_omitted() -> Result<()> {
        let spec = SpecBuilder::default().version(OCI_VERSION).build()?;
        let json = serde_json::to_string(&spec)?;
        assert_eq!(json, r#"{"ociVersion":"1.0.0"}"#);
        Ok(())
    }

    #[test]
    fn namespace_type_serialization() -> Result<()> {
        let ns = LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Network)
            .path("/var/run/netns/ns1")
            .build()?;
        let json = serde_json::to_string(&ns)?;
        assert_eq!(json, r#"{"type":"network","path":"/var/run/netns/ns1"}"#);
        Ok(())
    }

    #[test]
    fn capabilities_cover_all_sets() {
        let caps = LinuxCapabilities::from_names(vec!["CAP_CHOWN".into()]);
        for set in [
            caps.bounding(),
            caps.effective(),
            caps.inheritable(),
            caps.permitted(),
            caps.ambient(),
        ]
        .iter()
        {
            assert_eq!(set.as_deref(), Some(&["CAP_CHOWN".to_string()][..]));
        }
    }
}
