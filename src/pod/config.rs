//! Pod sandbox configuration and validation.

use crate::{error::ConfigError, namespace::NamespaceType};
use anyhow::Result;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use lazy_static::lazy_static;
use std::{collections::HashMap, path::PathBuf};

lazy_static! {
    /// Sysctl name prefixes and the namespace each requires.
    static ref NAMESPACED_SYSCTLS: Vec<(&'static str, NamespaceType)> = vec![
        ("kernel.shm", NamespaceType::Ipc),
        ("kernel.msg", NamespaceType::Ipc),
        ("kernel.sem", NamespaceType::Ipc),
        ("fs.mqueue.", NamespaceType::Ipc),
        ("net.", NamespaceType::Net),
    ];
}

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Immutable configuration of a pod sandbox.
pub struct PodConfig {
    #[get = "pub"]
    /// Identifying metadata of the pod.
    metadata: PodMetadata,

    #[get = "pub"]
    /// Hostname of the sandbox; empty means the host's name.
    hostname: String,

    #[get = "pub"]
    /// Directory below which container log files are stored.
    log_directory: PathBuf,

    #[get = "pub"]
    /// DNS configuration written into the pod's resolv.conf.
    dns_config: Option<DnsConfig>,

    #[get = "pub"]
    /// Port mappings for the CNI manager; opaque to the lifecycle engine.
    port_mappings: Vec<PortMapping>,

    #[get = "pub"]
    /// Arbitrary labels of the pod.
    labels: HashMap<String, String>,

    #[get = "pub"]
    /// Arbitrary metadata of the pod.
    annotations: HashMap<String, String>,

    #[get = "pub"]
    /// Linux specific configuration.
    linux: Option<PodLinuxConfig>,
}

impl PodConfig {
    /// Validate the configuration.
    ///
    /// Sysctls which need a kernel namespace are only accepted when the pod
    /// allocates its own namespace of that kind.
    pub fn validate(&self) -> Result<()> {
        let linux = match &self.linux {
            Some(linux) => linux,
            None => return Ok(()),
        };
        for name in linux.sysctls().keys() {
            for (prefix, ns) in NAMESPACED_SYSCTLS.iter() {
                if name.starts_with(prefix) && !self.allocates_namespace(*ns) {
                    return Err(ConfigError::SysctlWithoutNamespace {
                        name: name.clone(),
                        ns: ns.proc_file(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// The namespace mode requested for `ns`, defaulting to pod-level.
    pub fn namespace_mode(&self, ns: NamespaceType) -> NamespaceMode {
        self.linux
            .as_ref()
            .and_then(|l| l.security_context().as_ref())
            .and_then(|sc| sc.namespace_options().as_ref())
            .map(|opts| match ns {
                NamespaceType::Net => opts.network(),
                NamespaceType::Pid => opts.pid(),
                NamespaceType::Ipc => opts.ipc(),
                _ => NamespaceMode::Pod,
            })
            .unwrap_or_default()
    }

    /// True when the pod unshares its own namespace of kind `ns`.
    pub fn allocates_namespace(&self, ns: NamespaceType) -> bool {
        match ns {
            NamespaceType::Uts => true,
            NamespaceType::Net | NamespaceType::Pid | NamespaceType::Ipc => {
                self.namespace_mode(ns) == NamespaceMode::Pod
            }
            _ => false,
        }
    }

    /// Sysctls to apply inside the sandbox.
    pub fn sysctls(&self) -> HashMap<String, String> {
        self.linux
            .as_ref()
            .map(|l| l.sysctls().clone())
            .unwrap_or_default()
    }

    pub fn security_context(&self) -> Option<&PodSecurityContext> {
        self.linux
            .as_ref()
            .and_then(|l| l.security_context().as_ref())
    }
}

#[derive(Builder, Clone, Debug, Default, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// Identifying metadata of a pod.
pub struct PodMetadata {
    #[get = "pub"]
    /// Name of the pod.
    name: String,

    #[get = "pub"]
    /// UID of the pod as assigned by the cluster.
    uid: String,

    #[get = "pub"]
    /// Cluster namespace the pod lives in.
    namespace: String,

    #[get_copy = "pub"]
    /// Creation attempt of the pod.
    attempt: u32,
}

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// DNS resolver configuration of a pod.
pub struct DnsConfig {
    #[get = "pub"]
    /// Nameserver addresses, in lookup order.
    servers: Vec<String>,

    #[get = "pub"]
    /// Search domains, in lookup order.
    searches: Vec<String>,

    #[get = "pub"]
    /// Resolver options.
    options: Vec<String>,
}

#[derive(Builder, Clone, Copy, Debug, Default, CopyGetters)]
#[builder(default, pattern = "owned", setter(into))]
/// A single port forwarded into the pod.
pub struct PortMapping {
    #[get_copy = "pub"]
    protocol: Protocol,

    #[get_copy = "pub"]
    container_port: i32,

    #[get_copy = "pub"]
    host_port: i32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Linux specific pod configuration.
pub struct PodLinuxConfig {
    #[get = "pub"]
    /// Parent cgroup of every container in the pod; empty means the
    /// engine's default.
    cgroup_parent: String,

    #[get = "pub"]
    /// Security context of the pod infra process.
    security_context: Option<PodSecurityContext>,

    #[get = "pub"]
    /// Sysctls applied inside the sandbox.
    sysctls: HashMap<String, String>,
}

#[derive(Builder, Clone, Debug, Default, CopyGetters, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Security context of the pod infra process.
pub struct PodSecurityContext {
    #[get = "pub"]
    /// Which namespaces containers of this pod share.
    namespace_options: Option<NamespaceOptions>,

    #[get = "pub"]
    /// SELinux context applied to the infra process.
    selinux_options: Option<SelinuxOptions>,

    #[get = "pub"]
    /// UID the infra process runs as.
    run_as_user: Option<i64>,

    #[get = "pub"]
    /// GID the infra process runs as.
    run_as_group: Option<i64>,

    #[get_copy = "pub"]
    /// Mount the infra rootfs read-only.
    readonly_rootfs: bool,

    #[get_copy = "pub"]
    /// Run the infra process privileged.
    privileged: bool,
}

#[derive(Builder, Clone, Copy, Debug, Default, CopyGetters)]
#[builder(default, pattern = "owned", setter(into))]
/// Namespace sharing requested for a pod or container.
pub struct NamespaceOptions {
    #[get_copy = "pub"]
    network: NamespaceMode,

    #[get_copy = "pub"]
    pid: NamespaceMode,

    #[get_copy = "pub"]
    ipc: NamespaceMode,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Where a namespace is shared.
pub enum NamespaceMode {
    /// Shared among all containers of the pod.
    Pod,
    /// Private to the container.
    Container,
    /// Shared with the host.
    Node,
}

impl Default for NamespaceMode {
    fn default() -> Self {
        NamespaceMode::Pod
    }
}

#[derive(Builder, Clone, Debug, Default, Eq, Getters, PartialEq)]
#[builder(default, pattern = "owned", setter(into))]
/// SELinux context selection.
pub struct SelinuxOptions {
    #[get = "pub"]
    user: String,

    #[get = "pub"]
    role: String,

    #[get = "pub"]
    typ: String,

    #[get = "pub"]
    level: String,
}

impl SelinuxOptions {
    /// True when any component was configured.
    pub fn is_set(&self) -> bool {
        !(self.user.is_empty()
            && self.role.is_empty()
            && self.typ.is_empty()
            && self.level.is_empty())
    }

    /// The `user:role:type:level` label string.
    pub fn label(&self) -> String {
        format!("{}:{}:{}:{}", self.user, self.role, self.typ, self.level)
    }
}
