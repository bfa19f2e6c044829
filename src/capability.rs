//! Linux capability handling.

use log::warn;
use std::{collections::BTreeSet, ops::Deref, str::FromStr};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// An ordered set of capabilities.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    /// Every capability the kernel knows.
    pub fn all() -> Self {
        Self(Capability::iter().collect())
    }

    /// The default capability set granted to unprivileged containers.
    pub fn default_set() -> Self {
        Self(
            [
                Capability::CapAuditWrite,
                Capability::CapChown,
                Capability::CapDacOverride,
                Capability::CapFowner,
                Capability::CapFsetid,
                Capability::CapKill,
                Capability::CapMknod,
                Capability::CapNetBindService,
                Capability::CapNetRaw,
                Capability::CapSetfcap,
                Capability::CapSetgid,
                Capability::CapSetpcap,
                Capability::CapSetuid,
                Capability::CapSysChroot,
            ]
            .iter()
            .copied()
            .collect(),
        )
    }

    /// Apply `add` and `drop` on top of this set, in that order.
    pub fn apply(&self, add: &[Capability], drop: &[Capability]) -> Self {
        let mut set = self.0.clone();
        set.extend(add.iter().copied());
        for cap in drop {
            set.remove(cap);
        }
        Self(set)
    }

    /// Canonical `CAP_*` names, suitable for an OCI spec.
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}

impl Deref for Capabilities {
    type Target = BTreeSet<Capability>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::iter::FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Normalise a list of user-provided capability names.
///
/// Both `SYS_ADMIN` and `CAP_SYS_ADMIN` spellings are accepted; unknown
/// capabilities are dropped with a warning.
pub fn normalize(caps: &[String]) -> Vec<Capability> {
    caps.iter()
        .filter_map(|name| match Capability::parse(name) {
            Some(cap) => Some(cap),
            None => {
                warn!("Dropping unknown capability {:?}", name);
                None
            }
        })
        .collect()
}

#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    IntoStaticStr,
    Ord,
    PartialEq,
    PartialOrd,
)]
#[strum(serialize_all = "shouty_snake_case")]
/// All capabilities of the Linux kernel up to 5.9.
pub enum Capability {
    CapAuditControl,
    CapAuditRead,
    CapAuditWrite,
    CapBlockSuspend,
    CapBpf,
    CapCheckpointRestore,
    CapChown,
    CapDacOverride,
    CapDacReadSearch,
    CapFowner,
    CapFsetid,
    CapIpcLock,
    CapIpcOwner,
    CapKill,
    CapLease,
    CapLinuxImmutable,
    CapMacAdmin,
    CapMacOverride,
    CapMknod,
    CapNetAdmin,
    CapNetBindService,
    CapNetBroadcast,
    CapNetRaw,
    CapPerfmon,
    CapSetfcap,
    CapSetgid,
    CapSetpcap,
    CapSetuid,
    CapSysAdmin,
    CapSysBoot,
    CapSysChroot,
    CapSysModule,
    CapSysNice,
    CapSysPacct,
    CapSysPtrace,
    CapSysRawio,
    CapSysResource,
    CapSysTime,
    CapSysTtyConfig,
    CapSyslog,
    CapWakeAlarm,
}

impl Capability {
    /// Parse a capability name with or without the `CAP_` prefix.
    pub fn parse(name: &str) -> Option<Self> {
        let upper = name.to_uppercase();
        let canonical = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{}", upper)
        };
        Self::from_str(&canonical).ok()
    }
}
