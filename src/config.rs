//! Configuration related structures.

use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Builder, CopyGetters, Deserialize, Getters, Parser, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
#[clap(about = "sycri - Singularity pod and container lifecycle engine")]
/// Runtime configuration of the lifecycle engine.
pub struct Config {
    #[get_copy = "pub"]
    #[clap(
        default_value("info"),
        env("SYCRI_LOG_LEVEL"),
        long("log-level"),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the application
    log_level: LevelFilter,

    #[get = "pub"]
    #[clap(
        default_value("singularity"),
        env("SYCRI_SINGULARITY"),
        long("singularity"),
        value_name("PATH")
    )]
    /// Name or path of the Singularity OCI runtime binary
    singularity: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("/var/run/singularity/pods"),
        env("SYCRI_POD_BASE_DIR"),
        long("pod-base-dir"),
        value_name("DIR")
    )]
    /// Directory holding per-pod state
    pod_base_dir: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("/var/lib/singularity/sycri/containers"),
        env("SYCRI_CONTAINER_BASE_DIR"),
        long("container-base-dir"),
        value_name("DIR")
    )]
    /// Directory holding per-container state
    container_base_dir: PathBuf,

    #[get = "pub"]
    #[clap(env("SYCRI_TRASH_DIR"), long("trash-dir"), value_name("DIR"))]
    /// Archive the last OCI config and logs of removed containers here
    trash_dir: Option<PathBuf>,

    #[get = "pub"]
    #[clap(
        default_value("/usr/local/bin/sycri-bin/fakesh"),
        env("SYCRI_FAKESH"),
        long("fakesh"),
        value_name("PATH")
    )]
    /// Shell bound into containers whose rootfs lacks /bin/sh
    fakesh: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value("/singularity"),
        env("SYCRI_CGROUP_PARENT"),
        long("cgroup-parent"),
        value_name("PATH")
    )]
    /// Default cgroup parent for pods which do not specify one
    default_cgroup_parent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            singularity: PathBuf::from("singularity"),
            pod_base_dir: PathBuf::from("/var/run/singularity/pods"),
            container_base_dir: PathBuf::from("/var/lib/singularity/sycri/containers"),
            trash_dir: None,
            fakesh: PathBuf::from("/usr/local/bin/sycri-bin/fakesh"),
            default_cgroup_parent: String::from("/singularity"),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn default_config() {
        let c = Config::default();
        assert_eq!(c.log_level(), LevelFilter::Info);
        assert_eq!(
            c.pod_base_dir(),
            &PathBuf::from("/var/run/singularity/pods")
        );
        assert!(c.trash_dir().is_none());
    }

    #[test]
    fn build_config() -> Result<()> {
        let c = ConfigBuilder::default()
            .log_level(LevelFilter::Warn)
            .trash_dir(Some(PathBuf::from("/tmp/trash")))
            .build()?;

        assert_eq!(c.log_level(), LevelFilter::Warn);
        assert_eq!(c.trash_dir().as_deref(), Some(std::path::Path::new("/tmp/trash")));
        Ok(())
    }
}
