//! Readers for per-process cgroup accounting.

use anyhow::{Context, Result};
use getset::CopyGetters;
use std::{
    collections::HashMap,
    fs,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

#[derive(Clone, Copy, CopyGetters, Debug, Default, Eq, PartialEq)]
/// Point-in-time resource accounting of one cgroup.
pub struct CgroupStats {
    /// Total CPU time consumed, in nanoseconds.
    #[get_copy = "pub"]
    cpu_usage_nanos: u64,

    /// Current memory usage, in bytes.
    #[get_copy = "pub"]
    memory_usage_bytes: u64,
}

/// Read CPU and memory accounting of the cgroup `pid` lives in.
pub fn stats(pid: i32) -> Result<CgroupStats> {
    let proc_path = PathBuf::from(format!("/proc/{}/cgroup", pid));
    let file = fs::File::open(&proc_path)
        .with_context(|| format!("open {}", proc_path.display()))?;
    let controllers = controller_paths(file)?;

    Ok(CgroupStats {
        cpu_usage_nanos: read_counter(&controllers, "cpuacct", "cpuacct.usage")?,
        memory_usage_bytes: read_counter(&controllers, "memory", "memory.usage_in_bytes")?,
    })
}

/// Map each controller to its cgroup path from `/proc/<pid>/cgroup` content.
///
/// Lines look like `4:cpu,cpuacct:/singularity/abc`; a controller list may
/// name several controllers at once.
fn controller_paths<R: Read>(reader: R) -> Result<HashMap<String, String>> {
    let mut paths = HashMap::new();
    for line in BufReader::new(reader).lines() {
        let line = line.context("read cgroup line")?;
        let mut fields = line.splitn(3, ':');
        let _hierarchy = fields.next();
        let controllers = match fields.next() {
            Some(controllers) => controllers,
            None => continue,
        };
        let path = match fields.next() {
            Some(path) => path,
            None => continue,
        };
        for controller in controllers.split(',') {
            if !controller.is_empty() {
                paths.insert(controller.into(), path.into());
            }
        }
    }
    Ok(paths)
}

fn read_counter(
    controllers: &HashMap<String, String>,
    controller: &str,
    file: &str,
) -> Result<u64> {
    let cgroup_path = controllers
        .get(controller)
        .with_context(|| format!("no {} cgroup for process", controller))?;
    let path = Path::new(CGROUP_ROOT)
        .join(controller)
        .join(cgroup_path.trim_start_matches('/'))
        .join(file);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read {}", path.display()))?;
    raw.trim()
        .parse()
        .with_context(|| format!("parse counter {}", path.display()))
}
