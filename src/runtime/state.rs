//! State of pods and containers as seen by the OCI runtime.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, str::FromStr};
use strum::{AsRefStr, Display, EnumString};

/// Identifies pod-infra instances in OCI annotations.
pub const ANNOTATION_RUNTIME_TYPE: &str = "io.sylabs.oci.runtime.type";
/// Annotation value of [`ANNOTATION_RUNTIME_TYPE`] marking a pod.
pub const RUNTIME_TYPE_POD: &str = "pod";
/// Carries the sync socket path into the runtime.
pub const ANNOTATION_SYNC_SOCKET: &str = "io.sylabs.oci.runtime.cri-sync-socket";

pub const ANNOTATION_CREATED_AT: &str = "io.sylabs.runtime.oci.created_at";
pub const ANNOTATION_STARTED_AT: &str = "io.sylabs.runtime.oci.starter_at";
pub const ANNOTATION_FINISHED_AT: &str = "io.sylabs.runtime.oci.finished_at";
pub const ANNOTATION_EXIT_CODE: &str = "io.sylabs.runtime.oci.exit-code";
pub const ANNOTATION_EXIT_DESC: &str = "io.sylabs.runtime.oci.exit-desc";
pub const ANNOTATION_ATTACH_SOCKET: &str = "io.sylabs.runtime.oci.attach-socket";
pub const ANNOTATION_CONTROL_SOCKET: &str = "io.sylabs.runtime.oci.control-socket";

#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    PartialEq,
    Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
/// Lifecycle state of an OCI instance.
///
/// The wire protocol says `stopped`; internally an instance which reached
/// that state is `Exited` and never transitions again.
pub enum State {
    Unknown,
    Creating,
    Created,
    Running,
    #[strum(serialize = "stopped")]
    #[serde(rename = "stopped")]
    Exited,
}

impl Default for State {
    fn default() -> Self {
        State::Unknown
    }
}

impl State {
    /// Map a wire status string, unknown values degrade to `Unknown`.
    pub fn from_wire(status: &str) -> Self {
        Self::from_str(status).unwrap_or(State::Unknown)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
/// Snapshot of `singularity oci state` output for a single instance.
pub struct OciState {
    pub oci_version: String,
    pub id: String,
    pub status: String,
    pub pid: Option<i32>,
    pub bundle: PathBuf,
    pub annotations: HashMap<String, String>,
}

impl OciState {
    /// The runtime state encoded in the status field.
    pub fn state(&self) -> State {
        State::from_wire(&self.status)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    fn annotation_i64(&self, key: &str) -> Option<i64> {
        self.annotation(key).and_then(|v| v.parse().ok())
    }

    /// Unix nano timestamp of instance creation.
    pub fn created_at(&self) -> Option<i64> {
        self.annotation_i64(ANNOTATION_CREATED_AT)
    }

    /// Unix nano timestamp of process start.
    pub fn started_at(&self) -> Option<i64> {
        self.annotation_i64(ANNOTATION_STARTED_AT)
    }

    /// Unix nano timestamp of process exit.
    pub fn finished_at(&self) -> Option<i64> {
        self.annotation_i64(ANNOTATION_FINISHED_AT)
    }

    /// Exit code of the instance, if it exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.annotation(ANNOTATION_EXIT_CODE)
            .and_then(|v| v.parse().ok())
    }

    /// Human readable exit description, if any.
    pub fn exit_desc(&self) -> Option<&str> {
        self.annotation(ANNOTATION_EXIT_DESC)
    }

    /// Socket for attaching to the instance's streams.
    pub fn attach_socket(&self) -> Option<&str> {
        self.annotation(ANNOTATION_ATTACH_SOCKET)
    }

    /// Socket accepting runtime control requests such as log reopening.
    pub fn control_socket(&self) -> Option<&str> {
        self.annotation(ANNOTATION_CONTROL_SOCKET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_mapping() {
        assert_eq!(State::from_wire("creating"), State::Creating);
        assert_eq!(State::from_wire("created"), State::Created);
        assert_eq!(State::from_wire("running"), State::Running);
        assert_eq!(State::from_wire("stopped"), State::Exited);
        assert_eq!(State::from_wire("paused"), State::Unknown);
        assert_eq!(State::Exited.to_string(), "stopped");
    }

    #[test]
    fn snapshot_annotations() {
        let json = r#"{
            "ociVersion": "1.0.0",
            "id": "abc",
            "status": "stopped",
            "pid": 1234,
            "bundle": "/var/run/bundle",
            "annotations": {
                "io.sylabs.runtime.oci.exit-code": "3",
                "io.sylabs.runtime.oci.exit-desc": "oom killed",
                "io.sylabs.runtime.oci.created_at": "1600000000000000000",
                "io.sylabs.runtime.oci.attach-socket": "/var/run/attach.sock"
            }
        }"#;
        let state: OciState = serde_json::from_str(json).expect("decode state");
        assert_eq!(state.state(), State::Exited);
        assert_eq!(state.pid, Some(1234));
        assert_eq!(state.exit_code(), Some(3));
        assert_eq!(state.exit_desc(), Some("oom killed"));
        assert_eq!(state.created_at(), Some(1_600_000_000_000_000_000));
        assert_eq!(state.finished_at(), None);
        assert_eq!(state.attach_socket(), Some("/var/run/attach.sock"));
    }
}
