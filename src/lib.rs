//! sycri - a pod and container lifecycle engine for the Singularity OCI
//! runtime.
//!
//! The crate translates pod and container lifecycle operations into OCI
//! bundles plus invocations of the `singularity` binary, and owns every
//! host-side resource that falls out of that: filesystem bundles, overlay
//! mounts, loop devices, pinned namespaces, sync sockets and log files.
//! The gRPC façade, image pulling and CNI plumbing live outside of this
//! crate and consume it as a library.

pub mod bundle;
pub mod capability;
pub mod cgroup;
pub mod config;
pub mod container;
pub mod error;
pub mod fs;
pub mod image;
pub mod index;
pub mod namespace;
pub mod oci_spec;
pub mod pod;
pub mod runtime;
pub mod sync;

pub use config::Config;
pub use container::{Container, ContainerConfig, ContainerState};
pub use image::ImageInfo;
pub use index::TruncIndex;
pub use pod::{Pod, PodConfig};
pub use runtime::RuntimeClient;
