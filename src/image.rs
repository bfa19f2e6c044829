//! Borrowed references into the external image store.

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::warn;
use std::{
    path::PathBuf,
    sync::Mutex,
};

/// A single image record of the external store.
///
/// The store itself (pulling, caching, reference resolution) lives outside of
/// this crate; the lifecycle engine only tracks which containers currently
/// borrow an image so the store will not remove it from under them.
#[derive(Builder, CopyGetters, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
pub struct ImageInfo {
    /// Unique identifier of the image.
    #[get = "pub"]
    id: String,

    /// Path to the image file on the host.
    #[get = "pub"]
    path: PathBuf,

    /// Size of the image file in bytes.
    #[get_copy = "pub"]
    #[builder(default)]
    size: u64,

    /// Environment the image provides to its processes.
    #[get = "pub"]
    #[builder(default)]
    env: Vec<(String, String)>,

    /// Container ids currently borrowing this image.
    #[builder(default, setter(skip))]
    borrowers: Mutex<Vec<String>>,
}

impl ImageInfo {
    /// Record that container `id` uses this image.
    ///
    /// Borrowing twice with the same id is a no-op.
    pub fn borrow(&self, id: &str) {
        let mut borrowers = self.borrowers.lock().expect("poisoned borrowers lock");
        if !borrowers.iter().any(|b| b == id) {
            borrowers.push(id.into());
        }
    }

    /// Return the borrow taken by container `id`.
    pub fn return_borrow(&self, id: &str) {
        let mut borrowers = self.borrowers.lock().expect("poisoned borrowers lock");
        match borrowers.iter().position(|b| b == id) {
            Some(pos) => {
                borrowers.remove(pos);
            }
            None => warn!("Image {} was not borrowed by container {}", self.id, id),
        }
    }

    /// True while any container still borrows this image.
    pub fn used(&self) -> bool {
        !self
            .borrowers
            .lock()
            .expect("poisoned borrowers lock")
            .is_empty()
    }
}
