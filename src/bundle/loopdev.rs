//! Loop device acquisition for image mounts.

use anyhow::{bail, Context, Result};
use getset::{CopyGetters, Getters};
use log::debug;
use std::{
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
    path::PathBuf,
};

/// Upper bound of the free device search. Exceeding it means the host ran
/// out of loop devices; the caller gets the error, there is no retry.
const MAX_LOOP_DEVICES: u32 = 256;

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;

/// Detach the device once its last user unmounts.
const LO_FLAGS_AUTOCLEAR: u32 = 4;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn new(offset: u64, size_limit: u64) -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: offset,
            lo_sizelimit: size_limit,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: LO_FLAGS_AUTOCLEAR,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

#[derive(CopyGetters, Debug, Getters)]
/// A loop device with an attached backing file.
///
/// The device is configured with the auto-clear flag, so it detaches itself
/// once the last mount referencing it goes away.
pub struct LoopDevice {
    /// Path of the device node, for example `/dev/loop3`.
    #[get = "pub"]
    path: PathBuf,

    /// Number of the device.
    #[get_copy = "pub"]
    number: u32,
}

/// Attach `file` to the first free loop device, reading `length` bytes
/// starting at `offset`.
pub fn attach(file: &File, offset: u64, length: u64) -> Result<LoopDevice> {
    let info = LoopInfo64::new(offset, length);

    for number in 0..MAX_LOOP_DEVICES {
        let path = PathBuf::from(format!("/dev/loop{}", number));
        let device = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(device) => device,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!(
                    "no free loop device within {} candidates",
                    MAX_LOOP_DEVICES
                )
            }
            Err(e) => {
                return Err(e).with_context(|| format!("open {}", path.display()));
            }
        };

        // EBUSY means the device is taken, move on to the next one.
        let res = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_FD, file.as_raw_fd()) };
        if res < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EBUSY) {
                continue;
            }
            return Err(errno).with_context(|| format!("attach file to {}", path.display()));
        }

        let res = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_STATUS64, &info) };
        if res < 0 {
            let errno = std::io::Error::last_os_error();
            unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD, 0) };
            return Err(errno).with_context(|| format!("configure {}", path.display()));
        }

        debug!(
            "Attached image to {} (offset {}, length {})",
            path.display(),
            offset,
            length
        );
        return Ok(LoopDevice { path, number });
    }
    bail!("no free loop device within {} candidates", MAX_LOOP_DEVICES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_info_carries_geometry() {
        let info = LoopInfo64::new(4096, 8192);
        assert_eq!(info.lo_offset, 4096);
        assert_eq!(info.lo_sizelimit, 8192);
        assert_eq!(info.lo_flags, LO_FLAGS_AUTOCLEAR);
    }

    #[test]
    fn loop_info_layout_matches_kernel_abi() {
        // The kernel's struct loop_info64 is 232 bytes.
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }
}
