//! Reader for the primary partition descriptor of a single-file image.
//!
//! Only the fields needed to loop-mount the image's root filesystem are
//! decoded: the global header is checked for the magic, the descriptor
//! table is scanned for the primary system partition, and its offset, size
//! and filesystem type are returned. Everything else in the image stays
//! opaque.

use crate::error::ConfigError;
use anyhow::{bail, Context, Result};
use getset::CopyGetters;
use std::{
    convert::TryInto,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

const LAUNCH_LEN: usize = 32;
const MAGIC: &[u8] = b"SIF_MAGIC";
const MAGIC_LEN: usize = 10;
const VERSION_LEN: usize = 3;
const ARCH_LEN: usize = 3;
const UUID_LEN: usize = 16;

/// Size of the packed global header.
const HEADER_LEN: usize = LAUNCH_LEN + MAGIC_LEN + VERSION_LEN + ARCH_LEN + UUID_LEN + 8 * 8;

/// Size of one packed descriptor.
const DESCRIPTOR_LEN: usize = 4 + 1 + 3 * 4 + 3 * 8 + 4 * 8 + DESCR_NAME_LEN + DESCR_EXTRA_LEN;
const DESCR_NAME_LEN: usize = 128;
const DESCR_EXTRA_LEN: usize = 384;

/// Data object type of a filesystem partition.
const DATA_PARTITION: i32 = 0x4004;

/// Partition type of the primary system partition.
const PART_PRIMSYS: i32 = 2;

/// Known partition filesystem types.
const FS_SQUASH: i32 = 1;
const FS_EXT3: i32 = 2;
const FS_IMMUTABLE_OBJ: i32 = 3;
const FS_RAW: i32 = 4;

#[derive(Clone, Copy, CopyGetters, Debug, Eq, PartialEq)]
/// Location and filesystem of the image's primary system partition.
pub struct Partition {
    /// Offset of the partition from the start of the image file.
    #[get_copy = "pub"]
    offset: i64,

    /// Length of the partition in bytes.
    #[get_copy = "pub"]
    size: i64,

    /// Raw filesystem type identifier.
    #[get_copy = "pub"]
    fstype: i32,
}

impl Partition {
    /// Human readable name of the partition's filesystem.
    pub fn fstype_name(&self) -> &'static str {
        match self.fstype {
            FS_SQUASH => "squashfs",
            FS_EXT3 => "ext3",
            FS_IMMUTABLE_OBJ => "immutable object archive",
            FS_RAW => "raw",
            _ => "unknown",
        }
    }

    /// Fail unless the partition holds a squashfs filesystem.
    pub fn ensure_squashfs(&self) -> Result<()> {
        if self.fstype != FS_SQUASH {
            return Err(ConfigError::UnsupportedImageFs(self.fstype_name().into()).into());
        }
        Ok(())
    }
}

/// Read the primary system partition descriptor of the image at `path`.
pub fn primary_partition<P: AsRef<Path>>(path: P) -> Result<Partition> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("open image {}", path.display()))?;
    primary_partition_from(&mut file)
        .with_context(|| format!("read image {}", path.display()))
}

fn primary_partition_from<R: Read + Seek>(image: &mut R) -> Result<Partition> {
    let mut header = [0u8; HEADER_LEN];
    image
        .read_exact(&mut header)
        .context("read image global header")?;

    let magic = &header[LAUNCH_LEN..LAUNCH_LEN + MAGIC.len()];
    if magic != MAGIC {
        bail!("image carries no SIF magic");
    }

    // Descriptor table location and entry count follow the identity fields.
    let ints = LAUNCH_LEN + MAGIC_LEN + VERSION_LEN + ARCH_LEN + UUID_LEN;
    let dtotal = read_i64(&header, ints + 24);
    let descroff = read_i64(&header, ints + 32);

    image
        .seek(SeekFrom::Start(descroff as u64))
        .context("seek to descriptor table")?;

    for _ in 0..dtotal {
        let mut descr = [0u8; DESCRIPTOR_LEN];
        image
            .read_exact(&mut descr)
            .context("read partition descriptor")?;

        let datatype = read_i32(&descr, 0);
        let used = descr[4] != 0;
        if !used || datatype != DATA_PARTITION {
            continue;
        }

        let fileoff = read_i64(&descr, 17);
        let filelen = read_i64(&descr, 25);
        let extra = 4 + 1 + 3 * 4 + 3 * 8 + 4 * 8 + DESCR_NAME_LEN;
        let fstype = read_i32(&descr, extra);
        let parttype = read_i32(&descr, extra + 4);
        if parttype != PART_PRIMSYS {
            continue;
        }

        return Ok(Partition {
            offset: fileoff,
            size: filelen,
            fstype,
        });
    }
    bail!("image has no primary system partition")
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(buf[offset..offset + 4].try_into().expect("4 byte slice"))
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(buf[offset..offset + 8].try_into().expect("8 byte slice"))
}
