use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";
const LUKS_MAGIC: &[u8; 6] = b"LUKS\xba\xbe";
const EXT_SUPERBLOCK_OFFSET: u64 = 1024;
const EXT_MAGIC_OFFSET: u64 = EXT_SUPERBLOCK_OFFSET + 56;
const EXT_MAGIC: u16 = 0xEF53;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionKind {
    /// A plain directory tree.
    Sandbox,
    Squashfs,
    EncryptedSquashfs,
    Ext3,
    /// Anything else, with whatever type name the inspector reported.
    Unknown(String),
}

impl PartitionKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Squashfs => "squashfs",
            Self::EncryptedSquashfs => "encrypted squashfs",
            Self::Ext3 => "ext3",
            Self::Unknown(s) => s,
        }
    }
}

/// The root filesystem partition of an image: what it is and where it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootfsPartition {
    pub kind: PartitionKind,
    pub offset: u64,
}

/// Image introspection. A SIF reader plugs in here; `HeaderProbe` handles
/// sandboxes and bare filesystem images.
pub trait ImageInspector {
    fn rootfs_partition(&self, path: &Path) -> Result<RootfsPartition, RuntimeError>;

    fn has_encrypted_rootfs(&self, path: &Path) -> Result<bool, RuntimeError> {
        Ok(self.rootfs_partition(path)?.kind == PartitionKind::EncryptedSquashfs)
    }
}

/// Classifies an image by the magic bytes of its first superblock.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderProbe;

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<bool> {
    file.seek(SeekFrom::Start(offset))?;
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

impl ImageInspector for HeaderProbe {
    fn rootfs_partition(&self, path: &Path) -> Result<RootfsPartition, RuntimeError> {
        let meta = match path.metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RuntimeError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return Ok(RootfsPartition {
                kind: PartitionKind::Sandbox,
                offset: 0,
            });
        }

        let mut file = File::open(path)?;
        let mut head = [0u8; 6];
        let short = !read_at(&mut file, 0, &mut head)?;

        let kind = if !short && &head[..4] == SQUASHFS_MAGIC {
            PartitionKind::Squashfs
        } else if !short && &head == LUKS_MAGIC {
            PartitionKind::EncryptedSquashfs
        } else {
            let mut magic = [0u8; 2];
            if read_at(&mut file, EXT_MAGIC_OFFSET, &mut magic)?
                && u16::from_le_bytes(magic) == EXT_MAGIC
            {
                PartitionKind::Ext3
            } else {
                PartitionKind::Unknown("unknown".to_owned())
            }
        };
        Ok(RootfsPartition { kind, offset: 0 })
    }
}
