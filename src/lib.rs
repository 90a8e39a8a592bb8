//! A FAT12/FAT16/FAT32 and exFAT filesystem engine over a pluggable block
//! device.
//!
//! Attach one or more [`BlockDevice`]s to a [`FatFs`], register logical
//! volumes with [`FatFs::mount`], then work with paths such as `"0:/dir/file"`.

pub mod config;
pub mod device;
pub mod error;
pub mod fs;
pub mod partition;

pub use config::{FsConfig, PartitionMapping};
pub use device::{BlockDevice, DiskStatus, ImageFile, IoctlReply, IoctlRequest, RamDisk};
pub use error::{DiskError, FsError, FsResult};
pub use fs::{Dir, FatFs, FatKind, File, FileInfo, FreeSpace, MkfsOptions, OpenMode};
pub use partition::{PartitionStyle, PartitionTable};
