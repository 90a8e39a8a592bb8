//! The filesystem engine: on-disk layout, cluster chains, directories,
//! file and directory handles, formatting, and the volume registry.

pub(crate) mod chain;
pub(crate) mod dir;
pub mod entry;
pub mod file;
pub(crate) mod layout;
pub(crate) mod lock;
pub mod mkfs;
pub(crate) mod name;
pub mod ops;
pub(crate) mod path;
pub mod registry;
pub(crate) mod volume;
pub(crate) mod window;

pub use entry::FileInfo;
pub use file::{File, OpenMode};
pub use layout::{AM_ARC, AM_DIR, AM_HID, AM_RDO, AM_SYS, AM_VOL};
pub use mkfs::{MkfsOptions, FM_ANY, FM_EXFAT, FM_FAT, FM_FAT32, FM_SFD};
pub use ops::Dir;
pub use registry::{FatFs, FreeSpace};
pub use volume::FatKind;

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use super::mkfs::{self, MkfsOptions, FM_EXFAT, FM_FAT, FM_FAT32, FM_SFD};
    use super::volume::{Volume, VolumeOptions};
    use crate::config::FsConfig;
    use crate::device::RamDisk;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Format {
        Fat12,
        Fat16,
        Fat32,
        ExFat,
    }

    pub fn options() -> VolumeOptions {
        VolumeOptions::from_config(&FsConfig {
            rtc: false,
            ..FsConfig::default()
        })
    }

    /// A freshly formatted super-floppy RAM volume, mounted.
    pub fn formatted_volume(format: Format) -> Volume {
        let (sectors, opts) = match format {
            Format::Fat12 => (
                4096,
                MkfsOptions {
                    fmt: FM_FAT | FM_SFD,
                    n_fat: 2,
                    ..MkfsOptions::default()
                },
            ),
            Format::Fat16 => (
                16_384,
                MkfsOptions {
                    fmt: FM_FAT | FM_SFD,
                    n_fat: 2,
                    au_size: 512,
                    ..MkfsOptions::default()
                },
            ),
            Format::Fat32 => (
                68_000,
                MkfsOptions {
                    fmt: FM_FAT32 | FM_SFD,
                    n_fat: 2,
                    au_size: 512,
                    ..MkfsOptions::default()
                },
            ),
            Format::ExFat => (
                16_384,
                MkfsOptions {
                    fmt: FM_EXFAT | FM_SFD,
                    ..MkfsOptions::default()
                },
            ),
        };
        let disk = Arc::new(RamDisk::new(sectors, 512));
        mkfs::format(disk.as_ref(), 0, &opts, &options()).expect("format test volume");
        Volume::mount(disk, 0, 0, 1, options()).expect("mount test volume")
    }
}
