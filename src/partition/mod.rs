pub mod gpt;
pub mod mbr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{BlockDevice, IoctlRequest};
use crate::error::{DiskError, FsError};
use gpt::Gpt;
use mbr::Mbr;

/// Drives at least this many sectors long are partitioned as GPT when the
/// style is left to auto selection.
pub const MIN_GPT_SECTORS: u64 = 0x1000_0000;

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("disk I/O error: {0}")]
    Disk(#[from] DiskError),

    #[error("invalid MBR: {0}")]
    InvalidMbr(String),

    #[error("invalid GPT: {0}")]
    InvalidGpt(String),

    #[error("cannot partition drive: {0}")]
    Layout(String),
}

impl From<PartitionError> for FsError {
    fn from(e: PartitionError) -> Self {
        match e {
            PartitionError::Disk(d) => d.into(),
            PartitionError::InvalidMbr(_) | PartitionError::InvalidGpt(_) => {
                FsError::MkfsAborted("no usable partition table")
            }
            PartitionError::Layout(_) => FsError::InvalidParameter,
        }
    }
}

/// Partitioning scheme to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartitionStyle {
    /// GPT for drives of [`MIN_GPT_SECTORS`] or more, MBR otherwise.
    #[default]
    Auto,
    Mbr,
    Gpt,
}

impl PartitionStyle {
    pub(crate) fn use_gpt(self, sectors: u64) -> bool {
        match self {
            PartitionStyle::Auto => sectors >= MIN_GPT_SECTORS,
            PartitionStyle::Mbr => false,
            PartitionStyle::Gpt => true,
        }
    }
}

/// Detected partition table type with parsed data.
#[derive(Debug, Clone)]
pub enum PartitionTable {
    Mbr(Mbr),
    Gpt { protective_mbr: Mbr, gpt: Gpt },
}

/// A partition that may host a FAT volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeSpan {
    pub start_lba: u64,
    pub sectors: u64,
    /// MBR slot (1..=4) or basic-data ordinal on GPT.
    pub ordinal: u8,
}

impl PartitionTable {
    /// Read and parse the partition table of a drive with `ss`-byte sectors.
    pub fn detect(dev: &dyn BlockDevice, ss: u32) -> Result<Self, PartitionError> {
        let mut sector = vec![0u8; ss as usize];
        dev.read(&mut sector, 0, 1)?;
        let mbr = Mbr::parse(&sector)?;

        if mbr.is_protective_gpt() {
            let gpt = Gpt::read(dev, ss)?;
            debug!(
                "GPT with {} partition entries (disk {})",
                gpt.entries.len(),
                gpt.header.disk_guid
            );
            return Ok(PartitionTable::Gpt {
                protective_mbr: mbr,
                gpt,
            });
        }
        Ok(PartitionTable::Mbr(mbr))
    }

    /// Start sectors of the partitions that may hold a volume, in the order
    /// a forced partition number refers to them.
    ///
    /// MBR yields all four slots (0 for an unused slot); GPT yields the
    /// Microsoft basic-data entries.
    pub fn volume_candidates(&self) -> Vec<u64> {
        self.volume_spans().iter().map(|s| s.start_lba).collect()
    }

    pub fn volume_spans(&self) -> Vec<VolumeSpan> {
        match self {
            PartitionTable::Mbr(mbr) => mbr
                .entries
                .iter()
                .enumerate()
                .map(|(i, e)| VolumeSpan {
                    start_lba: if e.is_unused() {
                        0
                    } else {
                        e.start_lba as u64
                    },
                    sectors: e.total_sectors as u64,
                    ordinal: i as u8 + 1,
                })
                .collect(),
            PartitionTable::Gpt { gpt, .. } => gpt
                .entries
                .iter()
                .filter(|e| e.type_guid == gpt::BASIC_DATA_GUID)
                .enumerate()
                .map(|(i, e)| VolumeSpan {
                    start_lba: e.first_lba,
                    sectors: e.last_lba + 1 - e.first_lba,
                    ordinal: i as u8 + 1,
                })
                .collect(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PartitionTable::Mbr(_) => "MBR",
            PartitionTable::Gpt { .. } => "GPT",
        }
    }

    pub fn is_gpt(&self) -> bool {
        matches!(self, PartitionTable::Gpt { .. })
    }
}

fn drive_geometry(dev: &dyn BlockDevice) -> Result<(u64, u32), PartitionError> {
    let sectors = dev
        .ioctl(IoctlRequest::GetSectorCount)?
        .value()
        .ok_or(DiskError::Error)?;
    let ss = dev
        .ioctl(IoctlRequest::GetSectorSize)?
        .value()
        .ok_or(DiskError::Error)? as u32;
    if !ss.is_power_of_two() || !(512..=4096).contains(&ss) {
        return Err(DiskError::Error.into());
    }
    Ok((sectors, ss))
}

/// Write a new partition table dividing the drive.
///
/// Each size is a sector count, or a percentage of the drive when it is 100
/// or less. The list ends at the first zero; MBR takes at most four.
/// Partitions are tagged with `system_id` on MBR and as basic data on GPT.
pub fn create_partitions(
    dev: &dyn BlockDevice,
    sizes: &[u64],
    system_id: u8,
    style: PartitionStyle,
) -> Result<(), PartitionError> {
    let (sectors, ss) = drive_geometry(dev)?;
    if style.use_gpt(sectors) {
        debug!("writing GPT over {sectors} sectors");
        let seed = sectors as u32 ^ chrono::Utc::now().timestamp() as u32;
        gpt::write_gpt(dev, sectors, ss, sizes, seed)
    } else {
        if sectors > u32::MAX as u64 {
            return Err(PartitionError::Layout(format!(
                "{sectors} sectors do not fit an MBR"
            )));
        }
        debug!("writing MBR over {sectors} sectors");
        mbr::write_mbr(dev, sectors as u32, ss, sizes, system_id)
    }
}

/// Rewrite the system id of MBR slot `ordinal`. GPT partitions carry no such
/// byte and are left alone.
pub fn set_system_id(
    dev: &dyn BlockDevice,
    ss: u32,
    ordinal: u8,
    system_id: u8,
) -> Result<(), PartitionError> {
    let mut sector = vec![0u8; ss as usize];
    dev.read(&mut sector, 0, 1)?;
    let mbr = Mbr::parse(&sector)?;
    if mbr.is_protective_gpt() {
        return Ok(());
    }
    if !(1..=4).contains(&ordinal) {
        warn!("no MBR slot {ordinal} to tag");
        return Ok(());
    }
    mbr::set_slot_system_id(&mut sector, ordinal as usize - 1, system_id);
    dev.write(&sector, 0, 1)?;
    Ok(())
}

/// Human-readable byte count in binary units, e.g. `"1.5 MiB"`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;

    #[test]
    fn test_blank_drive_has_no_table() {
        let disk = RamDisk::new(64, 512);
        assert!(matches!(
            PartitionTable::detect(&disk, 512),
            Err(PartitionError::InvalidMbr(_))
        ));
    }

    #[test]
    fn test_mbr_percentages() {
        let disk = RamDisk::new(20_000, 512);
        create_partitions(&disk, &[50, 50], 0x0C, PartitionStyle::Mbr).unwrap();
        let table = PartitionTable::detect(&disk, 512).unwrap();
        assert_eq!(table.type_name(), "MBR");
        let spans = table.volume_spans();
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[0].start_lba, 63);
        assert_eq!(spans[0].sectors, 10_000);
        assert_eq!(spans[1].start_lba, 10_063);
        assert_eq!(spans[1].sectors, 20_000 - 10_063);
        assert_eq!(table.volume_candidates()[2], 0);
    }

    #[test]
    fn test_gpt_forced_on_small_drive() {
        let disk = RamDisk::new(16_384, 512);
        create_partitions(&disk, &[100], 0x07, PartitionStyle::Gpt).unwrap();
        let table = PartitionTable::detect(&disk, 512).unwrap();
        assert!(table.is_gpt());
        let spans = table.volume_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start_lba, 2048);
    }

    #[test]
    fn test_set_system_id() {
        let disk = RamDisk::new(4_096, 512);
        create_partitions(&disk, &[100], 0x07, PartitionStyle::Mbr).unwrap();
        set_system_id(&disk, 512, 1, 0x0C).unwrap();
        let mut sector = [0u8; 512];
        disk.read(&mut sector, 0, 1).unwrap();
        assert_eq!(sector[446 + 4], 0x0C);
    }

    #[test]
    fn test_format_size_units() {
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(32 << 20), "32.0 MiB");
        assert_eq!(format_size(3 << 30), "3.0 GiB");
        assert_eq!(format_size(2048 << 40), "2048.0 TiB");
    }
}
