use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use serde::Serialize;

use super::PartitionError;
use crate::device::{BlockDevice, IoctlRequest};
use crate::error::DiskError;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
const GPT_HEADER_LBA: u64 = 1;
const GPT_HEADER_SIZE: usize = 92;
pub(crate) const GPT_ENTRY_SIZE: usize = 128;
pub(crate) const GPT_ENTRIES: usize = 128;
/// Partitions start on 1 MiB boundaries.
pub(crate) const GPT_ALIGN_BYTES: u64 = 0x10_0000;

// Header fields.
const GPTH_SIGN: usize = 0;
const GPTH_REV: usize = 8;
const GPTH_SIZE: usize = 12;
const GPTH_BCC: usize = 16;
const GPTH_CUR_LBA: usize = 24;
const GPTH_BAK_LBA: usize = 32;
const GPTH_FST_LBA: usize = 40;
const GPTH_LST_LBA: usize = 48;
const GPTH_DSK_GUID: usize = 56;
const GPTH_PTE_OFS: usize = 72;
const GPTH_PTE_NUM: usize = 80;
const GPTH_PTE_SIZE: usize = 84;
const GPTH_PTE_BCC: usize = 88;

// Entry fields.
const GPTE_PTYPE: usize = 0;
const GPTE_UPART: usize = 16;
const GPTE_FST_LBA: usize = 32;
const GPTE_LST_LBA: usize = 40;
const GPTE_FLAGS: usize = 48;
const GPTE_NAME: usize = 56;

/// Microsoft basic data partition type, the one FAT volumes live in.
pub const BASIC_DATA_GUID: Guid = Guid([
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
]);

/// GUID in its on-disk byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    fn at(buf: &[u8], ofs: usize) -> Guid {
        let mut g = [0u8; 16];
        g.copy_from_slice(&buf[ofs..ofs + 16]);
        Guid(g)
    }

    pub fn is_nil(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Version 4 style GUID drawn from `rng`.
    fn random(rng: &mut XorShift) -> Guid {
        let mut g = [0u8; 16];
        for chunk in g.chunks_exact_mut(4) {
            chunk.copy_from_slice(&rng.next().to_le_bytes());
        }
        g[7] = (g[7] & 0x0F) | 0x40;
        g[8] = (g[8] & 0x3F) | 0x80;
        Guid(g)
    }
}

/// Registry form: the first three groups are stored little-endian.
impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-",
            LittleEndian::read_u32(&d[0..4]),
            LittleEndian::read_u16(&d[4..6]),
            LittleEndian::read_u16(&d[6..8])
        )?;
        d[8..10].iter().try_for_each(|b| write!(f, "{b:02X}"))?;
        f.write_str("-")?;
        d[10..].iter().try_for_each(|b| write!(f, "{b:02X}"))
    }
}

impl Serialize for Guid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The parts of a GPT header needed to locate and validate the entries.
#[derive(Debug, Clone, Serialize)]
pub struct GptHeader {
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub entries_lba: u64,
    pub entry_count: u32,
    pub entries_crc: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GptEntry {
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub flags: u64,
    pub name: String,
}

impl GptEntry {
    fn decode(raw: &[u8]) -> GptEntry {
        let units: Vec<u16> = raw[GPTE_NAME..GPT_ENTRY_SIZE]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .take_while(|&u| u != 0)
            .collect();
        GptEntry {
            type_guid: Guid::at(raw, GPTE_PTYPE),
            unique_guid: Guid::at(raw, GPTE_UPART),
            first_lba: LittleEndian::read_u64(&raw[GPTE_FST_LBA..]),
            last_lba: LittleEndian::read_u64(&raw[GPTE_LST_LBA..]),
            flags: LittleEndian::read_u64(&raw[GPTE_FLAGS..]),
            name: String::from_utf16_lossy(&units),
        }
    }
}

/// A validated GUID partition table with its used entries.
#[derive(Debug, Clone, Serialize)]
pub struct Gpt {
    pub header: GptHeader,
    pub entries: Vec<GptEntry>,
}

fn invalid(msg: String) -> PartitionError {
    PartitionError::InvalidGpt(msg)
}

impl Gpt {
    /// Read the primary table, falling back to the backup copy in the last
    /// sector when the primary header or its entry array fails its CRC.
    pub fn read(dev: &dyn BlockDevice, ss: u32) -> Result<Self, PartitionError> {
        match Self::read_at(dev, ss, GPT_HEADER_LBA) {
            Ok(gpt) => Ok(gpt),
            Err(primary) => {
                let last = dev
                    .ioctl(IoctlRequest::GetSectorCount)?
                    .value()
                    .ok_or(DiskError::Error)?
                    .saturating_sub(1);
                warn!("primary GPT rejected ({primary}), trying backup at LBA {last}");
                Self::read_at(dev, ss, last)
            }
        }
    }

    fn read_at(dev: &dyn BlockDevice, ss: u32, lba: u64) -> Result<Self, PartitionError> {
        let ssz = ss as usize;
        let mut sector = vec![0u8; ssz];
        dev.read(&mut sector, lba, 1)?;
        let header = check_header(&sector)?;
        if header.current_lba != lba {
            return Err(invalid(format!(
                "header at LBA {lba} claims LBA {}",
                header.current_lba
            )));
        }

        let len = header.entry_count as usize * GPT_ENTRY_SIZE;
        let mut array = vec![0u8; len.div_ceil(ssz) * ssz];
        for (i, chunk) in array.chunks_exact_mut(ssz).enumerate() {
            dev.read(chunk, header.entries_lba + i as u64, 1)?;
        }
        let crc = crc32fast::hash(&array[..len]);
        if crc != header.entries_crc {
            return Err(invalid(format!(
                "entry array CRC {crc:#010X} does not match {:#010X}",
                header.entries_crc
            )));
        }

        let entries = array[..len]
            .chunks_exact(GPT_ENTRY_SIZE)
            .filter(|raw| !Guid::at(raw, GPTE_PTYPE).is_nil())
            .map(GptEntry::decode)
            .filter(|e| {
                let inside = e.first_lba <= e.last_lba
                    && e.first_lba >= header.first_usable_lba
                    && e.last_lba <= header.last_usable_lba;
                if !inside {
                    warn!(
                        "skipping GPT entry {:?} spanning LBA {}..={}",
                        e.name, e.first_lba, e.last_lba
                    );
                }
                inside
            })
            .collect();
        Ok(Self { header, entries })
    }
}

/// Validate signature, revision, size and CRC of a header sector.
fn check_header(buf: &[u8]) -> Result<GptHeader, PartitionError> {
    if &buf[GPTH_SIGN..GPTH_SIGN + 8] != GPT_SIGNATURE {
        return Err(invalid("no GPT signature".to_string()));
    }
    let rev = LittleEndian::read_u32(&buf[GPTH_REV..]);
    if rev != GPT_REVISION {
        return Err(invalid(format!("unsupported revision {rev:#010X}")));
    }
    let size = LittleEndian::read_u32(&buf[GPTH_SIZE..]) as usize;
    if size < GPT_HEADER_SIZE || size > buf.len().min(512) {
        return Err(invalid(format!("bad header size {size}")));
    }
    let stored = LittleEndian::read_u32(&buf[GPTH_BCC..]);
    let crc = header_crc(&buf[..size]);
    if crc != stored {
        return Err(invalid(format!(
            "header CRC {crc:#010X} does not match {stored:#010X}"
        )));
    }
    let count = LittleEndian::read_u32(&buf[GPTH_PTE_NUM..]);
    let esize = LittleEndian::read_u32(&buf[GPTH_PTE_SIZE..]);
    if esize as usize != GPT_ENTRY_SIZE || count as usize > GPT_ENTRIES {
        return Err(invalid(format!("unsupported entry array {count} x {esize}")));
    }

    Ok(GptHeader {
        current_lba: LittleEndian::read_u64(&buf[GPTH_CUR_LBA..]),
        backup_lba: LittleEndian::read_u64(&buf[GPTH_BAK_LBA..]),
        first_usable_lba: LittleEndian::read_u64(&buf[GPTH_FST_LBA..]),
        last_usable_lba: LittleEndian::read_u64(&buf[GPTH_LST_LBA..]),
        disk_guid: Guid::at(buf, GPTH_DSK_GUID),
        entries_lba: LittleEndian::read_u64(&buf[GPTH_PTE_OFS..]),
        entry_count: count,
        entries_crc: LittleEndian::read_u32(&buf[GPTH_PTE_BCC..]),
    })
}

/// CRC32 of a header with its own CRC field taken as zero.
fn header_crc(header: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(&header[..GPTH_BCC]);
    h.update(&[0u8; 4]);
    h.update(&header[GPTH_BCC + 4..]);
    h.finalize()
}

/// Small generator for partition and disk GUIDs.
struct XorShift(u32);

impl XorShift {
    fn next(&mut self) -> u32 {
        let mut x = if self.0 == 0 { 0x2463_4317 } else { self.0 };
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// Write primary and backup tables with basic-data partitions of the
/// requested sizes (sector counts, or percentages when 100 or less).
pub(super) fn write_gpt(
    dev: &dyn BlockDevice,
    drive_sectors: u64,
    ss: u32,
    sizes: &[u64],
    seed: u32,
) -> Result<(), PartitionError> {
    let ssz = ss as u64;
    let align = (GPT_ALIGN_BYTES / ssz).max(1);
    let table_sectors = (GPT_ENTRIES * GPT_ENTRY_SIZE) as u64 / ssz;
    if drive_sectors < 2 * table_sectors + 3 + align {
        return Err(PartitionError::Layout(format!(
            "{drive_sectors} sectors is too small for GPT"
        )));
    }
    let backup_table = drive_sectors - table_sectors - 1;
    let mut next = 2 + table_sectors;
    let pool = backup_table - next;
    let mut rng = XorShift(seed);

    let mut array = vec![0u8; GPT_ENTRIES * GPT_ENTRY_SIZE];
    let mut size = 1u64;
    let mut requested = sizes.iter().copied();
    for slot in array.chunks_exact_mut(GPT_ENTRY_SIZE) {
        if size != 0 {
            next = next.div_ceil(align) * align;
            size = requested.next().unwrap_or(0);
            if size <= 100 {
                size = (pool * size / 100).div_ceil(align) * align;
            }
            if next + size > backup_table {
                size = backup_table.saturating_sub(next);
            }
        }
        if size == 0 {
            break;
        }
        slot[GPTE_PTYPE..GPTE_PTYPE + 16].copy_from_slice(&BASIC_DATA_GUID.0);
        slot[GPTE_UPART..GPTE_UPART + 16].copy_from_slice(&Guid::random(&mut rng).0);
        LittleEndian::write_u64(&mut slot[GPTE_FST_LBA..], next);
        LittleEndian::write_u64(&mut slot[GPTE_LST_LBA..], next + size - 1);
        next += size;
    }
    let array_crc = crc32fast::hash(&array);
    for (i, chunk) in array.chunks_exact(ss as usize).enumerate() {
        dev.write(chunk, 2 + i as u64, 1)?;
        dev.write(chunk, backup_table + i as u64, 1)?;
    }

    let mut hdr = vec![0u8; ss as usize];
    hdr[GPTH_SIGN..GPTH_SIGN + 8].copy_from_slice(GPT_SIGNATURE);
    LittleEndian::write_u32(&mut hdr[GPTH_REV..], GPT_REVISION);
    LittleEndian::write_u32(&mut hdr[GPTH_SIZE..], GPT_HEADER_SIZE as u32);
    LittleEndian::write_u64(&mut hdr[GPTH_CUR_LBA..], GPT_HEADER_LBA);
    LittleEndian::write_u64(&mut hdr[GPTH_BAK_LBA..], drive_sectors - 1);
    LittleEndian::write_u64(&mut hdr[GPTH_FST_LBA..], 2 + table_sectors);
    LittleEndian::write_u64(&mut hdr[GPTH_LST_LBA..], backup_table - 1);
    hdr[GPTH_DSK_GUID..GPTH_DSK_GUID + 16].copy_from_slice(&Guid::random(&mut rng).0);
    LittleEndian::write_u64(&mut hdr[GPTH_PTE_OFS..], 2);
    LittleEndian::write_u32(&mut hdr[GPTH_PTE_NUM..], GPT_ENTRIES as u32);
    LittleEndian::write_u32(&mut hdr[GPTH_PTE_SIZE..], GPT_ENTRY_SIZE as u32);
    LittleEndian::write_u32(&mut hdr[GPTH_PTE_BCC..], array_crc);
    let crc = header_crc(&hdr[..GPT_HEADER_SIZE]);
    LittleEndian::write_u32(&mut hdr[GPTH_BCC..], crc);
    dev.write(&hdr, GPT_HEADER_LBA, 1)?;

    // Backup header: swapped self/alternate LBAs, entries before it.
    LittleEndian::write_u64(&mut hdr[GPTH_CUR_LBA..], drive_sectors - 1);
    LittleEndian::write_u64(&mut hdr[GPTH_BAK_LBA..], GPT_HEADER_LBA);
    LittleEndian::write_u64(&mut hdr[GPTH_PTE_OFS..], backup_table);
    let crc = header_crc(&hdr[..GPT_HEADER_SIZE]);
    LittleEndian::write_u32(&mut hdr[GPTH_BCC..], crc);
    dev.write(&hdr, drive_sectors - 1, 1)?;

    // Protective MBR covering the whole drive.
    let mut mbr = vec![0u8; ss as usize];
    mbr[446..462].copy_from_slice(&[
        0x00, 0x00, 0x02, 0x00, 0xEE, 0xFE, 0xFF, 0x00, 0x01, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF,
        0xFF,
    ]);
    LittleEndian::write_u16(&mut mbr[510..512], 0xAA55);
    dev.write(&mbr, 0, 1)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;

    const DISK: u64 = 32_768;

    fn partitioned(sizes: &[u64]) -> RamDisk {
        let disk = RamDisk::new(DISK, 512);
        write_gpt(&disk, DISK, 512, sizes, 0x1234_5678).unwrap();
        disk
    }

    fn flip(disk: &RamDisk, lba: u64, byte: usize) {
        let mut sector = [0u8; 512];
        disk.read(&mut sector, lba, 1).unwrap();
        sector[byte] ^= 0x5A;
        disk.write(&sector, lba, 1).unwrap();
    }

    #[test]
    fn test_layout_of_written_table() {
        let gpt = Gpt::read(&partitioned(&[4096, 8192]), 512).unwrap();
        assert_eq!(gpt.header.current_lba, 1);
        assert_eq!(gpt.header.backup_lba, DISK - 1);
        assert_eq!(gpt.header.first_usable_lba, 34);
        assert_eq!(gpt.header.last_usable_lba, DISK - 34);

        let spans: Vec<(u64, u64)> = gpt.entries.iter().map(|e| (e.first_lba, e.last_lba)).collect();
        assert_eq!(spans, vec![(2048, 6143), (6144, 14335)]);
        assert!(gpt.entries.iter().all(|e| e.type_guid == BASIC_DATA_GUID));
        assert_ne!(gpt.entries[0].unique_guid, gpt.entries[1].unique_guid);
        assert!(gpt.entries[0].name.is_empty());
    }

    #[test]
    fn test_percent_sizes_fill_the_drive() {
        let gpt = Gpt::read(&partitioned(&[50, 50]), 512).unwrap();
        assert_eq!(gpt.entries.len(), 2);
        let last = gpt.entries[1].last_lba;
        assert!(last <= gpt.header.last_usable_lba);
        assert!(gpt.entries[1].first_lba > gpt.entries[0].last_lba);
    }

    #[test]
    fn test_damaged_primary_header_uses_backup() {
        let disk = partitioned(&[100]);
        flip(&disk, 1, GPTH_FST_LBA);
        let gpt = Gpt::read(&disk, 512).unwrap();
        assert_eq!(gpt.header.current_lba, DISK - 1);
        assert_eq!(gpt.entries.len(), 1);
    }

    #[test]
    fn test_damaged_entry_arrays_are_rejected() {
        let disk = partitioned(&[100]);
        flip(&disk, 2, GPTE_FST_LBA + 1);
        flip(&disk, DISK - 33, GPTE_FST_LBA + 1);
        assert!(matches!(
            Gpt::read(&disk, 512),
            Err(PartitionError::InvalidGpt(_))
        ));
    }

    /// Rewrite entry 0 in both arrays and re-seal both headers.
    fn patch_first_entry(disk: &RamDisk, edit: impl Fn(&mut [u8])) {
        for hdr_lba in [GPT_HEADER_LBA, DISK - 1] {
            let mut hdr = [0u8; 512];
            disk.read(&mut hdr, hdr_lba, 1).unwrap();
            let arr_lba = LittleEndian::read_u64(&hdr[GPTH_PTE_OFS..]);
            let mut array = vec![0u8; GPT_ENTRIES * GPT_ENTRY_SIZE];
            for (i, chunk) in array.chunks_exact_mut(512).enumerate() {
                disk.read(chunk, arr_lba + i as u64, 1).unwrap();
            }
            edit(&mut array[..GPT_ENTRY_SIZE]);
            for (i, chunk) in array.chunks_exact(512).enumerate() {
                disk.write(chunk, arr_lba + i as u64, 1).unwrap();
            }
            LittleEndian::write_u32(&mut hdr[GPTH_PTE_BCC..], crc32fast::hash(&array));
            let crc = header_crc(&hdr[..GPT_HEADER_SIZE]);
            LittleEndian::write_u32(&mut hdr[GPTH_BCC..], crc);
            disk.write(&hdr, hdr_lba, 1).unwrap();
        }
    }

    #[test]
    fn test_inverted_entry_is_skipped() {
        let disk = partitioned(&[4096, 4096]);
        patch_first_entry(&disk, |e| {
            let first = LittleEndian::read_u64(&e[GPTE_FST_LBA..]);
            LittleEndian::write_u64(&mut e[GPTE_LST_LBA..], first - 2);
        });
        let gpt = Gpt::read(&disk, 512).unwrap();
        assert_eq!(gpt.entries.len(), 1);
        assert_eq!(gpt.entries[0].first_lba, 6144);
    }

    #[test]
    fn test_entry_past_usable_area_is_skipped() {
        let disk = partitioned(&[4096]);
        patch_first_entry(&disk, |e| {
            LittleEndian::write_u64(&mut e[GPTE_LST_LBA..], DISK + 10);
        });
        let gpt = Gpt::read(&disk, 512).unwrap();
        assert!(gpt.entries.is_empty());
    }

    #[test]
    fn test_blank_drive_has_no_gpt() {
        let disk = RamDisk::new(64, 512);
        assert!(matches!(
            Gpt::read(&disk, 512),
            Err(PartitionError::InvalidGpt(_))
        ));
    }

    #[test]
    fn test_guid_display() {
        assert_eq!(
            BASIC_DATA_GUID.to_string(),
            "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7"
        );
    }

    #[test]
    fn test_entry_name_decoding() {
        let mut raw = [0u8; GPT_ENTRY_SIZE];
        raw[GPTE_PTYPE..GPTE_PTYPE + 16].copy_from_slice(&BASIC_DATA_GUID.0);
        for (i, u) in "Data".encode_utf16().enumerate() {
            LittleEndian::write_u16(&mut raw[GPTE_NAME + 2 * i..], u);
        }
        assert_eq!(GptEntry::decode(&raw).name, "Data");
    }
}
