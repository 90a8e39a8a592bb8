use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use super::PartitionError;
use crate::device::BlockDevice;

const MBR_DISK_ID: usize = 440;
const MBR_TABLE: usize = 446;
const MBR_SIGN: usize = 510;
const BOOT_SIGNATURE: u16 = 0xAA55;
const SZ_PTE: usize = 16;

// Partition entry fields.
const PTE_BOOT: usize = 0;
const PTE_ST_CHS: usize = 1;
const PTE_SYSTEM: usize = 4;
const PTE_ED_CHS: usize = 5;
const PTE_ST_LBA: usize = 8;
const PTE_SIZ_LBA: usize = 12;

/// System id of the protective entry in front of a GPT.
const SYSTEM_GPT: u8 = 0xEE;
/// First partition starts one track in, as DOS partitioners did.
const SECTORS_PER_TRACK: u32 = 63;

/// Packed cylinder/head/sector address. The two high cylinder bits share a
/// byte with the 6-bit sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Chs {
    pub cylinder: u16,
    pub head: u8,
    pub sector: u8,
}

impl Chs {
    fn decode(b: &[u8]) -> Chs {
        Chs {
            cylinder: (b[1] as u16 & 0xC0) << 2 | b[2] as u16,
            head: b[0],
            sector: b[1] & 0x3F,
        }
    }

    /// Address of `lba` on a drive with `heads` heads of 63-sector tracks.
    fn from_lba(lba: u32, heads: u32) -> Chs {
        let track = lba / SECTORS_PER_TRACK;
        Chs {
            cylinder: (track / heads) as u16,
            head: (track % heads) as u8,
            sector: (lba % SECTORS_PER_TRACK + 1) as u8,
        }
    }

    fn encode(self) -> [u8; 3] {
        [
            self.head,
            (self.cylinder >> 2) as u8 & 0xC0 | self.sector,
            self.cylinder as u8,
        ]
    }
}

/// One of the four primary slots.
#[derive(Debug, Clone, Serialize)]
pub struct MbrEntry {
    pub active: bool,
    pub system_id: u8,
    pub start_lba: u32,
    pub total_sectors: u32,
    pub first: Chs,
    pub last: Chs,
}

impl MbrEntry {
    fn decode(pte: &[u8]) -> MbrEntry {
        MbrEntry {
            active: pte[PTE_BOOT] & 0x80 != 0,
            system_id: pte[PTE_SYSTEM],
            start_lba: LittleEndian::read_u32(&pte[PTE_ST_LBA..]),
            total_sectors: LittleEndian::read_u32(&pte[PTE_SIZ_LBA..]),
            first: Chs::decode(&pte[PTE_ST_CHS..PTE_ST_CHS + 3]),
            last: Chs::decode(&pte[PTE_ED_CHS..PTE_ED_CHS + 3]),
        }
    }

    fn encode(&self, pte: &mut [u8]) {
        pte[PTE_BOOT] = if self.active { 0x80 } else { 0 };
        pte[PTE_ST_CHS..PTE_ST_CHS + 3].copy_from_slice(&self.first.encode());
        pte[PTE_SYSTEM] = self.system_id;
        pte[PTE_ED_CHS..PTE_ED_CHS + 3].copy_from_slice(&self.last.encode());
        LittleEndian::write_u32(&mut pte[PTE_ST_LBA..], self.start_lba);
        LittleEndian::write_u32(&mut pte[PTE_SIZ_LBA..], self.total_sectors);
    }

    /// A slot with no partition in it.
    pub fn is_unused(&self) -> bool {
        self.system_id == 0
    }
}

/// Master boot record partition table.
#[derive(Debug, Clone, Serialize)]
pub struct Mbr {
    pub disk_id: u32,
    pub entries: [MbrEntry; 4],
}

impl Mbr {
    /// Decode sector 0 of a drive.
    pub fn parse(sector: &[u8]) -> Result<Self, PartitionError> {
        if sector.len() < 512 {
            return Err(PartitionError::InvalidMbr(format!(
                "{}-byte sector cannot hold a partition table",
                sector.len()
            )));
        }
        let sign = LittleEndian::read_u16(&sector[MBR_SIGN..]);
        if sign != BOOT_SIGNATURE {
            return Err(PartitionError::InvalidMbr(format!(
                "boot signature {sign:#06X}"
            )));
        }
        Ok(Self {
            disk_id: LittleEndian::read_u32(&sector[MBR_DISK_ID..]),
            entries: std::array::from_fn(|i| {
                let ofs = MBR_TABLE + i * SZ_PTE;
                MbrEntry::decode(&sector[ofs..ofs + SZ_PTE])
            }),
        })
    }

    /// Whether the table only guards a GPT.
    pub fn is_protective_gpt(&self) -> bool {
        self.entries[0].system_id == SYSTEM_GPT
    }
}

pub(super) fn set_slot_system_id(sector: &mut [u8], slot: usize, system_id: u8) {
    sector[MBR_TABLE + slot * SZ_PTE + PTE_SYSTEM] = system_id;
}

/// Lay out up to four primary partitions after the first track.
pub(super) fn write_mbr(
    dev: &dyn BlockDevice,
    drive_sectors: u32,
    ss: u32,
    sizes: &[u64],
    system_id: u8,
) -> Result<(), PartitionError> {
    // Synthetic geometry: double the heads until the cylinder count fits.
    let mut heads = 8u32;
    while heads < 256 && drive_sectors / heads / SECTORS_PER_TRACK > 1024 {
        heads *= 2;
    }
    let heads = heads.min(255);

    let mut sector = vec![0u8; ss as usize];
    let mut next = SECTORS_PER_TRACK;
    for (slot, &req) in sizes.iter().take(4).enumerate() {
        if next >= drive_sectors {
            break;
        }
        let req = req.min(u32::MAX as u64) as u32;
        let mut size = match req {
            100 => drive_sectors,
            0..=99 => drive_sectors / 100 * req,
            _ => req,
        };
        size = size.min(drive_sectors - next);
        if size == 0 {
            break;
        }
        let entry = MbrEntry {
            active: false,
            system_id,
            start_lba: next,
            total_sectors: size,
            first: Chs::from_lba(next, heads),
            last: Chs::from_lba(next + size - 1, heads),
        };
        let ofs = MBR_TABLE + slot * SZ_PTE;
        entry.encode(&mut sector[ofs..ofs + SZ_PTE]);
        next += size;
    }

    LittleEndian::write_u16(&mut sector[MBR_SIGN..], BOOT_SIGNATURE);
    dev.write(&sector, 0, 1)?;
    Ok(())
}
