//! On-disk layouts: wire-format offsets and typed views over sector bytes.
//!
//! The numeric offsets are the documented positions of each field inside
//! its structure and must not change. Code outside this module reads and
//! writes fields through the views below rather than indexing raw bytes.

use byteorder::{ByteOrder, LittleEndian};

pub const SZDIRE: usize = 32;
/// Deleted directory entry mark in the first name byte.
pub const DDEM: u8 = 0xE5;
/// Replacement for a name whose first byte really is 0xE5.
pub const RDDEM: u8 = 0x05;
/// Last long-name entry flag in the order byte.
pub const LLEF: u8 = 0x40;
pub const MAX_LFN_ENTRIES: usize = 20;
pub const MAX_LFN_CHARS: usize = 255;
pub const BOOT_SIGNATURE: u16 = 0xAA55;

// Boot sector / BPB
pub const BS_JMP_BOOT: usize = 0;
pub const BS_OEM_NAME: usize = 3;
pub const BPB_BYTS_PER_SEC: usize = 11;
pub const BPB_SEC_PER_CLUS: usize = 13;
pub const BPB_RSVD_SEC_CNT: usize = 14;
pub const BPB_NUM_FATS: usize = 16;
pub const BPB_ROOT_ENT_CNT: usize = 17;
pub const BPB_TOT_SEC16: usize = 19;
pub const BPB_MEDIA: usize = 21;
pub const BPB_FAT_SZ16: usize = 22;
pub const BPB_SEC_PER_TRK: usize = 24;
pub const BPB_NUM_HEADS: usize = 26;
pub const BPB_HIDD_SEC: usize = 28;
pub const BPB_TOT_SEC32: usize = 32;
pub const BS_DRV_NUM: usize = 36;
pub const BS_BOOT_SIG: usize = 38;
pub const BS_VOL_ID: usize = 39;
pub const BS_VOL_LAB: usize = 43;
pub const BS_FIL_SYS_TYPE: usize = 54;
pub const BS_BOOT_CODE: usize = 62;
pub const BS_55AA: usize = 510;

// FAT32 extension
pub const BPB_FAT_SZ32: usize = 36;
pub const BPB_EXT_FLAGS32: usize = 40;
pub const BPB_FS_VER32: usize = 42;
pub const BPB_ROOT_CLUS32: usize = 44;
pub const BPB_FS_INFO32: usize = 48;
pub const BPB_BK_BOOT_SEC32: usize = 50;
pub const BS_DRV_NUM32: usize = 64;
pub const BS_BOOT_SIG32: usize = 66;
pub const BS_VOL_ID32: usize = 67;
pub const BS_VOL_LAB32: usize = 71;
pub const BS_FIL_SYS_TYPE32: usize = 82;
pub const BS_BOOT_CODE32: usize = 90;

// exFAT VBR
pub const BPB_ZEROED_EX: usize = 11;
pub const BPB_VOL_OFS_EX: usize = 64;
pub const BPB_TOT_SEC_EX: usize = 72;
pub const BPB_FAT_OFS_EX: usize = 80;
pub const BPB_FAT_SZ_EX: usize = 84;
pub const BPB_DATA_OFS_EX: usize = 88;
pub const BPB_NUM_CLUS_EX: usize = 92;
pub const BPB_ROOT_CLUS_EX: usize = 96;
pub const BPB_VOL_ID_EX: usize = 100;
pub const BPB_FS_VER_EX: usize = 104;
pub const BPB_VOL_FLAG_EX: usize = 106;
pub const BPB_BYTS_PER_SEC_EX: usize = 108;
pub const BPB_SEC_PER_CLUS_EX: usize = 109;
pub const BPB_NUM_FATS_EX: usize = 110;
pub const BPB_DRV_NUM_EX: usize = 111;
pub const BPB_PERC_IN_USE_EX: usize = 112;
pub const BS_BOOT_CODE_EX: usize = 120;

// FSInfo sector
pub const FSI_LEAD_SIG: usize = 0;
pub const FSI_STRUC_SIG: usize = 484;
pub const FSI_FREE_COUNT: usize = 488;
pub const FSI_NXT_FREE: usize = 492;
pub const FSI_LEAD_SIGNATURE: u32 = 0x4161_5252;
pub const FSI_STRUC_SIGNATURE: u32 = 0x6141_7272;
pub const FSI_TRAIL_SIGNATURE: u32 = 0xAA55_0000;

// MBR partition table
pub const MBR_TABLE: usize = 446;
pub const SZ_PTE: usize = 16;
pub const PTE_BOOT: usize = 0;
pub const PTE_ST_HEAD: usize = 1;
pub const PTE_SYSTEM: usize = 4;
pub const PTE_ED_HEAD: usize = 5;
pub const PTE_ST_LBA: usize = 8;
pub const PTE_SIZ_LBA: usize = 12;

// Short-name directory entry
pub const DIR_NAME: usize = 0;
pub const DIR_ATTR: usize = 11;
pub const DIR_NTRES: usize = 12;
pub const DIR_CRT_TIME10: usize = 13;
pub const DIR_CRT_TIME: usize = 14;
pub const DIR_LST_ACC_DATE: usize = 18;
pub const DIR_FST_CLUS_HI: usize = 20;
pub const DIR_MOD_TIME: usize = 22;
pub const DIR_FST_CLUS_LO: usize = 26;
pub const DIR_FILE_SIZE: usize = 28;

// Long-name entry
pub const LDIR_ORD: usize = 0;
pub const LDIR_ATTR: usize = 11;
pub const LDIR_TYPE: usize = 12;
pub const LDIR_CHKSUM: usize = 13;
pub const LDIR_FST_CLUS_LO: usize = 26;
/// Byte offsets of the 13 UTF-16 units carried by one long-name entry.
pub const LFN_OFFSETS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

// exFAT directory entries
pub const XDIR_TYPE: usize = 0;
pub const XDIR_NUM_LABEL: usize = 1;
pub const XDIR_LABEL: usize = 2;
pub const XDIR_CASE_SUM: usize = 4;
pub const XDIR_NUM_SEC: usize = 1;
pub const XDIR_SET_SUM: usize = 2;
pub const XDIR_ATTR: usize = 4;
pub const XDIR_CRT_TIME: usize = 8;
pub const XDIR_MOD_TIME: usize = 12;
pub const XDIR_ACC_TIME: usize = 16;
pub const XDIR_CRT_TIME10: usize = 20;
pub const XDIR_MOD_TIME10: usize = 21;
pub const XDIR_CRT_TZ: usize = 22;
pub const XDIR_MOD_TZ: usize = 23;
pub const XDIR_ACC_TZ: usize = 24;
pub const XDIR_GEN_FLAGS: usize = 33;
pub const XDIR_NUM_NAME: usize = 35;
pub const XDIR_NAME_HASH: usize = 36;
pub const XDIR_VALID_FILE_SIZE: usize = 40;
pub const XDIR_FST_CLUS: usize = 52;
pub const XDIR_FILE_SIZE: usize = 56;

// exFAT allocation bitmap / up-case table entries
pub const XENT_UPCASE_SUM: usize = 4;
pub const XENT_FST_CLUS: usize = 20;
pub const XENT_DATA_LEN: usize = 24;

// exFAT entry type tags
pub const ET_BITMAP: u8 = 0x81;
pub const ET_UPCASE: u8 = 0x82;
pub const ET_VLABEL: u8 = 0x83;
pub const ET_FILEDIR: u8 = 0x85;
pub const ET_STREAM: u8 = 0xC0;
pub const ET_FILENAME: u8 = 0xC1;

/// Stream-extension general flag: the chain is contiguous, no table entries.
pub const GEN_FLAG_NO_FAT_CHAIN: u8 = 0x02;

// Attribute bits
pub const AM_RDO: u8 = 0x01;
pub const AM_HID: u8 = 0x02;
pub const AM_SYS: u8 = 0x04;
pub const AM_VOL: u8 = 0x08;
pub const AM_LFN: u8 = 0x0F;
pub const AM_DIR: u8 = 0x10;
pub const AM_ARC: u8 = 0x20;
pub const AM_MASK: u8 = 0x3F;

// NT reserved byte case flags
pub const NS_BODY_LOWER: u8 = 0x08;
pub const NS_EXT_LOWER: u8 = 0x10;

#[inline]
pub fn ld16(buf: &[u8], ofs: usize) -> u16 {
    LittleEndian::read_u16(&buf[ofs..ofs + 2])
}

#[inline]
pub fn ld32(buf: &[u8], ofs: usize) -> u32 {
    LittleEndian::read_u32(&buf[ofs..ofs + 4])
}

#[inline]
pub fn ld64(buf: &[u8], ofs: usize) -> u64 {
    LittleEndian::read_u64(&buf[ofs..ofs + 8])
}

#[inline]
pub fn st16(buf: &mut [u8], ofs: usize, val: u16) {
    LittleEndian::write_u16(&mut buf[ofs..ofs + 2], val)
}

#[inline]
pub fn st32(buf: &mut [u8], ofs: usize, val: u32) {
    LittleEndian::write_u32(&mut buf[ofs..ofs + 4], val)
}

#[inline]
pub fn st64(buf: &mut [u8], ofs: usize, val: u64) {
    LittleEndian::write_u64(&mut buf[ofs..ofs + 8], val)
}

/// Read-only view of a FAT12/16/32 boot sector.
#[derive(Clone, Copy)]
pub struct BootSector<'a>(pub &'a [u8]);

impl<'a> BootSector<'a> {
    pub fn signature(&self) -> u16 {
        ld16(self.0, BS_55AA)
    }

    pub fn jump(&self) -> u8 {
        self.0[BS_JMP_BOOT]
    }

    pub fn is_exfat(&self) -> bool {
        &self.0[BS_JMP_BOOT..BS_JMP_BOOT + 11] == b"\xEB\x76\x90EXFAT   "
    }

    pub fn bytes_per_sector(&self) -> u16 {
        ld16(self.0, BPB_BYTS_PER_SEC)
    }

    pub fn sectors_per_cluster(&self) -> u8 {
        self.0[BPB_SEC_PER_CLUS]
    }

    pub fn reserved_sectors(&self) -> u16 {
        ld16(self.0, BPB_RSVD_SEC_CNT)
    }

    pub fn num_fats(&self) -> u8 {
        self.0[BPB_NUM_FATS]
    }

    pub fn root_entries(&self) -> u16 {
        ld16(self.0, BPB_ROOT_ENT_CNT)
    }

    pub fn total_sectors(&self) -> u32 {
        match ld16(self.0, BPB_TOT_SEC16) {
            0 => ld32(self.0, BPB_TOT_SEC32),
            n => n as u32,
        }
    }

    pub fn fat_size(&self) -> u32 {
        match ld16(self.0, BPB_FAT_SZ16) {
            0 => ld32(self.0, BPB_FAT_SZ32),
            n => n as u32,
        }
    }

    pub fn fs_version32(&self) -> u16 {
        ld16(self.0, BPB_FS_VER32)
    }

    pub fn root_cluster32(&self) -> u32 {
        ld32(self.0, BPB_ROOT_CLUS32)
    }

    pub fn fsinfo_sector(&self) -> u16 {
        ld16(self.0, BPB_FS_INFO32)
    }

    pub fn media(&self) -> u8 {
        self.0[BPB_MEDIA]
    }

    /// Volume serial and label from the extended boot record, if present.
    pub fn serial_and_label(&self, fat32: bool) -> Option<(u32, [u8; 11])> {
        let (sig, id, lab) = if fat32 {
            (BS_BOOT_SIG32, BS_VOL_ID32, BS_VOL_LAB32)
        } else {
            (BS_BOOT_SIG, BS_VOL_ID, BS_VOL_LAB)
        };
        if self.0[sig] != 0x29 {
            return None;
        }
        let mut label = [0u8; 11];
        label.copy_from_slice(&self.0[lab..lab + 11]);
        Some((ld32(self.0, id), label))
    }

    /// BPB plausibility check for volumes that omit the boot signature.
    pub fn is_plausible(&self) -> bool {
        let bps = self.bytes_per_sector();
        let spc = self.sectors_per_cluster();
        let jmp = self.jump();
        (jmp == 0xEB || jmp == 0xE9 || jmp == 0xE8)
            && bps.is_power_of_two()
            && (512..=4096).contains(&bps)
            && spc != 0
            && spc.is_power_of_two()
            && self.reserved_sectors() != 0
            && (1..=2).contains(&self.num_fats())
            && self.root_entries() != 0
            && (ld16(self.0, BPB_TOT_SEC16) >= 128 || ld32(self.0, BPB_TOT_SEC32) >= 0x10000)
            && ld16(self.0, BPB_FAT_SZ16) != 0
    }

    pub fn declares_fat32(&self) -> bool {
        &self.0[BS_FIL_SYS_TYPE32..BS_FIL_SYS_TYPE32 + 8] == b"FAT32   "
    }
}

/// Read-only view of an exFAT volume boot record.
#[derive(Clone, Copy)]
pub struct ExfatBootRecord<'a>(pub &'a [u8]);

impl<'a> ExfatBootRecord<'a> {
    pub fn zeroed_region_ok(&self) -> bool {
        self.0[BPB_ZEROED_EX..BPB_ZEROED_EX + 53].iter().all(|&b| b == 0)
    }

    pub fn volume_offset(&self) -> u64 {
        ld64(self.0, BPB_VOL_OFS_EX)
    }

    pub fn total_sectors(&self) -> u64 {
        ld64(self.0, BPB_TOT_SEC_EX)
    }

    pub fn fat_offset(&self) -> u32 {
        ld32(self.0, BPB_FAT_OFS_EX)
    }

    pub fn fat_size(&self) -> u32 {
        ld32(self.0, BPB_FAT_SZ_EX)
    }

    pub fn data_offset(&self) -> u32 {
        ld32(self.0, BPB_DATA_OFS_EX)
    }

    pub fn cluster_count(&self) -> u32 {
        ld32(self.0, BPB_NUM_CLUS_EX)
    }

    pub fn root_cluster(&self) -> u32 {
        ld32(self.0, BPB_ROOT_CLUS_EX)
    }

    pub fn serial(&self) -> u32 {
        ld32(self.0, BPB_VOL_ID_EX)
    }

    pub fn version(&self) -> u16 {
        ld16(self.0, BPB_FS_VER_EX)
    }

    pub fn bytes_per_sector_shift(&self) -> u8 {
        self.0[BPB_BYTS_PER_SEC_EX]
    }

    pub fn sectors_per_cluster_shift(&self) -> u8 {
        self.0[BPB_SEC_PER_CLUS_EX]
    }

    pub fn num_fats(&self) -> u8 {
        self.0[BPB_NUM_FATS_EX]
    }
}

/// Read-only view of a 32-byte short-name directory entry.
#[derive(Clone, Copy)]
pub struct SfnEntry<'a>(pub &'a [u8]);

impl<'a> SfnEntry<'a> {
    pub fn name(&self) -> &'a [u8] {
        &self.0[DIR_NAME..DIR_NAME + 11]
    }

    pub fn attr(&self) -> u8 {
        self.0[DIR_ATTR]
    }

    pub fn nt_flags(&self) -> u8 {
        self.0[DIR_NTRES]
    }

    pub fn size(&self) -> u32 {
        ld32(self.0, DIR_FILE_SIZE)
    }

    /// Start cluster; the high half is only meaningful on FAT32.
    pub fn cluster(&self, fat32: bool) -> u32 {
        let lo = ld16(self.0, DIR_FST_CLUS_LO) as u32;
        if fat32 {
            lo | (ld16(self.0, DIR_FST_CLUS_HI) as u32) << 16
        } else {
            lo
        }
    }

    /// Packed modification date (high half) and time (low half).
    pub fn modified(&self) -> u32 {
        ld32(self.0, DIR_MOD_TIME)
    }
}

/// Mutable view of a 32-byte short-name directory entry.
pub struct SfnEntryMut<'a>(pub &'a mut [u8]);

impl<'a> SfnEntryMut<'a> {
    pub fn set_name(&mut self, name: &[u8; 11]) {
        self.0[DIR_NAME..DIR_NAME + 11].copy_from_slice(name);
    }

    pub fn set_attr(&mut self, attr: u8) {
        self.0[DIR_ATTR] = attr;
    }

    pub fn set_nt_flags(&mut self, flags: u8) {
        self.0[DIR_NTRES] = flags;
    }

    pub fn set_size(&mut self, size: u32) {
        st32(self.0, DIR_FILE_SIZE, size);
    }

    pub fn set_cluster(&mut self, cluster: u32, fat32: bool) {
        st16(self.0, DIR_FST_CLUS_LO, cluster as u16);
        if fat32 {
            st16(self.0, DIR_FST_CLUS_HI, (cluster >> 16) as u16);
        }
    }

    pub fn set_modified(&mut self, stamp: u32) {
        st32(self.0, DIR_MOD_TIME, stamp);
    }

    pub fn set_created(&mut self, stamp: u32) {
        st32(self.0, DIR_CRT_TIME, stamp);
    }

    pub fn set_accessed_date(&mut self, date: u16) {
        st16(self.0, DIR_LST_ACC_DATE, date);
    }
}
