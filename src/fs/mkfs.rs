//! Volume creation: lays down a FAT12/16/32 or exFAT volume on a drive or on
//! one of its partitions, optionally partitioning the drive first.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::layout::*;
use super::name::wtoupper;
use super::volume::{FatKind, VolumeOptions};
use crate::device::{BlockDevice, IoctlRequest};
use crate::error::{FsError, FsResult};
use crate::partition::gpt::{GPT_ALIGN_BYTES, GPT_ENTRIES, GPT_ENTRY_SIZE};
use crate::partition::{create_partitions, set_system_id, PartitionStyle, PartitionTable};

/// Format flags: FAT12/16 allowed.
pub const FM_FAT: u8 = 0x01;
/// FAT32 allowed.
pub const FM_FAT32: u8 = 0x02;
/// exFAT allowed.
pub const FM_EXFAT: u8 = 0x04;
pub const FM_ANY: u8 = FM_FAT | FM_FAT32 | FM_EXFAT;
/// Super-floppy: no partition table, the volume starts at sector 0.
pub const FM_SFD: u8 = 0x08;

/// Zero-fill chunk, in sectors.
const WORK_SECTORS: u64 = 64;
/// Classic DOS track length; MBR volumes start one track in.
const SECTORS_PER_TRACK: u64 = 63;
/// Auto cluster-size thresholds for FAT12/16, in units of 4K sectors.
const CLUSTER_STEPS: [u64; 6] = [1, 4, 16, 64, 256, 512];
/// Auto cluster-size thresholds for FAT32, in units of 128K sectors.
const CLUSTER_STEPS_32: [u64; 6] = [1, 2, 4, 8, 16, 32];

/// Parameters of a format request. Zero fields select defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MkfsOptions {
    /// Combination of `FM_*` flags.
    pub fmt: u8,
    /// Number of FAT copies, 1 or 2.
    pub n_fat: u8,
    /// Data area alignment in sectors; 0 asks the device.
    pub align: u32,
    /// Root directory entries on FAT12/16.
    pub n_root: u32,
    /// Cluster size in bytes; 0 picks one from the volume size.
    pub au_size: u32,
    /// Partition table written when the drive is partitioned.
    pub style: PartitionStyle,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            fmt: FM_ANY,
            n_fat: 0,
            align: 0,
            n_root: 0,
            au_size: 0,
            style: PartitionStyle::Auto,
        }
    }
}

/// Rotating checksum used by the exFAT boot region and up-case table.
fn xsum32(dat: u8, sum: u32) -> u32 {
    sum.rotate_right(1).wrapping_add(dat as u32)
}

/// Write `data` at `sect`, then zeros until `total` sectors are covered.
fn write_region(dev: &dyn BlockDevice, ss: u32, sect: u64, total: u64, data: &[u8]) -> FsResult<()> {
    let ssz = ss as usize;
    let head = (data.len().div_ceil(ssz) as u64).min(total);
    if head > 0 {
        let mut buf = vec![0u8; head as usize * ssz];
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        dev.write(&buf, sect, head as u32)?;
    }

    let zeros = vec![0u8; WORK_SECTORS as usize * ssz];
    let mut at = sect + head;
    let mut left = total - head;
    while left > 0 {
        let n = left.min(WORK_SECTORS);
        dev.write(&zeros[..n as usize * ssz], at, n as u32)?;
        at += n;
        left -= n;
    }
    Ok(())
}

/// Compressed exFAT up-case table and its checksum.
///
/// Runs of 128 or more characters without a case mapping are stored as
/// `0xFFFF, length`.
pub(crate) fn upcase_table() -> (Vec<u8>, u32) {
    let mut out = Vec::with_capacity(6 * 1024);
    let mut si: u32 = 0;
    let mut run: u32 = 0;
    let mut state = 0u8;
    while si < 0x10000 {
        let ch: u16 = match state {
            0 => {
                let up = wtoupper(si as u16);
                if up != si as u16 {
                    si += 1;
                    up
                } else {
                    run = 1;
                    while si + run < 0x10000 && wtoupper((si + run) as u16) == (si + run) as u16 {
                        run += 1;
                    }
                    if run >= 128 {
                        state = 2;
                        0xFFFF
                    } else {
                        let c = si as u16;
                        si += 1;
                        run -= 1;
                        state = if run == 0 { 0 } else { 1 };
                        c
                    }
                }
            }
            1 => {
                let c = si as u16;
                si += 1;
                run -= 1;
                if run == 0 {
                    state = 0;
                }
                c
            }
            _ => {
                si += run;
                state = 0;
                run as u16
            }
        };
        out.extend_from_slice(&ch.to_le_bytes());
    }
    let sum = out.iter().fold(0u32, |s, &b| xsum32(b, s));
    (out, sum)
}

/// Where the new volume goes.
struct Placement {
    b_vol: u64,
    sz_vol: u64,
    /// Partition slot being reformatted, 0 when the volume is new.
    ipart: u8,
    gpt: bool,
}

fn locate(
    dev: &dyn BlockDevice,
    ss: u32,
    partition: u8,
    opts: &MkfsOptions,
    sfd: bool,
) -> FsResult<Placement> {
    if partition != 0 {
        let table = PartitionTable::detect(dev, ss)?;
        let span = table
            .volume_spans()
            .into_iter()
            .find(|s| s.ordinal == partition && s.start_lba != 0)
            .ok_or(FsError::MkfsAborted("partition not found"))?;
        return Ok(Placement {
            b_vol: span.start_lba,
            sz_vol: span.sectors,
            ipart: partition,
            gpt: table.is_gpt(),
        });
    }

    let drive = dev
        .ioctl(IoctlRequest::GetSectorCount)?
        .value()
        .ok_or(FsError::DiskErr)?;
    let mut place = Placement {
        b_vol: 0,
        sz_vol: drive,
        ipart: 0,
        gpt: false,
    };
    if !sfd {
        if opts.style.use_gpt(drive) {
            place.gpt = true;
            place.b_vol = GPT_ALIGN_BYTES / ss as u64;
            let table = (GPT_ENTRIES * GPT_ENTRY_SIZE) as u64 / ss as u64;
            place.sz_vol = drive.saturating_sub(place.b_vol + table + 1);
        } else if drive > SECTORS_PER_TRACK {
            place.b_vol = SECTORS_PER_TRACK;
            place.sz_vol = drive - SECTORS_PER_TRACK;
        }
    }
    Ok(place)
}

/// Create a filesystem on `dev`.
///
/// `partition` 0 formats the whole drive (partitioning it first unless
/// `FM_SFD` is given); 1.. reformats that existing partition.
pub(crate) fn format(
    dev: &dyn BlockDevice,
    partition: u8,
    opts: &MkfsOptions,
    env: &VolumeOptions,
) -> FsResult<FatKind> {
    let status = dev.initialize();
    if status.no_init || status.no_disk {
        return Err(FsError::NotReady);
    }
    if status.protected {
        return Err(FsError::WriteProtected);
    }

    let mut sz_blk = opts.align as u64;
    if sz_blk == 0 {
        sz_blk = dev
            .ioctl(IoctlRequest::GetBlockSize)
            .ok()
            .and_then(|r| r.value())
            .unwrap_or(1);
    }
    if sz_blk == 0 || sz_blk > 0x8000 || !sz_blk.is_power_of_two() {
        sz_blk = 1;
    }
    let ss = dev
        .ioctl(IoctlRequest::GetSectorSize)?
        .value()
        .ok_or(FsError::DiskErr)? as u32;
    if !ss.is_power_of_two() || ss < env.min_sector_size || ss > env.max_sector_size {
        return Err(FsError::DiskErr);
    }

    let fsopt = opts.fmt & (FM_ANY | FM_SFD);
    let n_fat = if (1..=2).contains(&opts.n_fat) {
        opts.n_fat as u32
    } else {
        1
    };
    let per_sect = ss / SZDIRE as u32;
    let n_root = if (1..=32768).contains(&opts.n_root) && opts.n_root % per_sect == 0 {
        opts.n_root
    } else {
        512
    };
    let mut sz_au = if opts.au_size <= 0x100_0000 && (opts.au_size & opts.au_size.wrapping_sub(1)) == 0
    {
        (opts.au_size / ss) as u64
    } else {
        0
    };

    let place = locate(dev, ss, partition, opts, fsopt & FM_SFD != 0)?;
    let (b_vol, sz_vol) = (place.b_vol, place.sz_vol);
    if sz_vol < 128 {
        return Err(FsError::MkfsAborted("volume smaller than 128 sectors"));
    }

    let kind = if fsopt & FM_EXFAT != 0
        && env.exfat
        && ((fsopt & FM_ANY) == FM_EXFAT || sz_vol >= 0x400_0000 || sz_au > 128)
    {
        FatKind::ExFat
    } else {
        if sz_vol >= 0x1_0000_0000 {
            return Err(FsError::MkfsAborted("volume too large for FAT"));
        }
        if sz_au > 128 {
            sz_au = 128;
        }
        if fsopt & FM_FAT32 != 0 && fsopt & FM_FAT == 0 {
            FatKind::Fat32
        } else if fsopt & FM_FAT == 0 {
            return Err(FsError::InvalidParameter);
        } else {
            FatKind::Fat16
        }
    };

    let vsn = (sz_vol as u32).wrapping_add(env.timestamp());
    if env.trim {
        // Advisory; devices that cannot trim just say so.
        if let Err(e) = dev.ioctl(IoctlRequest::Trim {
            start: b_vol,
            end: b_vol + sz_vol - 1,
        }) {
            debug!("trim before format ignored: {e}");
        }
    }

    let geo = Geometry {
        ss,
        b_vol,
        sz_vol,
        sz_blk,
        vsn,
    };
    let kind = if kind == FatKind::ExFat {
        make_exfat(dev, &geo, sz_au)?
    } else {
        make_fat(dev, &geo, kind, sz_au, n_fat, n_root, fsopt)?
    };

    let sys = match kind {
        FatKind::ExFat => 0x07,
        FatKind::Fat32 => 0x0C,
        _ if sz_vol >= 0x1_0000 => 0x06,
        FatKind::Fat16 => 0x04,
        FatKind::Fat12 => 0x01,
    };
    if place.ipart != 0 {
        if !place.gpt {
            set_system_id(dev, ss, place.ipart, sys)?;
        }
    } else if fsopt & FM_SFD == 0 {
        let style = if place.gpt {
            PartitionStyle::Gpt
        } else {
            PartitionStyle::Mbr
        };
        create_partitions(dev, &[sz_vol], sys, style)?;
    }
    dev.ioctl(IoctlRequest::Sync)?;

    info!(
        "formatted {} volume: {} sectors at {}, serial {:08X}",
        kind, sz_vol, b_vol, vsn
    );
    Ok(kind)
}

struct Geometry {
    ss: u32,
    b_vol: u64,
    sz_vol: u64,
    sz_blk: u64,
    vsn: u32,
}

fn make_exfat(dev: &dyn BlockDevice, geo: &Geometry, sz_au: u64) -> FsResult<FatKind> {
    let Geometry {
        ss,
        b_vol,
        sz_vol,
        sz_blk,
        vsn,
    } = *geo;
    let ssz = ss as u64;
    if sz_vol < 0x1000 {
        return Err(FsError::MkfsAborted("volume too small for exFAT"));
    }
    let sz_au = match sz_au {
        0 if sz_vol >= 0x400_0000 => 256,
        0 if sz_vol >= 0x8_0000 => 64,
        0 => 8,
        n => n,
    };

    let b_fat = b_vol + 32;
    let sz_fat = ((sz_vol / sz_au + 2) * 4).div_ceil(ssz);
    let b_data = (b_fat + sz_fat).div_ceil(sz_blk) * sz_blk;
    if b_data - b_vol >= sz_vol / 2 {
        return Err(FsError::MkfsAborted("volume too small for exFAT"));
    }
    let n_clst = (sz_vol - (b_data - b_vol)) / sz_au;
    if n_clst < 16 {
        return Err(FsError::MkfsAborted("too few clusters"));
    }
    if n_clst > FatKind::ExFat.max_clusters() as u64 {
        return Err(FsError::MkfsAborted("too many clusters"));
    }
    let n_clst = n_clst as u32;
    let au_bytes = sz_au * ssz;

    let szb_bit = (n_clst as u64).div_ceil(8);
    let (upcase, upcase_sum) = upcase_table();
    // Bitmap, up-case table and root directory, in cluster order.
    let clen = [
        szb_bit.div_ceil(au_bytes),
        (upcase.len() as u64).div_ceil(au_bytes),
        1,
    ];
    let used: u64 = clen.iter().sum();

    write_region(
        dev,
        ss,
        b_data + sz_au * clen[0],
        sz_au * clen[1],
        &upcase,
    )?;

    let mut bitmap = vec![0u8; used.div_ceil(8) as usize];
    for i in 0..used as usize {
        bitmap[i / 8] |= 1 << (i % 8);
    }
    write_region(dev, ss, b_data, szb_bit.div_ceil(ssz), &bitmap)?;

    let mut fat = Vec::with_capacity(((used + 2) * 4) as usize);
    fat.extend_from_slice(&0xFFFF_FFF8u32.to_le_bytes());
    fat.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    let mut clu = 2u32;
    for &len in &clen {
        for k in 0..len {
            let next = if k + 1 == len { 0xFFFF_FFFF } else { clu + 1 };
            fat.extend_from_slice(&next.to_le_bytes());
            clu += 1;
        }
    }
    write_region(dev, ss, b_fat, sz_fat, &fat)?;

    let mut root = [0u8; SZDIRE * 3];
    root[0] = ET_VLABEL;
    root[SZDIRE] = ET_BITMAP;
    st32(&mut root, SZDIRE + XENT_FST_CLUS, 2);
    st64(&mut root, SZDIRE + XENT_DATA_LEN, szb_bit);
    root[SZDIRE * 2] = ET_UPCASE;
    st32(&mut root, SZDIRE * 2 + XENT_UPCASE_SUM, upcase_sum);
    st32(&mut root, SZDIRE * 2 + XENT_FST_CLUS, 2 + clen[0] as u32);
    st64(&mut root, SZDIRE * 2 + XENT_DATA_LEN, upcase.len() as u64);
    let root_clust = 2 + (clen[0] + clen[1]) as u32;
    write_region(dev, ss, b_data + sz_au * (clen[0] + clen[1]), sz_au, &root)?;

    // Main and backup boot regions, 12 sectors each.
    let mut sect = b_vol;
    for _ in 0..2 {
        let mut buf = vec![0u8; ss as usize];
        buf[BS_JMP_BOOT..BS_JMP_BOOT + 11].copy_from_slice(b"\xEB\x76\x90EXFAT   ");
        st64(&mut buf, BPB_VOL_OFS_EX, b_vol);
        st64(&mut buf, BPB_TOT_SEC_EX, sz_vol);
        st32(&mut buf, BPB_FAT_OFS_EX, (b_fat - b_vol) as u32);
        st32(&mut buf, BPB_FAT_SZ_EX, sz_fat as u32);
        st32(&mut buf, BPB_DATA_OFS_EX, (b_data - b_vol) as u32);
        st32(&mut buf, BPB_NUM_CLUS_EX, n_clst);
        st32(&mut buf, BPB_ROOT_CLUS_EX, root_clust);
        st32(&mut buf, BPB_VOL_ID_EX, vsn);
        st16(&mut buf, BPB_FS_VER_EX, 0x100);
        buf[BPB_BYTS_PER_SEC_EX] = ss.trailing_zeros() as u8;
        buf[BPB_SEC_PER_CLUS_EX] = sz_au.trailing_zeros() as u8;
        buf[BPB_NUM_FATS_EX] = 1;
        buf[BPB_DRV_NUM_EX] = 0x80;
        st16(&mut buf, BS_BOOT_CODE_EX, 0xFEEB);
        st16(&mut buf, BS_55AA, BOOT_SIGNATURE);
        let mut sum = boot_sum(&buf, 0);
        dev.write(&buf, sect, 1)?;
        sect += 1;

        // Extended boot sectors.
        buf.fill(0);
        st16(&mut buf, ss as usize - 2, BOOT_SIGNATURE);
        for _ in 1..9 {
            sum = buf.iter().fold(sum, |s, &b| xsum32(b, s));
            dev.write(&buf, sect, 1)?;
            sect += 1;
        }
        // OEM parameters and reserved.
        buf.fill(0);
        for _ in 9..11 {
            sum = buf.iter().fold(sum, |s, &b| xsum32(b, s));
            dev.write(&buf, sect, 1)?;
            sect += 1;
        }
        for word in buf.chunks_exact_mut(4) {
            word.copy_from_slice(&sum.to_le_bytes());
        }
        dev.write(&buf, sect, 1)?;
        sect += 1;
    }

    debug!(
        "exFAT layout: fat at {b_fat} ({sz_fat} sectors), data at {b_data}, {n_clst} clusters of {sz_au} sectors"
    );
    Ok(FatKind::ExFat)
}

/// Checksum of the main boot sector, skipping the volume flags and the
/// percent-in-use byte.
pub(crate) fn boot_sum(sector: &[u8], sum: u32) -> u32 {
    sector.iter().enumerate().fold(sum, |s, (i, &b)| {
        if i == BPB_VOL_FLAG_EX || i == BPB_VOL_FLAG_EX + 1 || i == BPB_PERC_IN_USE_EX {
            s
        } else {
            xsum32(b, s)
        }
    })
}

fn make_fat(
    dev: &dyn BlockDevice,
    geo: &Geometry,
    mut kind: FatKind,
    mut sz_au: u64,
    n_fat: u32,
    n_root: u32,
    fsopt: u8,
) -> FsResult<FatKind> {
    let Geometry {
        ss,
        b_vol,
        sz_vol,
        sz_blk,
        vsn,
    } = *geo;
    let ssz = ss as u64;
    let n_fat64 = n_fat as u64;

    let (pau, sz_rsv, sz_fat, sz_dir, n_clst) = loop {
        let mut pau = sz_au;
        let (mut sz_rsv, mut sz_fat, sz_dir);
        if kind == FatKind::Fat32 {
            if pau == 0 {
                let n = sz_vol / 0x2_0000;
                pau = 1 << CLUSTER_STEPS_32.iter().take_while(|&&c| c <= n).count();
            }
            let n_clst = sz_vol / pau;
            sz_fat = (n_clst * 4 + 8).div_ceil(ssz);
            sz_rsv = 32;
            sz_dir = 0;
            if n_clst <= FatKind::Fat16.max_clusters() as u64
                || n_clst > FatKind::Fat32.max_clusters() as u64
            {
                return Err(FsError::MkfsAborted("cluster count does not suit FAT32"));
            }
        } else {
            if pau == 0 {
                let n = sz_vol / 0x1000;
                pau = 1 << CLUSTER_STEPS.iter().take_while(|&&c| c <= n).count();
            }
            let n_clst = sz_vol / pau;
            let bytes = if n_clst > FatKind::Fat12.max_clusters() as u64 {
                n_clst * 2 + 4
            } else {
                kind = FatKind::Fat12;
                (n_clst * 3 + 1) / 2 + 3
            };
            sz_fat = bytes.div_ceil(ssz);
            sz_rsv = 1;
            sz_dir = n_root as u64 * SZDIRE as u64 / ssz;
        }
        let b_fat = b_vol + sz_rsv;
        let b_data = b_fat + sz_fat * n_fat64 + sz_dir;

        // Align the data area to the erase block.
        let mut n = b_data.div_ceil(sz_blk) * sz_blk - b_data;
        if kind == FatKind::Fat32 {
            sz_rsv += n;
        } else {
            if n % n_fat64 != 0 {
                n -= 1;
                sz_rsv += 1;
            }
            sz_fat += n / n_fat64;
        }

        if sz_vol < b_data + pau * 16 - b_vol {
            return Err(FsError::MkfsAborted("volume too small"));
        }
        let n_clst = (sz_vol - sz_rsv - sz_fat * n_fat64 - sz_dir) / pau;
        if kind == FatKind::Fat32 && n_clst <= FatKind::Fat16.max_clusters() as u64 {
            if sz_au == 0 && pau / 2 != 0 {
                sz_au = pau / 2;
                continue;
            }
            return Err(FsError::MkfsAborted("too few clusters for FAT32"));
        }
        if kind == FatKind::Fat16 {
            if n_clst > FatKind::Fat16.max_clusters() as u64 {
                if sz_au == 0 && pau * 2 <= 64 {
                    sz_au = pau * 2;
                    continue;
                }
                if fsopt & FM_FAT32 != 0 {
                    kind = FatKind::Fat32;
                    continue;
                }
                if sz_au == 0 && pau * 2 <= 128 {
                    sz_au = pau * 2;
                    continue;
                }
                return Err(FsError::MkfsAborted("too many clusters for FAT16"));
            }
            if n_clst <= FatKind::Fat12.max_clusters() as u64 {
                if sz_au == 0 && pau * 2 <= 128 {
                    sz_au = pau * 2;
                    continue;
                }
                return Err(FsError::MkfsAborted("too few clusters for FAT16"));
            }
        }
        if kind == FatKind::Fat12 && n_clst > FatKind::Fat12.max_clusters() as u64 {
            return Err(FsError::MkfsAborted("too many clusters for FAT12"));
        }
        break (pau, sz_rsv, sz_fat, sz_dir, n_clst as u32);
    };

    let fat32 = kind == FatKind::Fat32;
    let mut vbr = vec![0u8; ss as usize];
    vbr[BS_JMP_BOOT..BS_JMP_BOOT + 11].copy_from_slice(b"\xEB\xFE\x90MSDOS5.0");
    st16(&mut vbr, BPB_BYTS_PER_SEC, ss as u16);
    vbr[BPB_SEC_PER_CLUS] = pau as u8;
    st16(&mut vbr, BPB_RSVD_SEC_CNT, sz_rsv as u16);
    vbr[BPB_NUM_FATS] = n_fat as u8;
    st16(&mut vbr, BPB_ROOT_ENT_CNT, if fat32 { 0 } else { n_root as u16 });
    if sz_vol < 0x1_0000 {
        st16(&mut vbr, BPB_TOT_SEC16, sz_vol as u16);
    } else {
        st32(&mut vbr, BPB_TOT_SEC32, sz_vol as u32);
    }
    vbr[BPB_MEDIA] = 0xF8;
    st16(&mut vbr, BPB_SEC_PER_TRK, 63);
    st16(&mut vbr, BPB_NUM_HEADS, 255);
    st32(&mut vbr, BPB_HIDD_SEC, b_vol as u32);
    if fat32 {
        st32(&mut vbr, BS_VOL_ID32, vsn);
        st32(&mut vbr, BPB_FAT_SZ32, sz_fat as u32);
        st32(&mut vbr, BPB_ROOT_CLUS32, 2);
        st16(&mut vbr, BPB_FS_INFO32, 1);
        st16(&mut vbr, BPB_BK_BOOT_SEC32, 6);
        vbr[BS_DRV_NUM32] = 0x80;
        vbr[BS_BOOT_SIG32] = 0x29;
        vbr[BS_VOL_LAB32..BS_VOL_LAB32 + 19].copy_from_slice(b"NO NAME    FAT32   ");
    } else {
        st32(&mut vbr, BS_VOL_ID, vsn);
        st16(&mut vbr, BPB_FAT_SZ16, sz_fat as u16);
        vbr[BS_DRV_NUM] = 0x80;
        vbr[BS_BOOT_SIG] = 0x29;
        vbr[BS_VOL_LAB..BS_VOL_LAB + 19].copy_from_slice(b"NO NAME    FAT     ");
    }
    st16(&mut vbr, BS_55AA, BOOT_SIGNATURE);
    dev.write(&vbr, b_vol, 1)?;

    if fat32 {
        dev.write(&vbr, b_vol + 6, 1)?;
        let mut fsi = vec![0u8; ss as usize];
        st32(&mut fsi, FSI_LEAD_SIG, FSI_LEAD_SIGNATURE);
        st32(&mut fsi, FSI_STRUC_SIG, FSI_STRUC_SIGNATURE);
        st32(&mut fsi, FSI_FREE_COUNT, n_clst - 1);
        st32(&mut fsi, FSI_NXT_FREE, 2);
        st16(&mut fsi, BS_55AA, BOOT_SIGNATURE);
        dev.write(&fsi, b_vol + 7, 1)?;
        dev.write(&fsi, b_vol + 1, 1)?;
    }

    let head: Vec<u8> = match kind {
        FatKind::Fat32 => [0xFFFF_FFF8u32, 0xFFFF_FFFF, 0x0FFF_FFFF]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        FatKind::Fat12 => vec![0xF8, 0xFF, 0xFF],
        _ => vec![0xF8, 0xFF, 0xFF, 0xFF],
    };
    let b_fat = b_vol + sz_rsv;
    for i in 0..n_fat64 {
        write_region(dev, ss, b_fat + i * sz_fat, sz_fat, &head)?;
    }
    let root_sectors = if fat32 { pau } else { sz_dir };
    write_region(dev, ss, b_fat + n_fat64 * sz_fat, root_sectors, &[])?;

    debug!(
        "{kind} layout: {sz_rsv} reserved, {n_fat} FATs of {sz_fat} sectors, {n_clst} clusters of {pau} sectors"
    );
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::device::RamDisk;
    use crate::fs::volume::Volume;
    use std::sync::Arc;

    fn env() -> VolumeOptions {
        VolumeOptions::from_config(&FsConfig {
            rtc: false,
            ..FsConfig::default()
        })
    }

    fn mount(disk: Arc<RamDisk>) -> FsResult<Volume> {
        Volume::mount(disk, 0, 0, 1, env())
    }

    fn sfd(fmt: u8) -> MkfsOptions {
        MkfsOptions {
            fmt: fmt | FM_SFD,
            ..MkfsOptions::default()
        }
    }

    #[test]
    fn test_upcase_table_expands_to_mapping() {
        let (table, _) = upcase_table();
        let words: Vec<u16> = table
            .chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
            .collect();
        let mut map = Vec::with_capacity(0x10000);
        let mut it = words.iter();
        while let Some(&w) = it.next() {
            if w == 0xFFFF {
                let skip = *it.next().unwrap();
                for _ in 0..skip {
                    let c = map.len() as u16;
                    map.push(c);
                }
            } else {
                map.push(w);
            }
        }
        assert_eq!(map.len(), 0x10000);
        for c in [b'a' as u16, b'z' as u16, 0xE9, 0x3B1, 0x430, 0xFF41] {
            assert_eq!(map[c as usize], wtoupper(c));
        }
        assert_eq!(map[b'A' as usize], b'A' as u16);
    }

    #[test]
    fn test_small_drive_gets_fat12() {
        let disk = Arc::new(RamDisk::new(4096, 512));
        let kind = format(disk.as_ref(), 0, &sfd(FM_ANY), &env()).unwrap();
        assert_eq!(kind, FatKind::Fat12);
        let vol = mount(disk).unwrap();
        assert_eq!(vol.kind, FatKind::Fat12);
        assert_eq!(vol.n_fats, 1);
        assert_eq!(vol.n_rootdir, 512);
    }

    #[test]
    fn test_fat32_layout() {
        let disk = Arc::new(RamDisk::new(68_000, 512));
        let opts = MkfsOptions {
            au_size: 512,
            n_fat: 2,
            ..sfd(FM_FAT32)
        };
        format(disk.as_ref(), 0, &opts, &env()).unwrap();

        let image = disk.snapshot();
        assert_eq!(&image[..512], &image[6 * 512..7 * 512]);
        assert_eq!(ld32(&image[512..], FSI_LEAD_SIG), FSI_LEAD_SIGNATURE);

        let mut vol = mount(disk).unwrap();
        assert_eq!(vol.kind, FatKind::Fat32);
        assert_eq!(vol.n_fats, 2);
        assert_eq!(vol.dirbase, 2);
        assert_eq!(vol.count_free().unwrap(), vol.n_fatent - 3);
    }

    #[test]
    fn test_exfat_boot_checksum() {
        let disk = Arc::new(RamDisk::new(16_384, 512));
        format(disk.as_ref(), 0, &sfd(FM_EXFAT), &env()).unwrap();
        let image = disk.snapshot();

        let mut sum = boot_sum(&image[..512], 0);
        for s in 1..11 {
            sum = image[s * 512..(s + 1) * 512]
                .iter()
                .fold(sum, |acc, &b| xsum32(b, acc));
        }
        assert_eq!(ld32(&image, 11 * 512), sum);
        assert_eq!(ld32(&image, 11 * 512 + 508), sum);
        assert_eq!(&image[..12 * 512], &image[12 * 512..24 * 512]);

        let vol = mount(disk).unwrap();
        assert_eq!(vol.kind, FatKind::ExFat);
        assert_eq!(vol.csize, 8);
    }

    #[test]
    fn test_partitioned_drive_is_mountable() {
        let disk = Arc::new(RamDisk::new(32_768, 512));
        format(disk.as_ref(), 0, &MkfsOptions::default(), &env()).unwrap();
        let table = PartitionTable::detect(disk.as_ref(), 512).unwrap();
        let spans = table.volume_spans();
        assert_eq!(spans[0].start_lba, 63);
        assert_eq!(spans[0].sectors, 32_768 - 63);

        let vol = mount(disk).unwrap();
        assert_eq!(vol.volbase, 63);
        assert_eq!(vol.kind, FatKind::Fat16);
    }

    #[test]
    fn test_reformat_existing_partition() {
        let disk = Arc::new(RamDisk::new(40_000, 512));
        create_partitions(disk.as_ref(), &[50, 50], 0x06, PartitionStyle::Mbr).unwrap();
        let kind = format(disk.as_ref(), 2, &MkfsOptions::default(), &env()).unwrap();
        assert_eq!(kind, FatKind::Fat16);

        let mut mbr = [0u8; 512];
        disk.read(&mut mbr, 0, 1).unwrap();
        // Small FAT16 volume.
        assert_eq!(mbr[MBR_TABLE + SZ_PTE + PTE_SYSTEM], 0x04);

        let vol = Volume::mount(disk, 0, 2, 1, env()).unwrap();
        assert_eq!(vol.volbase, 20_063);
    }

    #[test]
    fn test_missing_partition_aborts() {
        let disk = RamDisk::new(8192, 512);
        create_partitions(&disk, &[100], 0x06, PartitionStyle::Mbr).unwrap();
        assert_eq!(
            format(&disk, 3, &MkfsOptions::default(), &env()),
            Err(FsError::MkfsAborted("partition not found"))
        );
    }

    #[test]
    fn test_rejects_tiny_and_protected_drives() {
        let disk = RamDisk::new(100, 512);
        assert!(matches!(
            format(&disk, 0, &sfd(FM_ANY), &env()),
            Err(FsError::MkfsAborted(_))
        ));
        let disk = RamDisk::new(4096, 512).write_protect(true);
        assert_eq!(
            format(&disk, 0, &sfd(FM_ANY), &env()),
            Err(FsError::WriteProtected)
        );
    }

    #[test]
    fn test_fat_only_without_fat_flag_is_invalid() {
        let disk = RamDisk::new(4096, 512);
        assert_eq!(
            format(&disk, 0, &sfd(0), &env()),
            Err(FsError::InvalidParameter)
        );
    }
}
