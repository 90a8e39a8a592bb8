//! Mounted volume state: geometry, the sector window, allocation hints and
//! the mount procedure that identifies the filesystem on a drive.

use std::sync::Arc;

use chrono::{Datelike, Local, Timelike};
use log::{debug, warn};
use serde::Serialize;

use super::chain::ParentRef;
use super::layout::*;
use super::window::{FatMirror, SectorWindow};
use crate::config::{FixedTimestamp, FsConfig};
use crate::device::{BlockDevice, IoctlRequest};
use crate::error::{FsError, FsResult};
use crate::partition::PartitionTable;

/// Entry-set buffer large enough for a 255 character exFAT name.
pub(crate) const DIRBUF_SIZE: usize = (MAX_LFN_CHARS + 44) / 15 * SZDIRE;

/// Filesystem sub-type, chosen once at mount time from the cluster count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FatKind {
    Fat12,
    Fat16,
    Fat32,
    ExFat,
}

impl FatKind {
    pub fn name(self) -> &'static str {
        match self {
            FatKind::Fat12 => "FAT12",
            FatKind::Fat16 => "FAT16",
            FatKind::Fat32 => "FAT32",
            FatKind::ExFat => "exFAT",
        }
    }

    /// Largest number of data clusters the sub-type can address.
    pub const fn max_clusters(self) -> u32 {
        match self {
            FatKind::Fat12 => 0xFF5,
            FatKind::Fat16 => 0xFFF5,
            FatKind::Fat32 => 0x0FFF_FFF5,
            FatKind::ExFat => 0x7FFF_FFFD,
        }
    }

    /// Legacy sub-type implied by a data cluster count.
    pub(crate) fn from_cluster_count(nclst: u32) -> Option<FatKind> {
        if nclst <= FatKind::Fat12.max_clusters() {
            Some(FatKind::Fat12)
        } else if nclst <= FatKind::Fat16.max_clusters() {
            Some(FatKind::Fat16)
        } else if nclst <= FatKind::Fat32.max_clusters() {
            Some(FatKind::Fat32)
        } else {
            None
        }
    }
}

impl std::fmt::Display for FatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-volume copy of the behaviour switches from [`FsConfig`].
#[derive(Debug, Clone)]
pub(crate) struct VolumeOptions {
    pub long_names: bool,
    pub exfat: bool,
    pub read_only: bool,
    pub trim: bool,
    pub fsinfo_trust: bool,
    pub rtc: bool,
    pub fixed_timestamp: FixedTimestamp,
    pub min_sector_size: u32,
    pub max_sector_size: u32,
}

impl VolumeOptions {
    /// Current time packed as a FAT timestamp: date in the high half, time
    /// in the low half.
    pub fn timestamp(&self) -> u32 {
        if self.rtc {
            let now = Local::now();
            pack_timestamp(
                now.year(),
                now.month(),
                now.day(),
                now.hour(),
                now.minute(),
                now.second(),
            )
        } else {
            let f = self.fixed_timestamp;
            pack_timestamp(f.year as i32, f.month as u32, f.day as u32, 0, 0, 0)
        }
    }

    pub fn from_config(cfg: &FsConfig) -> Self {
        Self {
            long_names: cfg.long_names,
            exfat: cfg.exfat && cfg.long_names,
            read_only: cfg.read_only,
            trim: cfg.trim,
            fsinfo_trust: cfg.fsinfo_trust,
            rtc: cfg.rtc,
            fixed_timestamp: cfg.fixed_timestamp,
            min_sector_size: cfg.min_sector_size,
            max_sector_size: cfg.max_sector_size,
        }
    }
}

/// What a candidate boot sector turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    Fat,
    ExFat,
    /// A valid boot record that is not a FAT volume (an MBR, typically).
    BootRecord,
    Invalid,
}

/// Current directory of a volume.
#[derive(Debug, Clone)]
pub(crate) struct CurrentDir {
    /// Start cluster, 0 for the root directory.
    pub sclust: u32,
    /// exFAT only: location of the directory's own entry-set.
    pub parent: ParentRef,
    /// Absolute path as stored on disk, `/` for the root.
    pub path: String,
}

impl Default for CurrentDir {
    fn default() -> Self {
        Self {
            sclust: 0,
            parent: ParentRef::default(),
            path: "/".to_string(),
        }
    }
}

pub(crate) struct Volume {
    pub dev: Arc<dyn BlockDevice>,
    pub kind: FatKind,
    pub pdrv: u8,
    /// Mount generation; handles carrying a different value are stale.
    pub id: u16,
    pub n_fats: u8,
    /// Sectors per cluster.
    pub csize: u32,
    pub ssize: u32,
    /// Root directory entries (FAT12/16 only).
    pub n_rootdir: u32,
    /// Number of FAT entries, i.e. data clusters + 2.
    pub n_fatent: u32,
    /// Sectors per FAT.
    pub fsize: u32,
    pub volbase: u64,
    pub fatbase: u64,
    /// Root directory start: a sector on FAT12/16, a cluster otherwise.
    pub dirbase: u64,
    pub database: u64,
    pub bitbase: u64,
    pub win: SectorWindow,
    /// Last allocated cluster, used as the allocation search hint.
    pub last_clst: u32,
    /// Free cluster count, `None` when unknown.
    pub free_clst: Option<u32>,
    pub fsi_enabled: bool,
    pub fsi_dirty: bool,
    pub cdir: CurrentDir,
    /// Long-name scratch, UTF-16 units terminated by 0.
    pub lfnbuf: Vec<u16>,
    /// exFAT entry-set scratch.
    pub dirbuf: Vec<u8>,
    pub opts: VolumeOptions,
}

impl Volume {
    /// Identify and mount the FAT volume found on `dev`.
    ///
    /// `partition` 0 scans for the first usable volume; 1.. forces a specific
    /// MBR slot or GPT basic-data entry.
    pub(crate) fn mount(
        dev: Arc<dyn BlockDevice>,
        pdrv: u8,
        partition: u8,
        id: u16,
        opts: VolumeOptions,
    ) -> FsResult<Volume> {
        let status = dev.initialize();
        if status.no_init || status.no_disk {
            return Err(FsError::NotReady);
        }

        let ssize = dev
            .ioctl(IoctlRequest::GetSectorSize)
            .map_err(FsError::from)?
            .value()
            .ok_or(FsError::DiskErr)? as u32;
        if !ssize.is_power_of_two() || ssize < opts.min_sector_size || ssize > opts.max_sector_size
        {
            return Err(FsError::DiskErr);
        }

        let mut win = SectorWindow::new(ssize as usize);
        let (bsect, probe) = find_volume(dev.as_ref(), &mut win, partition, opts.exfat)?;
        debug!("drive {pdrv}: volume probe at sector {bsect} -> {probe:?}");

        let mut vol = Volume {
            dev,
            kind: FatKind::Fat12,
            pdrv,
            id,
            n_fats: 0,
            csize: 0,
            ssize,
            n_rootdir: 0,
            n_fatent: 0,
            fsize: 0,
            volbase: bsect,
            fatbase: 0,
            dirbase: 0,
            database: 0,
            bitbase: 0,
            win,
            last_clst: u32::MAX,
            free_clst: None,
            fsi_enabled: false,
            fsi_dirty: false,
            cdir: CurrentDir::default(),
            lfnbuf: vec![0u16; MAX_LFN_CHARS + 1],
            dirbuf: vec![0u8; DIRBUF_SIZE],
            opts,
        };

        match probe {
            Probe::ExFat => vol.init_exfat(bsect)?,
            Probe::Fat => vol.init_fat(bsect)?,
            Probe::BootRecord | Probe::Invalid => return Err(FsError::NoFilesystem),
        }

        debug!(
            "drive {}: mounted {} ({} clusters of {} bytes, data at sector {})",
            vol.pdrv,
            vol.kind,
            vol.n_fatent - 2,
            vol.cluster_bytes(),
            vol.database
        );
        Ok(vol)
    }

    fn init_exfat(&mut self, bsect: u64) -> FsResult<()> {
        let (nclst, fat_ofs, data_ofs, root, maxlba) = {
            let vbr = ExfatBootRecord(&self.win.buf);
            if !vbr.zeroed_region_ok() || vbr.version() != 0x100 {
                return Err(FsError::NoFilesystem);
            }
            if 1u32.checked_shl(vbr.bytes_per_sector_shift() as u32) != Some(self.ssize) {
                return Err(FsError::NoFilesystem);
            }
            if vbr.num_fats() != 1 {
                return Err(FsError::NoFilesystem);
            }
            let shift = vbr.sectors_per_cluster_shift();
            if shift > 25 {
                return Err(FsError::NoFilesystem);
            }
            self.csize = 1 << shift;
            self.fsize = vbr.fat_size();
            self.n_fats = 1;
            (
                vbr.cluster_count(),
                vbr.fat_offset(),
                vbr.data_offset(),
                vbr.root_cluster(),
                vbr.total_sectors() + bsect,
            )
        };
        if nclst > FatKind::ExFat.max_clusters() {
            return Err(FsError::NoFilesystem);
        }
        self.kind = FatKind::ExFat;
        self.n_fatent = nclst + 2;
        self.fatbase = bsect + fat_ofs as u64;
        self.database = bsect + data_ofs as u64;
        if maxlba < self.database + nclst as u64 * self.csize as u64 {
            return Err(FsError::NoFilesystem);
        }
        self.dirbase = root as u64;

        // The allocation bitmap entry must sit in the first cluster of the root.
        let root_sect = self.clst2sect(root);
        if root_sect == 0 {
            return Err(FsError::NoFilesystem);
        }
        let mut bcl = None;
        'search: for so in 0..self.csize as u64 {
            self.move_window(root_sect + so)?;
            for ent in self.win.buf.chunks_exact(SZDIRE) {
                if ent[XDIR_TYPE] == ET_BITMAP {
                    bcl = Some(ld32(ent, XENT_FST_CLUS));
                    break 'search;
                }
            }
        }
        let mut bcl = bcl.ok_or(FsError::NoFilesystem)?;
        if bcl < 2 || bcl >= self.n_fatent {
            return Err(FsError::NoFilesystem);
        }
        self.bitbase = self.database + self.csize as u64 * (bcl - 2) as u64;

        // The bitmap must be a contiguous run in the table.
        let per_sect = self.ssize / 4;
        loop {
            self.move_window(self.fatbase + (bcl / per_sect) as u64)?;
            let cv = ld32(&self.win.buf, (bcl % per_sect * 4) as usize);
            if cv == 0xFFFF_FFFF {
                break;
            }
            bcl += 1;
            if cv != bcl {
                return Err(FsError::NoFilesystem);
            }
        }
        self.last_clst = u32::MAX;
        self.free_clst = None;
        Ok(())
    }

    fn init_fat(&mut self, bsect: u64) -> FsResult<()> {
        let bs = BootSector(&self.win.buf);
        if bs.bytes_per_sector() as u32 != self.ssize {
            return Err(FsError::NoFilesystem);
        }
        let fsize = bs.fat_size();
        let n_fats = bs.num_fats();
        if n_fats != 1 && n_fats != 2 {
            return Err(FsError::NoFilesystem);
        }
        let csize = bs.sectors_per_cluster() as u32;
        if csize == 0 || !csize.is_power_of_two() {
            return Err(FsError::NoFilesystem);
        }
        let n_rootdir = bs.root_entries() as u32;
        let ents_per_sect = self.ssize / SZDIRE as u32;
        if n_rootdir % ents_per_sect != 0 {
            return Err(FsError::NoFilesystem);
        }
        let tsect = bs.total_sectors();
        let nrsv = bs.reserved_sectors() as u32;
        if nrsv == 0 {
            return Err(FsError::NoFilesystem);
        }
        let fasize = fsize as u64 * n_fats as u64;
        let sysect = nrsv as u64 + fasize + (n_rootdir / ents_per_sect) as u64;
        if (tsect as u64) < sysect {
            return Err(FsError::NoFilesystem);
        }
        let nclst = ((tsect as u64 - sysect) / csize as u64) as u32;
        if nclst == 0 {
            return Err(FsError::NoFilesystem);
        }
        let kind = FatKind::from_cluster_count(nclst).ok_or(FsError::NoFilesystem)?;
        let fs_ver = bs.fs_version32();
        let root_clus = bs.root_cluster32();
        let fsinfo_at = bs.fsinfo_sector();

        self.kind = kind;
        self.fsize = fsize;
        self.n_fats = n_fats;
        self.csize = csize;
        self.n_rootdir = n_rootdir;
        self.n_fatent = nclst + 2;
        self.fatbase = bsect + nrsv as u64;
        self.database = bsect + sysect;

        let szbfat = if kind == FatKind::Fat32 {
            if fs_ver != 0 || n_rootdir != 0 {
                return Err(FsError::NoFilesystem);
            }
            self.dirbase = root_clus as u64;
            self.n_fatent as u64 * 4
        } else {
            if n_rootdir == 0 {
                return Err(FsError::NoFilesystem);
            }
            self.dirbase = self.fatbase + fasize;
            if kind == FatKind::Fat16 {
                self.n_fatent as u64 * 2
            } else {
                self.n_fatent as u64 * 3 / 2 + (self.n_fatent & 1) as u64
            }
        };
        if (self.fsize as u64) < szbfat.div_ceil(self.ssize as u64) {
            return Err(FsError::NoFilesystem);
        }

        self.last_clst = u32::MAX;
        self.free_clst = None;
        self.fsi_enabled = false;
        if kind == FatKind::Fat32 && fsinfo_at == 1 {
            self.fsi_enabled = true;
            if self.opts.fsinfo_trust && self.move_window(bsect + 1).is_ok() {
                self.load_fsinfo();
            }
        }
        Ok(())
    }

    fn load_fsinfo(&mut self) {
        let w = &self.win.buf;
        if ld16(w, BS_55AA) != BOOT_SIGNATURE
            || ld32(w, FSI_LEAD_SIG) != FSI_LEAD_SIGNATURE
            || ld32(w, FSI_STRUC_SIG) != FSI_STRUC_SIGNATURE
        {
            warn!("drive {}: FSInfo sector signatures invalid, ignoring", self.pdrv);
            return;
        }
        let free = ld32(w, FSI_FREE_COUNT);
        self.free_clst = (free <= self.n_fatent - 2).then_some(free);
        self.last_clst = ld32(w, FSI_NXT_FREE);
    }

    pub fn is_exfat(&self) -> bool {
        self.kind == FatKind::ExFat
    }

    pub fn cluster_bytes(&self) -> u64 {
        self.csize as u64 * self.ssize as u64
    }

    pub fn mirror(&self) -> FatMirror {
        FatMirror {
            fat_base: self.fatbase,
            fat_size: self.fsize as u64,
            n_fats: self.n_fats,
        }
    }

    pub fn move_window(&mut self, sector: u64) -> FsResult<()> {
        let mirror = self.mirror();
        self.win.load(self.dev.as_ref(), sector, mirror)
    }

    pub fn sync_window(&mut self) -> FsResult<()> {
        let mirror = self.mirror();
        self.win.flush(self.dev.as_ref(), mirror)
    }

    /// Flush the window, write back FSInfo if it changed and ask the device
    /// to commit its own cache.
    pub fn sync_fs(&mut self) -> FsResult<()> {
        self.sync_window()?;
        if self.kind == FatKind::Fat32 && self.fsi_enabled && self.fsi_dirty {
            let sector = self.volbase + 1;
            let w = &mut self.win.buf;
            w.fill(0);
            st16(w, BS_55AA, BOOT_SIGNATURE);
            st32(w, FSI_LEAD_SIG, FSI_LEAD_SIGNATURE);
            st32(w, FSI_STRUC_SIG, FSI_STRUC_SIGNATURE);
            st32(w, FSI_FREE_COUNT, self.free_clst.unwrap_or(u32::MAX));
            st32(w, FSI_NXT_FREE, self.last_clst);
            self.win.sector = Some(sector);
            self.dev.write(&self.win.buf, sector, 1)?;
            self.fsi_dirty = false;
        }
        self.dev.ioctl(IoctlRequest::Sync)?;
        Ok(())
    }

    /// First sector of cluster `clst`, or 0 when the index is out of range.
    pub fn clst2sect(&self, clst: u32) -> u64 {
        let c = clst.wrapping_sub(2);
        if c >= self.n_fatent - 2 {
            return 0;
        }
        self.database + self.csize as u64 * c as u64
    }

    pub fn disk_read(&self, buf: &mut [u8], sector: u64, count: u32) -> FsResult<()> {
        self.dev.read(buf, sector, count).map_err(FsError::from)
    }

    pub fn disk_write(&self, buf: &[u8], sector: u64, count: u32) -> FsResult<()> {
        self.dev.write(buf, sector, count).map_err(FsError::from)
    }

    /// Refuse modifications on a read-only configuration or protected medium.
    pub fn check_writable(&self) -> FsResult<()> {
        if self.opts.read_only || self.dev.status().protected {
            return Err(FsError::WriteProtected);
        }
        Ok(())
    }

    /// Whether the device still reports an initialized medium.
    pub fn is_alive(&self) -> bool {
        let st = self.dev.status();
        !st.no_init && !st.no_disk
    }

    /// Current time packed as a FAT timestamp.
    pub fn timestamp(&self) -> u32 {
        self.opts.timestamp()
    }

    /// Sector-window byte offset and sector of a byte position in the FAT.
    pub(crate) fn fat_pos(&self, byte: u64) -> (u64, usize) {
        (
            self.fatbase + byte / self.ssize as u64,
            (byte % self.ssize as u64) as usize,
        )
    }
}

/// Pack calendar fields into the FAT date/time layout (two-second units).
pub(crate) fn pack_timestamp(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> u32 {
    let year = year.clamp(1980, 2107) as u32 - 1980;
    year << 25 | month << 21 | day << 16 | hour << 11 | min << 5 | sec / 2
}

/// Classify the sector at `sector`, leaving it resident in `win`.
pub(crate) fn probe_sector(
    dev: &dyn BlockDevice,
    win: &mut SectorWindow,
    sector: u64,
    exfat: bool,
) -> FsResult<Probe> {
    win.invalidate();
    win.load(dev, sector, FatMirror::default())?;
    let bs = BootSector(&win.buf);
    let signed = bs.signature() == BOOT_SIGNATURE;

    if exfat && signed && bs.is_exfat() {
        return Ok(Probe::ExFat);
    }
    if matches!(bs.jump(), 0xEB | 0xE9 | 0xE8) {
        if signed && bs.declares_fat32() {
            return Ok(Probe::Fat);
        }
        if bs.is_plausible() {
            return Ok(Probe::Fat);
        }
    }
    Ok(if signed {
        Probe::BootRecord
    } else {
        Probe::Invalid
    })
}

/// Locate the volume on the drive: sector 0 as a super-floppy first, then
/// the MBR or GPT partition entries.
fn find_volume(
    dev: &dyn BlockDevice,
    win: &mut SectorWindow,
    partition: u8,
    exfat: bool,
) -> FsResult<(u64, Probe)> {
    let probe = probe_sector(dev, win, 0, exfat)?;
    if probe == Probe::Invalid || (partition == 0 && probe != Probe::BootRecord) {
        return Ok((0, probe));
    }

    let table = match PartitionTable::detect(dev, win.buf.len() as u32) {
        Ok(t) => t,
        Err(e) => {
            debug!("partition table rejected: {e}");
            return Ok((0, Probe::Invalid));
        }
    };
    let candidates = table.volume_candidates();
    debug!("{} table with candidates {candidates:?}", table.type_name());

    if partition != 0 {
        let Some(&lba) = candidates.get(partition as usize - 1) else {
            return Ok((0, Probe::Invalid));
        };
        if lba == 0 {
            return Ok((0, Probe::Invalid));
        }
        return Ok((lba, probe_sector(dev, win, lba, exfat)?));
    }

    for lba in candidates.into_iter().filter(|&l| l != 0) {
        let probe = probe_sector(dev, win, lba, exfat)?;
        if matches!(probe, Probe::Fat | Probe::ExFat) {
            return Ok((lba, probe));
        }
    }
    Ok((0, Probe::Invalid))
}
