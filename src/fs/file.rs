//! Open file handles: buffered sector I/O over a cluster chain, seeking
//! (including the cluster link map for fast random access), truncation,
//! pre-allocation and write-back of the directory entry.

use std::io;
use std::ops::BitOr;
use std::sync::Arc;

use log::{debug, warn};

use super::chain::{ChainState, ObjId, ParentRef};
use super::dir::DirCursor;
use super::layout::*;
use super::lock::{Access, Lease, LockKey, LockTable};
use super::name::NS_NONAME;
use super::registry::VolumeSlot;
use super::volume::{FatKind, Volume};
use crate::error::{FsError, FsResult};

const FA_READ: u8 = 0x01;
const FA_WRITE: u8 = 0x02;
const FA_CREATE_NEW: u8 = 0x04;
const FA_CREATE_ALWAYS: u8 = 0x08;
const FA_OPEN_ALWAYS: u8 = 0x10;
const FA_SEEKEND: u8 = 0x20;
const FA_OPEN_APPEND: u8 = FA_OPEN_ALWAYS | FA_SEEKEND;
const FA_MODIFIED: u8 = 0x40;
const FA_DIRTY: u8 = 0x80;

/// Access and disposition flags for [`FatFs::open`](super::FatFs::open).
/// Combine with `|`, e.g. `OpenMode::WRITE | OpenMode::CREATE_ALWAYS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode(u8);

impl OpenMode {
    pub const READ: OpenMode = OpenMode(FA_READ);
    pub const WRITE: OpenMode = OpenMode(FA_WRITE);
    /// Fail unless the file exists (the default).
    pub const OPEN_EXISTING: OpenMode = OpenMode(0);
    /// Create the file, failing with `Exist` if it is already there.
    pub const CREATE_NEW: OpenMode = OpenMode(FA_CREATE_NEW);
    /// Create the file, truncating an existing one.
    pub const CREATE_ALWAYS: OpenMode = OpenMode(FA_CREATE_ALWAYS);
    /// Open the file, creating it when missing.
    pub const OPEN_ALWAYS: OpenMode = OpenMode(FA_OPEN_ALWAYS);
    /// Like `OPEN_ALWAYS`, with the file pointer at the end.
    pub const OPEN_APPEND: OpenMode = OpenMode(FA_OPEN_APPEND);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// Sharing key of the entry under `dp`.
pub(crate) fn entry_key(vol: &Volume, dp: &DirCursor) -> LockKey {
    LockKey {
        vol: vol.id,
        sclust: dp.obj.sclust,
        ofs: dp.dptr,
    }
}

/// Cluster holding byte `ofs` according to a link map of (length, start)
/// runs, 0 when the map does not reach that far.
fn map_cluster(map: &[(u32, u32)], cluster_bytes: u64, ofs: u64) -> u32 {
    let mut cl = (ofs / cluster_bytes) as u32;
    for &(ncl, start) in map {
        if cl < ncl {
            return start + cl;
        }
        cl -= ncl;
    }
    0
}

/// An open file.
///
/// Dropping a handle closes it; errors at that point can only be logged, so
/// call [`File::close`] when the outcome matters.
pub struct File {
    slot: Arc<VolumeSlot>,
    obj: ObjId,
    flag: u8,
    /// Sticky hard error; every later operation but close fails with it.
    err: Option<FsError>,
    fptr: u64,
    /// Cluster holding the byte before `fptr` (or `fptr` at 0).
    clust: u32,
    /// Sector held in `buf`, 0 when none.
    sect: u64,
    /// FAT: location of the short-name entry.
    dir_sect: u64,
    dir_ofs: usize,
    link_map: Option<Vec<(u32, u32)>>,
    buf: Vec<u8>,
    lease: Option<Lease>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("volume", &self.obj.id)
            .field("sclust", &self.obj.sclust)
            .field("size", &self.obj.objsize)
            .field("fptr", &self.fptr)
            .field("flag", &self.flag)
            .finish()
    }
}

impl File {
    /// Open `path` on a mounted volume. Called with the volume locked.
    pub(crate) fn open(
        vol: &mut Volume,
        slot: Arc<VolumeSlot>,
        locks: &Arc<LockTable>,
        path: &str,
        mode: OpenMode,
    ) -> FsResult<File> {
        let mut mode = mode.0 & (FA_READ | FA_WRITE | FA_CREATE_ALWAYS | FA_CREATE_NEW | FA_OPEN_APPEND);
        let write_access = mode & !FA_READ != 0;
        let access = if write_access {
            Access::Write
        } else {
            Access::Read
        };

        let mut dj = DirCursor::default();
        let mut res = vol.follow_path(&mut dj, path, None);
        if res.is_ok() {
            res = if dj.ns & NS_NONAME != 0 {
                Err(FsError::InvalidName)
            } else {
                locks.check(entry_key(vol, &dj), access)
            };
        }

        if mode & (FA_CREATE_ALWAYS | FA_OPEN_ALWAYS | FA_CREATE_NEW) != 0 {
            match res {
                Err(FsError::NoFile) => {
                    if !locks.has_room() {
                        return Err(FsError::TooManyOpenFiles);
                    }
                    vol.dir_register(&mut dj)?;
                    mode |= FA_CREATE_ALWAYS;
                }
                Err(e) => return Err(e),
                Ok(()) => {
                    if dj.obj.attr & (AM_RDO | AM_DIR) != 0 {
                        return Err(FsError::Denied);
                    }
                    if mode & FA_CREATE_NEW != 0 {
                        return Err(FsError::Exist);
                    }
                }
            }
            if mode & FA_CREATE_ALWAYS != 0 {
                Self::reset_entry(vol, &mut dj)?;
            }
        } else {
            res?;
            if dj.obj.attr & AM_DIR != 0 {
                return Err(FsError::NoFile);
            }
            if mode & FA_WRITE != 0 && dj.obj.attr & AM_RDO != 0 {
                return Err(FsError::Denied);
            }
        }
        if mode & FA_CREATE_ALWAYS != 0 {
            mode |= FA_MODIFIED;
        }

        let mut obj = ObjId {
            id: vol.id,
            attr: dj.obj.attr,
            ..ObjId::default()
        };
        if vol.is_exfat() {
            obj.parent = ParentRef {
                sclust: dj.obj.sclust,
                size: dj.obj.objsize,
                chain: dj.obj.chain,
                ofs: dj.blk_ofs.ok_or(FsError::IntErr)?,
            };
            vol.init_alloc_info(&mut obj);
        } else {
            obj.sclust = vol.entry_cluster(&dj)?;
            obj.objsize = SfnEntry(vol.dir_entry(&dj)?).size() as u64;
        }
        let lease = locks.acquire(entry_key(vol, &dj), write_access)?;

        let mut fp = File {
            slot,
            obj,
            flag: mode,
            err: None,
            fptr: 0,
            clust: 0,
            sect: 0,
            dir_sect: dj.sect,
            dir_ofs: dj.dir_ofs,
            link_map: None,
            buf: vec![0u8; vol.ssize as usize],
            lease: Some(lease),
        };

        if mode & FA_SEEKEND != 0 && fp.obj.objsize > 0 {
            fp.seek_end_on_open(vol)?;
        }
        debug!(
            "opened {path:?} (cluster {}, {} bytes, mode {:#04x})",
            fp.obj.sclust, fp.obj.objsize, fp.flag
        );
        Ok(fp)
    }

    /// Turn the entry under `dj` into an empty archive file, releasing any
    /// clusters it had.
    fn reset_entry(vol: &mut Volume, dj: &mut DirCursor) -> FsResult<()> {
        let tm = vol.timestamp();
        if vol.is_exfat() {
            let mut old = ObjId {
                id: vol.id,
                ..ObjId::default()
            };
            vol.init_alloc_info(&mut old);
            vol.dirbuf[2..SZDIRE].fill(0);
            vol.dirbuf[SZDIRE + 6..2 * SZDIRE].fill(0);
            vol.dirbuf[XDIR_ATTR] = AM_ARC;
            st32(&mut vol.dirbuf, XDIR_CRT_TIME, tm);
            vol.dirbuf[XDIR_GEN_FLAGS] = 1;
            vol.store_xdir(dj)?;
            let sclust = old.sclust;
            if sclust != 0 {
                vol.remove_chain(&mut old, sclust, 0)?;
                vol.last_clst = sclust - 1;
            }
            return Ok(());
        }

        let cl = vol.entry_cluster(dj)?;
        let fat32 = vol.kind == FatKind::Fat32;
        let ent = vol.dir_entry(dj)?;
        let mut sfn = SfnEntryMut(ent);
        sfn.set_created(tm);
        sfn.set_modified(tm);
        sfn.set_attr(AM_ARC);
        sfn.set_size(0);
        sfn.set_cluster(0, fat32);
        vol.win.dirty = true;
        if cl != 0 {
            let sc = dj.sect;
            let mut obj = dj.obj.clone();
            vol.remove_chain(&mut obj, cl, 0)?;
            vol.move_window(sc)?;
            vol.last_clst = cl - 1;
        }
        Ok(())
    }

    /// Position at the end of the file for append mode.
    fn seek_end_on_open(&mut self, vol: &mut Volume) -> FsResult<()> {
        self.fptr = self.obj.objsize;
        let bcs = vol.cluster_bytes();
        let mut clst = self.obj.sclust;
        let mut ofs = self.obj.objsize;
        while ofs > bcs {
            clst = vol.get_fat(&self.obj, clst)?;
            if clst <= 1 {
                return Err(FsError::IntErr);
            }
            ofs -= bcs;
        }
        self.clust = clst;
        if ofs % vol.ssize as u64 != 0 {
            let sc = vol.clst2sect(clst);
            if sc == 0 {
                return Err(FsError::IntErr);
            }
            self.sect = sc + ofs / vol.ssize as u64;
            vol.disk_read(&mut self.buf, self.sect, 1)?;
        }
        Ok(())
    }

    /// Run `f` with the owning volume locked and this handle validated.
    /// Hard errors become sticky.
    fn with_volume<T>(
        &mut self,
        check_err: bool,
        f: impl FnOnce(&mut Self, &mut Volume) -> FsResult<T>,
    ) -> FsResult<T> {
        let slot = Arc::clone(&self.slot);
        let mut state = slot.lock()?;
        let vol = state.validate(self.obj.id)?;
        if check_err {
            if let Some(e) = self.err {
                return Err(e);
            }
        }
        let res = f(self, vol);
        if let Err(e @ (FsError::DiskErr | FsError::IntErr)) = res {
            self.err = Some(e);
        }
        res
    }

    fn flush_buf(&mut self, vol: &Volume) -> FsResult<()> {
        if self.flag & FA_DIRTY != 0 {
            vol.disk_write(&self.buf, self.sect, 1)?;
            self.flag &= !FA_DIRTY;
        }
        Ok(())
    }

    /// Read up to `out.len()` bytes at the file pointer. Returns the number
    /// read, short only at the end of the file.
    pub fn read(&mut self, out: &mut [u8]) -> FsResult<usize> {
        self.with_volume(true, |fp, vol| fp.read_inner(vol, out))
    }

    fn read_inner(&mut self, vol: &mut Volume, out: &mut [u8]) -> FsResult<usize> {
        if self.flag & FA_READ == 0 {
            return Err(FsError::Denied);
        }
        let ss = vol.ssize as u64;
        let ssz = vol.ssize as usize;
        let remain = self.obj.objsize.saturating_sub(self.fptr);
        let mut btr = (out.len() as u64).min(remain) as usize;
        let mut done = 0usize;

        while btr > 0 {
            if self.fptr % ss == 0 {
                let csect = ((self.fptr / ss) & (vol.csize as u64 - 1)) as u32;
                if csect == 0 {
                    let clst = if self.fptr == 0 {
                        self.obj.sclust
                    } else if let Some(map) = &self.link_map {
                        map_cluster(map, vol.cluster_bytes(), self.fptr)
                    } else {
                        vol.get_fat(&self.obj, self.clust)?
                    };
                    if clst < 2 {
                        return Err(FsError::IntErr);
                    }
                    self.clust = clst;
                }
                let sect = vol.clst2sect(self.clust);
                if sect == 0 {
                    return Err(FsError::IntErr);
                }
                let sect = sect + csect as u64;
                let mut cc = (btr / ssz) as u32;
                if cc > 0 {
                    // Whole sectors go straight to the caller.
                    cc = cc.min(vol.csize - csect);
                    let n = cc as usize * ssz;
                    vol.disk_read(&mut out[done..done + n], sect, cc)?;
                    if self.flag & FA_DIRTY != 0 && self.sect.wrapping_sub(sect) < cc as u64 {
                        let o = done + (self.sect - sect) as usize * ssz;
                        out[o..o + ssz].copy_from_slice(&self.buf);
                    }
                    done += n;
                    btr -= n;
                    self.fptr += n as u64;
                    continue;
                }
                if self.sect != sect {
                    self.flush_buf(vol)?;
                    vol.disk_read(&mut self.buf, sect, 1)?;
                }
                self.sect = sect;
            }
            let ofs = (self.fptr % ss) as usize;
            let n = (ssz - ofs).min(btr);
            out[done..done + n].copy_from_slice(&self.buf[ofs..ofs + n]);
            done += n;
            btr -= n;
            self.fptr += n as u64;
        }
        Ok(done)
    }

    /// Write `data` at the file pointer, growing the file as needed.
    ///
    /// A short count means the volume filled up; `Denied` is returned when
    /// not a single byte fitted.
    pub fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        self.with_volume(true, |fp, vol| fp.write_inner(vol, data))
    }

    fn write_inner(&mut self, vol: &mut Volume, data: &[u8]) -> FsResult<usize> {
        if self.flag & FA_WRITE == 0 {
            return Err(FsError::Denied);
        }
        let ss = vol.ssize as u64;
        let ssz = vol.ssize as usize;
        let mut btw = data.len();
        if !vol.is_exfat() {
            // FAT files stop at 4 GiB - 1.
            let room = (u32::MAX as u64).saturating_sub(self.fptr);
            btw = btw.min(room as usize);
        }
        let mut done = 0usize;

        while btw > 0 {
            if self.fptr % ss == 0 {
                let csect = ((self.fptr / ss) & (vol.csize as u64 - 1)) as u32;
                if csect == 0 {
                    let clst = if self.fptr == 0 && self.obj.sclust != 0 {
                        Some(self.obj.sclust)
                    } else if self.fptr == 0 {
                        vol.create_chain(&mut self.obj, 0)?
                    } else if let Some(map) = &self.link_map {
                        Some(map_cluster(map, vol.cluster_bytes(), self.fptr)).filter(|&c| c != 0)
                    } else {
                        vol.create_chain(&mut self.obj, self.clust)?
                    };
                    let Some(clst) = clst else {
                        break;
                    };
                    if clst == 1 {
                        return Err(FsError::IntErr);
                    }
                    self.clust = clst;
                    if self.obj.sclust == 0 {
                        self.obj.sclust = clst;
                    }
                }
                self.flush_buf(vol)?;
                let sect = vol.clst2sect(self.clust);
                if sect == 0 {
                    return Err(FsError::IntErr);
                }
                let sect = sect + csect as u64;
                let mut cc = (btw / ssz) as u32;
                if cc > 0 {
                    cc = cc.min(vol.csize - csect);
                    let n = cc as usize * ssz;
                    vol.disk_write(&data[done..done + n], sect, cc)?;
                    if self.sect.wrapping_sub(sect) < cc as u64 {
                        // The cached sector was overwritten directly.
                        let o = done + (self.sect - sect) as usize * ssz;
                        self.buf.copy_from_slice(&data[o..o + ssz]);
                        self.flag &= !FA_DIRTY;
                    }
                    done += n;
                    btw -= n;
                    self.fptr += n as u64;
                    self.obj.objsize = self.obj.objsize.max(self.fptr);
                    continue;
                }
                if self.sect != sect && self.fptr < self.obj.objsize {
                    vol.disk_read(&mut self.buf, sect, 1)?;
                }
                self.sect = sect;
            }
            let ofs = (self.fptr % ss) as usize;
            let n = (ssz - ofs).min(btw);
            self.buf[ofs..ofs + n].copy_from_slice(&data[done..done + n]);
            self.flag |= FA_DIRTY;
            done += n;
            btw -= n;
            self.fptr += n as u64;
            self.obj.objsize = self.obj.objsize.max(self.fptr);
        }

        self.flag |= FA_MODIFIED;
        if done == 0 && !data.is_empty() {
            return Err(FsError::Denied);
        }
        Ok(done)
    }

    /// Terminate a pending exFAT fragment so the table is walkable.
    fn settle_last_frag(&mut self, vol: &mut Volume) -> FsResult<()> {
        if vol.is_exfat() {
            let lcl = self.obj.frag_end;
            vol.fill_last_frag(&mut self.obj, lcl, 0xFFFF_FFFF)?;
        }
        Ok(())
    }

    /// Move the file pointer to `ofs`.
    ///
    /// Seeking past the end extends the file when it is open for writing
    /// (clusters are allocated, contents are undefined); otherwise the offset
    /// is clipped to the file size.
    pub fn seek_to(&mut self, ofs: u64) -> FsResult<()> {
        self.with_volume(true, |fp, vol| {
            fp.settle_last_frag(vol)?;
            if fp.link_map.is_some() {
                fp.seek_mapped(vol, ofs)
            } else {
                fp.seek_linear(vol, ofs)
            }
        })
    }

    fn seek_mapped(&mut self, vol: &mut Volume, ofs: u64) -> FsResult<()> {
        let ofs = ofs.min(self.obj.objsize);
        self.fptr = ofs;
        if ofs == 0 {
            return Ok(());
        }
        let map = self.link_map.as_deref().unwrap_or_default();
        self.clust = map_cluster(map, vol.cluster_bytes(), ofs - 1);
        let dsc = vol.clst2sect(self.clust);
        if dsc == 0 {
            return Err(FsError::IntErr);
        }
        let ss = vol.ssize as u64;
        let dsc = dsc + ((ofs - 1) / ss & (vol.csize as u64 - 1));
        if self.fptr % ss != 0 && dsc != self.sect {
            self.flush_buf(vol)?;
            vol.disk_read(&mut self.buf, dsc, 1)?;
            self.sect = dsc;
        }
        Ok(())
    }

    fn seek_linear(&mut self, vol: &mut Volume, ofs: u64) -> FsResult<()> {
        let mut ofs = ofs;
        if !vol.is_exfat() {
            ofs = ofs.min(u32::MAX as u64);
        }
        if ofs > self.obj.objsize && self.flag & FA_WRITE == 0 {
            ofs = self.obj.objsize;
        }
        let ifptr = self.fptr;
        self.fptr = 0;
        let mut nsect = 0u64;
        let ss = vol.ssize as u64;

        if ofs > 0 {
            let bcs = vol.cluster_bytes();
            let mut clst;
            if ifptr > 0 && (ofs - 1) / bcs >= (ifptr - 1) / bcs {
                // Same or later cluster: continue from the current one.
                self.fptr = (ifptr - 1) & !(bcs - 1);
                ofs -= self.fptr;
                clst = self.clust;
            } else {
                clst = self.obj.sclust;
                if clst == 0 {
                    clst = vol.create_chain(&mut self.obj, 0)?.unwrap_or(0);
                    self.obj.sclust = clst;
                }
                self.clust = clst;
            }
            if clst != 0 {
                while ofs > bcs {
                    ofs -= bcs;
                    self.fptr += bcs;
                    if self.flag & FA_WRITE != 0 {
                        if self.fptr > self.obj.objsize {
                            // Contiguous exFAT chains derive links from the size.
                            self.obj.objsize = self.fptr;
                            self.flag |= FA_MODIFIED;
                        }
                        match vol.create_chain(&mut self.obj, clst)? {
                            Some(c) => clst = c,
                            None => {
                                ofs = 0;
                                break;
                            }
                        }
                    } else {
                        clst = vol.get_fat(&self.obj, clst)?;
                    }
                    if clst <= 1 || clst >= vol.n_fatent {
                        return Err(FsError::IntErr);
                    }
                    self.clust = clst;
                }
                self.fptr += ofs;
                if ofs % ss != 0 {
                    nsect = vol.clst2sect(clst);
                    if nsect == 0 {
                        return Err(FsError::IntErr);
                    }
                    nsect += ofs / ss;
                }
            }
        }
        if self.fptr > self.obj.objsize {
            self.obj.objsize = self.fptr;
            self.flag |= FA_MODIFIED;
        }
        if self.fptr % ss != 0 && nsect != self.sect {
            self.flush_buf(vol)?;
            vol.disk_read(&mut self.buf, nsect, 1)?;
            self.sect = nsect;
        }
        Ok(())
    }

    /// Build the cluster link map used for random access without walking
    /// the table. Fails with `NotEnoughCore` (leaving normal seeking in
    /// place) when the file has more than `max_fragments` runs.
    pub fn create_link_map(&mut self, max_fragments: usize) -> FsResult<usize> {
        self.with_volume(true, |fp, vol| {
            fp.settle_last_frag(vol)?;
            let mut map = Vec::new();
            let mut cl = fp.obj.sclust;
            if cl != 0 {
                loop {
                    let top = cl;
                    let mut ncl = 0u32;
                    loop {
                        let pcl = cl;
                        ncl += 1;
                        cl = vol.get_fat(&fp.obj, cl)?;
                        if cl <= 1 {
                            return Err(FsError::IntErr);
                        }
                        if cl != pcl + 1 {
                            break;
                        }
                    }
                    map.push((ncl, top));
                    if cl >= vol.n_fatent {
                        break;
                    }
                }
            }
            if map.len() > max_fragments {
                return Err(FsError::NotEnoughCore);
            }
            let n = map.len();
            fp.link_map = Some(map);
            Ok(n)
        })
    }

    /// Return to walking the cluster table on seeks.
    pub fn drop_link_map(&mut self) {
        self.link_map = None;
    }

    /// Cut the file at the file pointer.
    pub fn truncate(&mut self) -> FsResult<()> {
        self.with_volume(true, |fp, vol| {
            if fp.flag & FA_WRITE == 0 {
                return Err(FsError::Denied);
            }
            if fp.fptr >= fp.obj.objsize {
                return Ok(());
            }
            if vol.is_exfat() {
                vol.fill_first_frag(&mut fp.obj)?;
                fp.settle_last_frag(vol)?;
            }
            if fp.fptr == 0 {
                let sclust = fp.obj.sclust;
                vol.remove_chain(&mut fp.obj, sclust, 0)?;
                fp.obj.sclust = 0;
            } else {
                let ncl = vol.get_fat(&fp.obj, fp.clust)?;
                if ncl < vol.n_fatent {
                    let clust = fp.clust;
                    vol.remove_chain(&mut fp.obj, ncl, clust)?;
                }
            }
            fp.obj.objsize = fp.fptr;
            fp.flag |= FA_MODIFIED;
            fp.flush_buf(vol)
        })
    }

    /// Write cached data and the directory entry back to the volume.
    pub fn sync(&mut self) -> FsResult<()> {
        self.with_volume(false, |fp, vol| fp.sync_inner(vol))
    }

    fn sync_inner(&mut self, vol: &mut Volume) -> FsResult<()> {
        if self.flag & FA_MODIFIED == 0 {
            return Ok(());
        }
        self.flush_buf(vol)?;
        let tm = vol.timestamp();
        if vol.is_exfat() {
            vol.fill_first_frag(&mut self.obj)?;
            self.settle_last_frag(vol)?;
            let mut dj = DirCursor::default();
            vol.load_obj_xdir(&mut dj, &self.obj)?;
            let d = &mut vol.dirbuf;
            d[XDIR_ATTR] |= AM_ARC;
            d[XDIR_GEN_FLAGS] = self.obj.chain.gen_flags();
            st32(d, XDIR_FST_CLUS, self.obj.sclust);
            st64(d, XDIR_FILE_SIZE, self.obj.objsize);
            st64(d, XDIR_VALID_FILE_SIZE, self.obj.objsize);
            st32(d, XDIR_MOD_TIME, tm);
            d[XDIR_MOD_TIME10] = 0;
            st32(d, XDIR_ACC_TIME, 0);
            vol.store_xdir(&mut dj)?;
        } else {
            vol.move_window(self.dir_sect)?;
            let (sclust, size) = (self.obj.sclust, self.obj.objsize as u32);
            let fat32 = vol.kind == FatKind::Fat32;
            let ent = &mut vol.win.buf[self.dir_ofs..self.dir_ofs + SZDIRE];
            let attr = ent[DIR_ATTR] | AM_ARC;
            let mut sfn = SfnEntryMut(ent);
            sfn.set_attr(attr);
            sfn.set_cluster(sclust, fat32);
            sfn.set_size(size);
            sfn.set_modified(tm);
            sfn.set_accessed_date(0);
            vol.win.dirty = true;
        }
        vol.sync_fs()?;
        self.flag &= !FA_MODIFIED;
        Ok(())
    }

    /// Sync and release the handle. Later operations fail with
    /// `InvalidObject`.
    pub fn close(&mut self) -> FsResult<()> {
        self.sync()?;
        self.obj.id = 0;
        self.lease = None;
        Ok(())
    }

    /// Allocate `size` bytes of contiguous clusters to an empty file.
    ///
    /// With `allocate_now` the clusters become the file's chain and the
    /// file its size; otherwise the block only becomes the preferred spot
    /// for the next allocation. `Denied` when no contiguous block exists.
    pub fn expand(&mut self, size: u64, allocate_now: bool) -> FsResult<()> {
        self.with_volume(true, |fp, vol| {
            if size == 0 || fp.obj.objsize != 0 || fp.flag & FA_WRITE == 0 {
                return Err(FsError::Denied);
            }
            if !vol.is_exfat() && size > u32::MAX as u64 {
                return Err(FsError::Denied);
            }
            let bcs = vol.cluster_bytes();
            let tcl = size.div_ceil(bcs);
            if tcl > (vol.n_fatent - 2) as u64 {
                return Err(FsError::Denied);
            }
            let tcl = tcl as u32;
            let stcl = match vol.last_clst {
                c if c < 2 || c >= vol.n_fatent => 2,
                c => c,
            };

            let (scl, lclst) = if vol.is_exfat() {
                let scl = vol.find_bitmap(stcl, tcl)?.ok_or(FsError::Denied)?;
                if allocate_now {
                    vol.change_bitmap(scl, tcl, true)?;
                    (scl, scl + tcl - 1)
                } else {
                    (scl, scl - 1)
                }
            } else {
                let scl = fp.find_free_run(vol, stcl, tcl)?;
                if allocate_now {
                    for (i, clst) in (scl..scl + tcl).enumerate() {
                        let next = if i as u32 + 1 == tcl {
                            0xFFFF_FFFF
                        } else {
                            clst + 1
                        };
                        vol.put_fat(clst, next)?;
                    }
                    (scl, scl + tcl - 1)
                } else {
                    (scl, scl - 1)
                }
            };

            vol.last_clst = lclst;
            if allocate_now {
                fp.obj.sclust = scl;
                fp.obj.objsize = size;
                if vol.is_exfat() {
                    fp.obj.chain = ChainState::Contiguous;
                }
                fp.flag |= FA_MODIFIED;
                if let Some(free) = vol.free_clst {
                    vol.free_clst = Some(free.saturating_sub(tcl));
                    vol.fsi_dirty = true;
                }
            }
            Ok(())
        })
    }

    /// First cluster of `tcl` consecutive free clusters, scanning the table
    /// from `stcl` around the volume once.
    fn find_free_run(&self, vol: &mut Volume, stcl: u32, tcl: u32) -> FsResult<u32> {
        let (mut scl, mut clst, mut ncl) = (stcl, stcl, 0u32);
        loop {
            let v = vol.get_fat(&self.obj, clst)?;
            clst += 1;
            let wrapped = clst >= vol.n_fatent;
            if wrapped {
                clst = 2;
            }
            if v == 0 {
                ncl += 1;
                if ncl == tcl {
                    return Ok(scl);
                }
                if wrapped {
                    // A run cannot continue across the end of the table.
                    scl = 2;
                    ncl = 0;
                }
            } else {
                scl = clst;
                ncl = 0;
            }
            if clst == stcl {
                return Err(FsError::Denied);
            }
        }
    }

    /// Stream up to `max` bytes from the file pointer into `sink`, one
    /// sector-sized piece at a time, without copying through the caller.
    ///
    /// `sink` returns how many bytes it took; 0 stops the transfer.
    pub fn forward(&mut self, max: usize, mut sink: impl FnMut(&[u8]) -> usize) -> FsResult<usize> {
        self.with_volume(true, |fp, vol| {
            if fp.flag & FA_READ == 0 {
                return Err(FsError::Denied);
            }
            let ss = vol.ssize as u64;
            let remain = fp.obj.objsize.saturating_sub(fp.fptr);
            let mut btf = (max as u64).min(remain) as usize;
            let mut done = 0usize;
            while btf > 0 {
                let csect = ((fp.fptr / ss) & (vol.csize as u64 - 1)) as u32;
                if fp.fptr % ss == 0 && csect == 0 {
                    let clst = if fp.fptr == 0 {
                        fp.obj.sclust
                    } else {
                        vol.get_fat(&fp.obj, fp.clust)?
                    };
                    if clst <= 1 {
                        return Err(FsError::IntErr);
                    }
                    fp.clust = clst;
                }
                let sect = vol.clst2sect(fp.clust);
                if sect == 0 {
                    return Err(FsError::IntErr);
                }
                let sect = sect + csect as u64;
                if fp.sect != sect {
                    fp.flush_buf(vol)?;
                    vol.disk_read(&mut fp.buf, sect, 1)?;
                }
                fp.sect = sect;
                let ofs = (fp.fptr % ss) as usize;
                let n = (ss as usize - ofs).min(btf);
                let taken = sink(&fp.buf[ofs..ofs + n]).min(n);
                if taken == 0 {
                    break;
                }
                fp.fptr += taken as u64;
                done += taken;
                btf -= taken;
            }
            Ok(done)
        })
    }

    /// Read one line, up to and including `\n`, of at most `max` bytes.
    /// `None` at the end of the file.
    pub fn gets(&mut self, max: usize) -> FsResult<Option<String>> {
        self.with_volume(true, |fp, vol| {
            let mut line = Vec::new();
            let mut byte = [0u8; 1];
            while line.len() < max {
                if fp.read_inner(vol, &mut byte)? == 0 {
                    break;
                }
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            if line.is_empty() {
                return Ok(None);
            }
            Ok(Some(String::from_utf8_lossy(&line).into_owned()))
        })
    }

    /// Write a string; returns the bytes written.
    pub fn puts(&mut self, s: &str) -> FsResult<usize> {
        self.write(s.as_bytes())
    }

    /// Current file pointer.
    pub fn tell(&self) -> u64 {
        self.fptr
    }

    pub fn size(&self) -> u64 {
        self.obj.objsize
    }

    pub fn eof(&self) -> bool {
        self.fptr >= self.obj.objsize
    }

    /// The sticky hard error, if one occurred.
    pub fn error(&self) -> Option<FsError> {
        self.err
    }

    /// Whether the file's clusters are recorded without table links.
    pub fn is_contiguous(&self) -> bool {
        self.obj.chain == ChainState::Contiguous
    }

    pub(crate) fn is_open(&self) -> bool {
        self.obj.id != 0
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if !self.is_open() {
            return;
        }
        let modified = self.flag & FA_MODIFIED != 0;
        if let Err(e) = self.close() {
            if modified {
                warn!("file dropped with unsaved changes: {e}");
            }
        }
    }
}

impl io::Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        File::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for File {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        File::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(io::Error::from)
    }
}

impl io::Seek for File {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(n) => Some(n),
            io::SeekFrom::Current(d) => self.fptr.checked_add_signed(d),
            io::SeekFrom::End(d) => self.obj.objsize.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        self.seek_to(target).map_err(io::Error::from)?;
        Ok(self.fptr)
    }
}
