//! Directory handles and the namespace operations of a mounted volume:
//! stat, unlink, mkdir, rename, attribute and timestamp changes, the volume
//! label and the current directory.

use std::sync::Arc;

use log::{debug, info, warn};

use super::chain::{ChainState, ObjId, ParentRef};
use super::dir::DirCursor;
use super::entry::FileInfo;
use super::file::entry_key;
use super::layout::*;
use super::lock::{Access, Lease, LockKey, LockTable};
use super::name::*;
use super::registry::VolumeSlot;
use super::volume::{FatKind, Volume};
use crate::error::{FsError, FsResult};

/// Characters never allowed in a volume label. exFAT accepts the first seven.
const LABEL_BAD_CHARS: &str = "+.,;=[]/*:<>|\\\"?\x7F";
const LABEL_LEN: usize = 11;

// ---------------------------------------------------------------------------
// Directory handle
// ---------------------------------------------------------------------------

/// An open directory, iterated with [`Dir::read`] or as an iterator.
pub struct Dir {
    slot: Arc<VolumeSlot>,
    cursor: DirCursor,
    pattern: Option<String>,
    lease: Option<Lease>,
}

impl std::fmt::Debug for Dir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dir")
            .field("volume", &self.cursor.obj.id)
            .field("sclust", &self.cursor.obj.sclust)
            .field("dptr", &self.cursor.dptr)
            .field("pattern", &self.pattern)
            .finish()
    }
}

impl Dir {
    pub(crate) fn open(
        vol: &mut Volume,
        slot: Arc<VolumeSlot>,
        locks: &Arc<LockTable>,
        path: &str,
    ) -> FsResult<Dir> {
        let mut dp = DirCursor::default();
        match vol.follow_path(&mut dp, path, None) {
            Err(FsError::NoFile) => return Err(FsError::NoPath),
            r => r?,
        }
        if dp.ns & NS_NONAME == 0 {
            if dp.obj.attr & AM_DIR == 0 {
                return Err(FsError::NoPath);
            }
            vol.enter_directory(&mut dp)?;
        }
        dp.obj.id = vol.id;
        vol.dir_sdi(&mut dp, 0)?;
        let lease = if dp.obj.sclust != 0 {
            Some(locks.acquire(LockKey::directory(vol.id, dp.obj.sclust), false)?)
        } else {
            None
        };
        Ok(Dir {
            slot,
            cursor: dp,
            pattern: None,
            lease,
        })
    }

    fn with_volume<T>(&mut self, f: impl FnOnce(&mut DirCursor, &mut Volume) -> FsResult<T>) -> FsResult<T> {
        let slot = Arc::clone(&self.slot);
        let mut state = slot.lock()?;
        let vol = state.validate(self.cursor.obj.id)?;
        f(&mut self.cursor, vol)
    }

    /// Next entry, `None` once the directory is exhausted.
    pub fn read(&mut self) -> FsResult<Option<FileInfo>> {
        self.with_volume(|dp, vol| {
            match vol.dir_read(dp, false) {
                Err(FsError::NoFile) => return Ok(None),
                r => r?,
            }
            let info = vol.get_fileinfo(dp)?;
            match vol.dir_next(dp, false) {
                Ok(()) | Err(FsError::NoFile) => {}
                Err(e) => return Err(e),
            }
            Ok(Some(info))
        })
    }

    /// Restart iteration from the first entry.
    pub fn rewind(&mut self) -> FsResult<()> {
        self.with_volume(|dp, vol| vol.dir_sdi(dp, 0))
    }

    pub(crate) fn set_pattern(&mut self, pattern: &str) {
        self.pattern = Some(pattern.to_string());
    }

    /// Next entry whose long or short name matches the search pattern.
    pub fn find_next(&mut self) -> FsResult<Option<FileInfo>> {
        loop {
            let Some(info) = self.read()? else {
                return Ok(None);
            };
            let Some(pattern) = &self.pattern else {
                return Ok(Some(info));
            };
            if pattern_match(pattern, &info.name)
                || (!info.alt_name.is_empty() && pattern_match(pattern, &info.alt_name))
            {
                return Ok(Some(info));
            }
        }
    }

    /// Release the handle. Later reads fail with `InvalidObject`.
    pub fn close(&mut self) -> FsResult<()> {
        self.with_volume(|_, _| Ok(()))?;
        self.cursor.obj.id = 0;
        self.lease = None;
        Ok(())
    }
}

impl Iterator for Dir {
    type Item = FsResult<FileInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.find_next() {
            Ok(Some(info)) => Some(Ok(info)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Namespace operations
// ---------------------------------------------------------------------------

impl Volume {
    /// Turn a cursor sitting on a directory entry into a cursor over that
    /// directory's contents.
    pub(crate) fn enter_directory(&mut self, dp: &mut DirCursor) -> FsResult<()> {
        if self.is_exfat() {
            dp.obj.parent = ParentRef {
                sclust: dp.obj.sclust,
                size: dp.obj.objsize,
                chain: dp.obj.chain,
                ofs: dp.blk_ofs.ok_or(FsError::IntErr)?,
            };
            let mut obj = dp.obj.clone();
            self.init_alloc_info(&mut obj);
            dp.obj = obj;
        } else {
            dp.obj.sclust = self.entry_cluster(dp)?;
        }
        Ok(())
    }

    /// Resolve `path` to an existing named object.
    fn find_object(&mut self, path: &str) -> FsResult<DirCursor> {
        let mut dp = DirCursor::default();
        self.follow_path(&mut dp, path, None)?;
        if dp.ns & (NS_DOT | NS_NONAME) != 0 {
            return Err(FsError::InvalidName);
        }
        Ok(dp)
    }

    pub(crate) fn stat(&mut self, path: &str) -> FsResult<FileInfo> {
        let dp = self.find_object(path)?;
        self.get_fileinfo(&dp)
    }

    /// Delete a file or an empty directory.
    pub(crate) fn unlink(&mut self, locks: &LockTable, path: &str) -> FsResult<()> {
        let mut dj = self.find_object(path)?;
        locks.check(entry_key(self, &dj), Access::Remove)?;
        if dj.obj.attr & AM_RDO != 0 {
            return Err(FsError::Denied);
        }

        let mut obj = ObjId {
            id: self.id,
            ..ObjId::default()
        };
        if self.is_exfat() {
            self.init_alloc_info(&mut obj);
        } else {
            obj.sclust = self.entry_cluster(&dj)?;
        }
        let dclst = obj.sclust;

        if dj.obj.attr & AM_DIR != 0 {
            if dclst == self.cdir.sclust {
                return Err(FsError::Denied);
            }
            locks.check(LockKey::directory(self.id, dclst), Access::Remove)?;
            let mut sdj = DirCursor::new(obj.clone());
            self.dir_sdi(&mut sdj, 0)?;
            match self.dir_read(&mut sdj, false) {
                Ok(()) => return Err(FsError::Denied),
                Err(FsError::NoFile) => {}
                Err(e) => return Err(e),
            }
        }

        self.dir_remove(&mut dj)?;
        if dclst != 0 {
            self.remove_chain(&mut obj, dclst, 0)?;
        }
        self.sync_fs()?;
        debug!("removed {path:?}");
        Ok(())
    }

    pub(crate) fn mkdir(&mut self, path: &str) -> FsResult<()> {
        let mut dj = DirCursor::default();
        match self.follow_path(&mut dj, path, None) {
            Ok(()) => return Err(FsError::Exist),
            Err(FsError::NoFile) if dj.ns & NS_DOT != 0 => return Err(FsError::InvalidName),
            Err(FsError::NoFile) => {}
            Err(e) => return Err(e),
        }

        let mut sobj = ObjId {
            id: self.id,
            ..ObjId::default()
        };
        let dcl = self.create_chain(&mut sobj, 0)?.ok_or(FsError::Denied)?;
        sobj.sclust = dcl;
        sobj.objsize = self.cluster_bytes();
        let res = self.build_directory(&mut dj, dcl);
        if res.is_err() {
            if let Err(e) = self.remove_chain(&mut sobj, dcl, 0) {
                warn!("could not release cluster {dcl} of unfinished directory: {e}");
            }
            return res;
        }
        self.sync_fs()?;
        debug!("created directory {path:?} at cluster {dcl}");
        Ok(())
    }

    fn build_directory(&mut self, dj: &mut DirCursor, dcl: u32) -> FsResult<()> {
        let tm = self.timestamp();
        self.clear_cluster(dcl)?;
        if !self.is_exfat() {
            let fat32 = self.kind == FatKind::Fat32;
            let buf = &mut self.win.buf;
            buf[DIR_NAME..DIR_NAME + 11].fill(b' ');
            buf[DIR_NAME] = b'.';
            let mut dot = SfnEntryMut(&mut buf[..SZDIRE]);
            dot.set_attr(AM_DIR);
            dot.set_modified(tm);
            dot.set_cluster(dcl, fat32);
            buf.copy_within(0..SZDIRE, SZDIRE);
            buf[SZDIRE + 1] = b'.';
            let parent = dj.obj.sclust;
            SfnEntryMut(&mut buf[SZDIRE..2 * SZDIRE]).set_cluster(parent, fat32);
            self.win.dirty = true;
        }

        self.dir_register(dj)?;
        if self.is_exfat() {
            let bytes = self.cluster_bytes();
            let d = &mut self.dirbuf;
            st32(d, XDIR_MOD_TIME, tm);
            st32(d, XDIR_FST_CLUS, dcl);
            st64(d, XDIR_FILE_SIZE, bytes);
            st64(d, XDIR_VALID_FILE_SIZE, bytes);
            d[XDIR_GEN_FLAGS] = 3;
            d[XDIR_ATTR] = AM_DIR;
            self.store_xdir(dj)?;
        } else {
            let fat32 = self.kind == FatKind::Fat32;
            let ent = self.dir_entry(dj)?;
            let mut sfn = SfnEntryMut(ent);
            sfn.set_modified(tm);
            sfn.set_cluster(dcl, fat32);
            sfn.set_attr(AM_DIR);
            self.win.dirty = true;
        }
        Ok(())
    }

    /// Rename or move an object within this volume.
    pub(crate) fn rename(&mut self, locks: &LockTable, old: &str, new: &str) -> FsResult<()> {
        let mut djo = self.find_object(old)?;
        locks.check(entry_key(self, &djo), Access::Remove)?;
        let is_dir = djo.obj.attr & AM_DIR != 0;

        let saved: Vec<u8> = if self.is_exfat() {
            self.dirbuf[..2 * SZDIRE].to_vec()
        } else {
            self.dir_entry(&djo)?.to_vec()
        };
        let mut moved = ObjId {
            id: self.id,
            ..ObjId::default()
        };
        if is_dir {
            if self.is_exfat() {
                moved.sclust = ld32(&saved, XDIR_FST_CLUS);
                moved.objsize = ld64(&saved, XDIR_FILE_SIZE);
                moved.chain = ChainState::from_gen_flags(saved[XDIR_GEN_FLAGS]);
            } else {
                moved.sclust = self.entry_cluster(&djo)?;
            }
            locks.check(LockKey::directory(self.id, moved.sclust), Access::Remove)?;
        }

        let mut djn = djo.clone();
        match self.follow_path(&mut djn, new, None) {
            // Same entry: only the case of the name changes.
            Ok(()) if djn.obj.sclust == djo.obj.sclust && djn.dptr == djo.dptr => {}
            Ok(()) => return Err(FsError::Exist),
            Err(FsError::NoFile) => {}
            Err(e) => return Err(e),
        }
        // A directory cannot move below itself.
        if is_dir
            && djn.obj.sclust != djo.obj.sclust
            && self.holds_directory(&moved, djn.obj.sclust)?
        {
            return Err(FsError::Denied);
        }
        self.dir_register(&mut djn)?;

        if self.is_exfat() {
            let nf = self.dirbuf[XDIR_NUM_SEC];
            let nn = self.dirbuf[XDIR_NUM_NAME];
            let nh = ld16(&self.dirbuf, XDIR_NAME_HASH);
            self.dirbuf[..2 * SZDIRE].copy_from_slice(&saved);
            self.dirbuf[XDIR_NUM_SEC] = nf;
            self.dirbuf[XDIR_NUM_NAME] = nn;
            st16(&mut self.dirbuf, XDIR_NAME_HASH, nh);
            if !is_dir {
                self.dirbuf[XDIR_ATTR] |= AM_ARC;
            }
            self.store_xdir(&mut djn)?;
        } else {
            let ent = self.dir_entry(&djn)?;
            ent[DIR_CRT_TIME10..].copy_from_slice(&saved[DIR_CRT_TIME10..]);
            ent[DIR_ATTR] = saved[DIR_ATTR] | if is_dir { 0 } else { AM_ARC };
            self.win.dirty = true;

            if is_dir && djo.obj.sclust != djn.obj.sclust {
                // Repoint the moved directory's ".." entry.
                let fat32 = self.kind == FatKind::Fat32;
                let moved = SfnEntry(&saved).cluster(fat32);
                let sect = self.clst2sect(moved);
                if sect == 0 {
                    return Err(FsError::IntErr);
                }
                self.move_window(sect)?;
                let parent = djn.obj.sclust;
                if self.win.buf[SZDIRE + 1] == b'.' {
                    let ent = &mut self.win.buf[SZDIRE..2 * SZDIRE];
                    SfnEntryMut(ent).set_cluster(parent, fat32);
                    self.win.dirty = true;
                }
            }
        }

        self.dir_remove(&mut djo)?;
        self.sync_fs()?;
        info!("renamed {old:?} to {new:?}");
        Ok(())
    }

    /// Whether the directory starting at cluster `target` is `top` itself or
    /// lies anywhere below it.
    fn holds_directory(&mut self, top: &ObjId, target: u32) -> FsResult<bool> {
        if target == 0 {
            return Ok(false);
        }
        // Reading entries clobbers the name being registered.
        let name = self.lfnbuf.clone();
        let res = self.scan_subtree(top, target);
        self.lfnbuf = name;
        res
    }

    fn scan_subtree(&mut self, top: &ObjId, target: u32) -> FsResult<bool> {
        let mut pending = vec![top.clone()];
        let mut visited = 0u32;
        while let Some(obj) = pending.pop() {
            if obj.sclust == target {
                return Ok(true);
            }
            visited += 1;
            if visited > self.n_fatent {
                return Err(FsError::IntErr);
            }
            let mut dp = DirCursor::new(obj);
            self.dir_sdi(&mut dp, 0)?;
            loop {
                match self.dir_read(&mut dp, false) {
                    Ok(()) => {}
                    Err(FsError::NoFile) => break,
                    Err(e) => return Err(e),
                }
                if dp.obj.attr & AM_DIR != 0 {
                    let mut child = dp.clone();
                    self.enter_directory(&mut child)?;
                    if child.obj.sclust != 0 {
                        pending.push(child.obj);
                    }
                }
                match self.dir_next(&mut dp, false) {
                    Ok(()) => {}
                    Err(FsError::NoFile) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(false)
    }

    /// Change the attribute bits selected by `mask` (read-only, hidden,
    /// system, archive) to those in `attr`.
    pub(crate) fn chmod(&mut self, path: &str, attr: u8, mask: u8) -> FsResult<()> {
        let mut dj = self.find_object(path)?;
        let mask = mask & (AM_RDO | AM_HID | AM_SYS | AM_ARC);
        if self.is_exfat() {
            let cur = self.dirbuf[XDIR_ATTR];
            self.dirbuf[XDIR_ATTR] = (attr & mask) | (cur & !mask);
            self.store_xdir(&mut dj)?;
        } else {
            let ent = self.dir_entry(&dj)?;
            ent[DIR_ATTR] = (attr & mask) | (ent[DIR_ATTR] & !mask);
            self.win.dirty = true;
        }
        self.sync_fs()
    }

    /// Set the modification timestamp from the `date` and `time` fields of
    /// `info`.
    pub(crate) fn utime(&mut self, path: &str, info: &FileInfo) -> FsResult<()> {
        let mut dj = self.find_object(path)?;
        let stamp = (info.date as u32) << 16 | info.time as u32;
        if self.is_exfat() {
            st32(&mut self.dirbuf, XDIR_MOD_TIME, stamp);
            self.store_xdir(&mut dj)?;
        } else {
            SfnEntryMut(self.dir_entry(&dj)?).set_modified(stamp);
            self.win.dirty = true;
        }
        self.sync_fs()
    }

    /// Change the current directory of this volume.
    pub(crate) fn chdir(&mut self, path: &str) -> FsResult<()> {
        let mut dj = DirCursor::default();
        let mut names = Vec::new();
        match self.follow_path(&mut dj, path, Some(&mut names)) {
            Err(FsError::NoFile) => return Err(FsError::NoPath),
            r => r?,
        }
        if dj.ns & NS_NONAME == 0 {
            if dj.obj.attr & AM_DIR == 0 {
                return Err(FsError::NoPath);
            }
            self.enter_directory(&mut dj)?;
        }
        self.cdir.sclust = dj.obj.sclust;
        self.cdir.parent = dj.obj.parent;
        self.cdir.path = format!("/{}", names.join("/"));
        debug!("drive {}: current directory {}", self.pdrv, self.cdir.path);
        Ok(())
    }

    fn root_cursor(&mut self) -> FsResult<DirCursor> {
        let mut dj = DirCursor::new(ObjId {
            id: self.id,
            ..ObjId::default()
        });
        self.dir_sdi(&mut dj, 0)?;
        Ok(dj)
    }

    /// Volume label (empty when none) and serial number.
    pub(crate) fn get_label(&mut self) -> FsResult<(String, u32)> {
        let exfat = self.is_exfat();
        let mut dj = self.root_cursor()?;
        let label = match self.dir_read(&mut dj, true) {
            Ok(()) => {
                let ent = self.dir_entry(&dj)?;
                if exfat {
                    let n = (ent[XDIR_NUM_LABEL] as usize).min(LABEL_LEN);
                    let units: Vec<u16> =
                        (0..n).map(|i| ld16(ent, XDIR_LABEL + i * 2)).collect();
                    String::from_utf16_lossy(&units)
                } else {
                    let s: String = ent[..LABEL_LEN].iter().map(|&b| oem_to_char(b)).collect();
                    s.trim_end_matches(' ').to_string()
                }
            }
            Err(FsError::NoFile) => String::new(),
            Err(e) => return Err(e),
        };

        let ofs = match self.kind {
            FatKind::ExFat => BPB_VOL_ID_EX,
            FatKind::Fat32 => BS_VOL_ID32,
            _ => BS_VOL_ID,
        };
        let volbase = self.volbase;
        self.move_window(volbase)?;
        let serial = ld32(&self.win.buf, ofs);
        Ok((label, serial))
    }

    /// Set the volume label; an empty string removes it.
    pub(crate) fn set_label(&mut self, label: &str) -> FsResult<()> {
        let label = label.trim_end_matches(' ');
        let exfat = self.is_exfat();
        let mut units: Vec<u16> = Vec::new();
        let mut oem = [b' '; LABEL_LEN];
        if exfat {
            for c in label.chars() {
                if (c as u32) < 0x20 || (c as u32) > 0xFFFF || LABEL_BAD_CHARS[7..].contains(c) {
                    return Err(FsError::InvalidName);
                }
                units.push(c as u16);
            }
            if units.len() > LABEL_LEN {
                return Err(FsError::InvalidName);
            }
        } else {
            let mut n = 0;
            for c in label.chars() {
                if (c as u32) < 0x20 || LABEL_BAD_CHARS.contains(c) {
                    return Err(FsError::InvalidName);
                }
                let up = if (c as u32) <= 0xFFFF {
                    char::from_u32(wtoupper(c as u16) as u32).unwrap_or(c)
                } else {
                    c
                };
                let b = char_to_oem(up).ok_or(FsError::InvalidName)?;
                if n >= LABEL_LEN {
                    return Err(FsError::InvalidName);
                }
                oem[n] = b;
                n += 1;
            }
            if n > 0 && oem[0] == DDEM {
                return Err(FsError::InvalidName);
            }
            units.resize(n, 0);
        }
        let has_label = !units.is_empty();

        let mut dj = self.root_cursor()?;
        match self.dir_read(&mut dj, true) {
            Ok(()) => {
                let ent = self.dir_entry(&dj)?;
                if exfat {
                    ent[XDIR_NUM_LABEL] = units.len() as u8;
                    ent[XDIR_LABEL..XDIR_LABEL + 2 * LABEL_LEN].fill(0);
                    for (i, &u) in units.iter().enumerate() {
                        st16(ent, XDIR_LABEL + i * 2, u);
                    }
                } else if has_label {
                    ent[..LABEL_LEN].copy_from_slice(&oem);
                } else {
                    ent[DIR_NAME] = DDEM;
                }
                self.win.dirty = true;
            }
            Err(FsError::NoFile) if has_label => {
                self.dir_alloc(&mut dj, 1)?;
                let tm = self.timestamp();
                let ent = self.dir_entry(&dj)?;
                ent.fill(0);
                if exfat {
                    ent[XDIR_TYPE] = ET_VLABEL;
                    ent[XDIR_NUM_LABEL] = units.len() as u8;
                    for (i, &u) in units.iter().enumerate() {
                        st16(ent, XDIR_LABEL + i * 2, u);
                    }
                } else {
                    let mut sfn = SfnEntryMut(ent);
                    sfn.set_name(&oem);
                    sfn.set_attr(AM_VOL);
                    sfn.set_modified(tm);
                }
                self.win.dirty = true;
            }
            Err(FsError::NoFile) => {}
            Err(e) => return Err(e),
        }
        self.sync_fs()?;
        info!("drive {}: volume label set to {label:?}", self.pdrv);
        Ok(())
    }

    /// Free cluster count, scanning the table when it is not known.
    pub(crate) fn free_clusters(&mut self) -> FsResult<u32> {
        match self.free_clst {
            Some(n) if n <= self.n_fatent - 2 => Ok(n),
            _ => {
                let n = self.count_free()?;
                self.free_clst = Some(n);
                self.fsi_dirty = true;
                Ok(n)
            }
        }
    }
}
