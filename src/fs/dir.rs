//! Directory cursor: positioned iteration over 32-byte entries, plus the
//! lookup, registration and removal of named entries on top of it.

use log::trace;

use super::chain::{ChainState, ObjId};
use super::entry::FileInfo;
use super::layout::*;
use super::name::*;
use super::volume::{FatKind, Volume, DIRBUF_SIZE};
use crate::error::{FsError, FsResult};

/// Largest byte offset inside a FAT directory (65536 entries).
const MAX_DIR: u32 = 0x0020_0000;
/// Largest byte offset inside an exFAT directory.
const MAX_DIR_EX: u32 = 0x1000_0000;

/// Buffer size an entry-set needs for a name of `nc` characters.
const fn max_dirb(nc: usize) -> usize {
    (nc + 44) / 15 * SZDIRE
}

/// Cursor over the entries of one directory.
#[derive(Debug, Clone, Default)]
pub(crate) struct DirCursor {
    pub obj: ObjId,
    /// Byte offset of the current entry.
    pub dptr: u32,
    /// Current cluster, 0 on the fixed FAT12/16 root table.
    pub clust: u32,
    /// Current sector, 0 once the end of the table has been reached.
    pub sect: u64,
    /// Offset of the current entry inside the sector window.
    pub dir_ofs: usize,
    /// Short-name key of the segment being looked up.
    pub fname: [u8; 11],
    /// `NS_*` flags for `fname`.
    pub ns: u8,
    /// Offset of the first entry of the current long-name block or entry-set.
    pub blk_ofs: Option<u32>,
    /// exFAT: the chain was extended and the parent entry must be rewritten.
    pub stretched: bool,
}

impl DirCursor {
    pub fn new(obj: ObjId) -> Self {
        Self {
            obj,
            ..Default::default()
        }
    }

    pub fn at_end(&self) -> bool {
        self.sect == 0
    }
}

/// Start cluster stored in a short-name entry.
pub(crate) fn ld_clust(vol: &Volume, ent: &[u8]) -> u32 {
    SfnEntry(ent).cluster(vol.kind == FatKind::Fat32)
}

pub(crate) fn st_clust(vol: &Volume, ent: &mut [u8], clst: u32) {
    SfnEntryMut(ent).set_cluster(clst, vol.kind == FatKind::Fat32);
}

impl Volume {
    /// Byte range of the cursor's current entry inside the window.
    fn entry_range(dp: &DirCursor) -> std::ops::Range<usize> {
        dp.dir_ofs..dp.dir_ofs + SZDIRE
    }

    /// Load the sector holding the cursor's entry and return it.
    pub(crate) fn dir_entry(&mut self, dp: &DirCursor) -> FsResult<&mut [u8]> {
        self.move_window(dp.sect)?;
        Ok(&mut self.win.buf[Self::entry_range(dp)])
    }

    /// Position the cursor at byte offset `ofs`.
    pub(crate) fn dir_sdi(&mut self, dp: &mut DirCursor, ofs: u32) -> FsResult<()> {
        let limit = if self.is_exfat() { MAX_DIR_EX } else { MAX_DIR };
        if ofs >= limit || ofs as usize % SZDIRE != 0 {
            return Err(FsError::IntErr);
        }
        dp.dptr = ofs;
        let mut clst = dp.obj.sclust;
        if clst == 0 && matches!(self.kind, FatKind::Fat32 | FatKind::ExFat) {
            clst = self.dirbase as u32;
            if self.is_exfat() {
                dp.obj.chain = ChainState::Linked;
            }
        }

        let mut ofs = ofs as u64;
        let sect = if clst == 0 {
            if ofs / SZDIRE as u64 >= self.n_rootdir as u64 {
                return Err(FsError::IntErr);
            }
            self.dirbase
        } else {
            let csz = self.cluster_bytes();
            while ofs >= csz {
                clst = self.get_fat(&dp.obj, clst)?;
                if clst < 2 || clst >= self.n_fatent {
                    return Err(FsError::IntErr);
                }
                ofs -= csz;
            }
            self.clst2sect(clst)
        };
        if sect == 0 {
            return Err(FsError::IntErr);
        }
        dp.clust = clst;
        dp.sect = sect + ofs / self.ssize as u64;
        dp.dir_ofs = (ofs % self.ssize as u64) as usize;
        Ok(())
    }

    /// Advance to the next entry.
    ///
    /// At the end of the table this returns `NoFile`, unless `stretch` is set
    /// and the directory lives in a chain, in which case a zeroed cluster is
    /// appended. A full volume yields `Denied`.
    pub(crate) fn dir_next(&mut self, dp: &mut DirCursor, stretch: bool) -> FsResult<()> {
        let ofs = dp.dptr + SZDIRE as u32;
        let limit = if self.is_exfat() { MAX_DIR_EX } else { MAX_DIR };
        if ofs >= limit {
            dp.sect = 0;
        }
        if dp.sect == 0 {
            return Err(FsError::NoFile);
        }

        if ofs % self.ssize == 0 {
            dp.sect += 1;
            if dp.clust == 0 {
                if ofs / SZDIRE as u32 >= self.n_rootdir {
                    dp.sect = 0;
                    return Err(FsError::NoFile);
                }
            } else if (ofs / self.ssize) & (self.csize - 1) == 0 {
                let mut clst = self.get_fat(&dp.obj, dp.clust)?;
                if clst >= self.n_fatent {
                    if !stretch {
                        dp.sect = 0;
                        return Err(FsError::NoFile);
                    }
                    clst = self
                        .create_chain(&mut dp.obj, dp.clust)?
                        .ok_or(FsError::Denied)?;
                    self.clear_cluster(clst)?;
                    if self.is_exfat() {
                        dp.stretched = true;
                        if dp.obj.sclust != 0 {
                            dp.obj.objsize += self.cluster_bytes();
                        }
                    }
                    trace!("directory at {} stretched to cluster {clst}", dp.obj.sclust);
                }
                dp.clust = clst;
                dp.sect = self.clst2sect(clst);
                if dp.sect == 0 {
                    return Err(FsError::IntErr);
                }
            }
        }
        dp.dptr = ofs;
        dp.dir_ofs = (ofs % self.ssize) as usize;
        Ok(())
    }

    /// Reserve `n_ent` consecutive free entries, leaving the cursor on the
    /// last of them.
    pub(crate) fn dir_alloc(&mut self, dp: &mut DirCursor, n_ent: u32) -> FsResult<()> {
        self.dir_sdi(dp, 0)?;
        let exfat = self.is_exfat();
        let mut n = 0;
        loop {
            let ent = self.dir_entry(dp)?;
            let free = if exfat {
                ent[XDIR_TYPE] & 0x80 == 0
            } else {
                ent[DIR_NAME] == DDEM || ent[DIR_NAME] == 0
            };
            if free {
                n += 1;
                if n == n_ent {
                    return Ok(());
                }
            } else {
                n = 0;
            }
            match self.dir_next(dp, true) {
                Ok(()) => {}
                Err(FsError::NoFile) => return Err(FsError::Denied),
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the entry-set starting at the cursor into `dirbuf`, validating
    /// its layout and checksum. The cursor ends on the last entry of the set.
    pub(crate) fn load_xdir(&mut self, dp: &mut DirCursor) -> FsResult<()> {
        let next = |vol: &mut Volume, dp: &mut DirCursor| match vol.dir_next(dp, false) {
            Err(FsError::NoFile) => Err(FsError::IntErr),
            r => r,
        };

        self.move_window(dp.sect)?;
        let r = Self::entry_range(dp);
        if self.win.buf[r.start + XDIR_TYPE] != ET_FILEDIR {
            return Err(FsError::IntErr);
        }
        self.dirbuf[..SZDIRE].copy_from_slice(&self.win.buf[r]);
        let sz_ent = (self.dirbuf[XDIR_NUM_SEC] as usize + 1) * SZDIRE;
        if !(3 * SZDIRE..=19 * SZDIRE).contains(&sz_ent) {
            return Err(FsError::IntErr);
        }

        next(self, dp)?;
        self.move_window(dp.sect)?;
        let r = Self::entry_range(dp);
        if self.win.buf[r.start + XDIR_TYPE] != ET_STREAM {
            return Err(FsError::IntErr);
        }
        self.dirbuf[SZDIRE..2 * SZDIRE].copy_from_slice(&self.win.buf[r]);
        if max_dirb(self.dirbuf[XDIR_NUM_NAME] as usize) > sz_ent {
            return Err(FsError::IntErr);
        }

        let mut i = 2 * SZDIRE;
        while i < sz_ent {
            next(self, dp)?;
            self.move_window(dp.sect)?;
            let r = Self::entry_range(dp);
            if self.win.buf[r.start + XDIR_TYPE] != ET_FILENAME {
                return Err(FsError::IntErr);
            }
            if i < DIRBUF_SIZE {
                self.dirbuf[i..i + SZDIRE].copy_from_slice(&self.win.buf[r]);
            }
            i += SZDIRE;
        }

        if i <= DIRBUF_SIZE && xdir_sum(&self.dirbuf) != ld16(&self.dirbuf, XDIR_SET_SUM) {
            return Err(FsError::IntErr);
        }
        Ok(())
    }

    /// Load the entry-set of `obj` from its parent directory into `dirbuf`.
    pub(crate) fn load_obj_xdir(&mut self, dp: &mut DirCursor, obj: &ObjId) -> FsResult<()> {
        dp.obj.id = obj.id;
        dp.obj.sclust = obj.parent.sclust;
        dp.obj.chain = obj.parent.chain;
        dp.obj.objsize = obj.parent.size;
        dp.obj.n_frag = 0;
        dp.blk_ofs = Some(obj.parent.ofs);
        self.dir_sdi(dp, obj.parent.ofs)?;
        self.load_xdir(dp)
    }

    /// Write `dirbuf` back as the entry-set at `dp.blk_ofs`, refreshing its
    /// checksum first.
    pub(crate) fn store_xdir(&mut self, dp: &mut DirCursor) -> FsResult<()> {
        let sum = xdir_sum(&self.dirbuf);
        st16(&mut self.dirbuf, XDIR_SET_SUM, sum);
        let nent = self.dirbuf[XDIR_NUM_SEC] as usize + 1;
        let blk = dp.blk_ofs.ok_or(FsError::IntErr)?;
        self.dir_sdi(dp, blk)?;
        for n in 0..nent {
            self.move_window(dp.sect)?;
            let r = Self::entry_range(dp);
            self.win.buf[r].copy_from_slice(&self.dirbuf[n * SZDIRE..(n + 1) * SZDIRE]);
            self.win.dirty = true;
            if n + 1 == nent {
                break;
            }
            match self.dir_next(dp, false) {
                Err(FsError::NoFile) => return Err(FsError::IntErr),
                r => r?,
            }
        }
        Ok(())
    }

    /// Allocation fields of the object held in `dirbuf`.
    pub(crate) fn init_alloc_info(&self, obj: &mut ObjId) {
        obj.sclust = ld32(&self.dirbuf, XDIR_FST_CLUS);
        obj.objsize = ld64(&self.dirbuf, XDIR_FILE_SIZE);
        obj.chain = ChainState::from_gen_flags(self.dirbuf[XDIR_GEN_FLAGS]);
        obj.n_frag = 0;
    }

    /// Read the next object (or the volume label when `vol_label` is set).
    ///
    /// Returns `NoFile` at the end of the directory, with `dp.sect` zeroed.
    pub(crate) fn dir_read(&mut self, dp: &mut DirCursor, vol_label: bool) -> FsResult<()> {
        let mut res = Err(FsError::NoFile);
        let (mut ord, mut sum) = (0xFFu8, 0xFFu8);
        let lfn = self.opts.long_names;

        while dp.sect != 0 {
            self.move_window(dp.sect)?;
            let r = Self::entry_range(dp);
            let mut b = self.win.buf[r.start + DIR_NAME];
            if b == 0 {
                break;
            }
            if self.is_exfat() {
                if vol_label {
                    if b == ET_VLABEL {
                        res = Ok(());
                        break;
                    }
                } else if b == ET_FILEDIR {
                    dp.blk_ofs = Some(dp.dptr);
                    self.load_xdir(dp)?;
                    dp.obj.attr = self.dirbuf[XDIR_ATTR] & AM_MASK;
                    res = Ok(());
                    break;
                }
            } else {
                let ent = &self.win.buf[r];
                let attr = ent[DIR_ATTR] & AM_MASK;
                dp.obj.attr = attr;
                let is_label = (attr & !AM_ARC) == AM_VOL;
                if b == DDEM || b == b'.' || is_label != vol_label {
                    ord = 0xFF;
                } else if attr == AM_LFN {
                    if lfn {
                        if b & LLEF != 0 {
                            sum = ent[LDIR_CHKSUM];
                            b &= !LLEF;
                            ord = b;
                            dp.blk_ofs = Some(dp.dptr);
                        }
                        ord = if b == ord
                            && sum == ent[LDIR_CHKSUM]
                            && pick_lfn(&mut self.lfnbuf, ent)
                        {
                            ord - 1
                        } else {
                            0xFF
                        };
                    }
                } else {
                    if !lfn || ord != 0 || sum != sum_sfn(ent) {
                        dp.blk_ofs = None;
                    }
                    res = Ok(());
                    break;
                }
            }
            match self.dir_next(dp, false) {
                Ok(()) => {}
                Err(FsError::NoFile) => break,
                Err(e) => return Err(e),
            }
        }

        if res.is_err() {
            dp.sect = 0;
        }
        res
    }

    /// Find the entry whose name matches the key prepared in `dp.fname` and
    /// `lfnbuf`. Returns `NoFile` when there is none.
    pub(crate) fn dir_find(&mut self, dp: &mut DirCursor) -> FsResult<()> {
        self.dir_sdi(dp, 0)?;

        if self.is_exfat() {
            let hash = xname_sum(&self.lfnbuf);
            loop {
                self.dir_read(dp, false)?;
                if ld16(&self.dirbuf, XDIR_NAME_HASH) != hash {
                    continue;
                }
                if self.xdir_name_matches() {
                    return Ok(());
                }
            }
        }

        let use_lfn = self.opts.long_names && dp.ns & NS_NOLFN == 0;
        let (mut ord, mut sum) = (0xFFu8, 0xFFu8);
        dp.blk_ofs = None;
        loop {
            self.move_window(dp.sect)?;
            let r = Self::entry_range(dp);
            let ent = &self.win.buf[r];
            let mut c = ent[DIR_NAME];
            if c == 0 {
                return Err(FsError::NoFile);
            }
            let a = ent[DIR_ATTR] & AM_MASK;
            dp.obj.attr = a;
            if c == DDEM || (a & AM_VOL != 0 && a != AM_LFN) {
                ord = 0xFF;
                dp.blk_ofs = None;
            } else if a == AM_LFN {
                if use_lfn {
                    if c & LLEF != 0 {
                        sum = ent[LDIR_CHKSUM];
                        c &= !LLEF;
                        ord = c;
                        dp.blk_ofs = Some(dp.dptr);
                    }
                    ord = if c == ord && sum == ent[LDIR_CHKSUM] && cmp_lfn(&self.lfnbuf, ent) {
                        ord - 1
                    } else {
                        0xFF
                    };
                }
            } else {
                if use_lfn && ord == 0 && sum == sum_sfn(ent) {
                    return Ok(());
                }
                if dp.ns & NS_LOSS == 0 && ent[..11] == dp.fname {
                    return Ok(());
                }
                ord = 0xFF;
                dp.blk_ofs = None;
            }
            self.dir_next(dp, false)?;
        }
    }

    /// Compare the name in `dirbuf` with `lfnbuf`, ignoring case.
    fn xdir_name_matches(&self) -> bool {
        let mut nc = self.dirbuf[XDIR_NUM_NAME] as usize;
        let (mut di, mut ni) = (2 * SZDIRE, 0usize);
        while nc > 0 {
            if di % SZDIRE == 0 {
                di += 2;
            }
            if di + 2 > self.dirbuf.len() {
                return false;
            }
            let want = self.lfnbuf.get(ni).copied().unwrap_or(0);
            if wtoupper(ld16(&self.dirbuf, di)) != wtoupper(want) {
                return false;
            }
            nc -= 1;
            di += 2;
            ni += 1;
        }
        self.lfnbuf.get(ni).copied().unwrap_or(0) == 0
    }

    /// Create the entries for the name held in `dp.fname` / `lfnbuf`.
    ///
    /// On FAT the short-name entry is written (zeroed apart from the name)
    /// and left under the cursor. On exFAT the new entry-set is prepared in
    /// `dirbuf` and `dp.blk_ofs` points at its slot; the caller stores it.
    pub(crate) fn dir_register(&mut self, dp: &mut DirCursor) -> FsResult<()> {
        if dp.ns & (NS_DOT | NS_NONAME) != 0 {
            return Err(FsError::InvalidName);
        }
        let nlen = wlen(&self.lfnbuf);

        if self.is_exfat() {
            let n_ent = (nlen as u32 + 14) / 15 + 2;
            self.dir_alloc(dp, n_ent)?;
            dp.blk_ofs = Some(dp.dptr - SZDIRE as u32 * (n_ent - 1));
            if dp.stretched {
                dp.stretched = false;
                self.fill_first_frag(&mut dp.obj)?;
                let lcl = dp.obj.frag_end;
                self.fill_last_frag(&mut dp.obj, lcl, 0xFFFF_FFFF)?;
                if dp.obj.sclust != 0 {
                    let mut dj = DirCursor::default();
                    self.load_obj_xdir(&mut dj, &dp.obj)?;
                    st64(&mut self.dirbuf, XDIR_FILE_SIZE, dp.obj.objsize);
                    st64(&mut self.dirbuf, XDIR_VALID_FILE_SIZE, dp.obj.objsize);
                    self.dirbuf[XDIR_GEN_FLAGS] = dp.obj.chain.gen_flags();
                    self.store_xdir(&mut dj)?;
                }
            }
            create_xdir(&mut self.dirbuf, &self.lfnbuf);
            return Ok(());
        }

        let sn = dp.fname;
        let flags = dp.ns;
        if flags & NS_LOSS != 0 {
            dp.ns = NS_NOLFN;
            let mut found_slot = false;
            for seq in 1..100 {
                gen_numname(&mut dp.fname, &sn, &self.lfnbuf, seq);
                match self.dir_find(dp) {
                    Ok(()) => continue,
                    Err(FsError::NoFile) => {
                        found_slot = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !found_slot {
                return Err(FsError::Denied);
            }
            dp.ns = flags;
        }

        let n_ent = if self.opts.long_names && flags & NS_LFN != 0 {
            (nlen as u32 + 12) / 13 + 1
        } else {
            1
        };
        self.dir_alloc(dp, n_ent)?;

        if n_ent > 1 {
            let mut ord = n_ent - 1;
            self.dir_sdi(dp, dp.dptr - ord * SZDIRE as u32)?;
            let sum = sum_sfn(&dp.fname);
            while ord > 0 {
                self.move_window(dp.sect)?;
                let r = Self::entry_range(dp);
                put_lfn(&self.lfnbuf, &mut self.win.buf[r], ord as u8, sum);
                self.win.dirty = true;
                self.dir_next(dp, false)?;
                ord -= 1;
            }
        }

        let fname = dp.fname;
        let ent = self.dir_entry(dp)?;
        ent.fill(0);
        let mut sfn = SfnEntryMut(ent);
        sfn.set_name(&fname);
        sfn.set_nt_flags(flags & (NS_BODY | NS_EXT));
        self.win.dirty = true;
        Ok(())
    }

    /// Mark the object under the cursor, including its long-name entries or
    /// the rest of its entry-set, as deleted.
    pub(crate) fn dir_remove(&mut self, dp: &mut DirCursor) -> FsResult<()> {
        let last = dp.dptr;
        if let Some(blk) = dp.blk_ofs {
            self.dir_sdi(dp, blk)?;
        }
        let exfat = self.is_exfat();
        loop {
            let ent = self.dir_entry(dp)?;
            if exfat {
                ent[XDIR_TYPE] &= 0x7F;
            } else {
                ent[DIR_NAME] = DDEM;
            }
            self.win.dirty = true;
            if dp.dptr >= last {
                return Ok(());
            }
            match self.dir_next(dp, false) {
                Err(FsError::NoFile) => return Err(FsError::IntErr),
                r => r?,
            }
        }
    }

    /// Reassemble the long name of the object under the cursor from its
    /// entries on disk. `false` when the object has no usable long name.
    fn reload_lfn(&mut self, dp: &DirCursor) -> FsResult<bool> {
        let Some(blk) = dp.blk_ofs else {
            return Ok(false);
        };
        let mut walk = dp.clone();
        self.dir_sdi(&mut walk, blk)?;
        while walk.dptr < dp.dptr {
            self.move_window(walk.sect)?;
            let r = Self::entry_range(&walk);
            if !pick_lfn(&mut self.lfnbuf, &self.win.buf[r]) {
                return Ok(false);
            }
            match self.dir_next(&mut walk, false) {
                Err(FsError::NoFile) => return Err(FsError::IntErr),
                r => r?,
            }
        }
        Ok(true)
    }

    /// Describe the object under the cursor, as left by `dir_read` or
    /// `dir_find`.
    pub(crate) fn get_fileinfo(&mut self, dp: &DirCursor) -> FsResult<FileInfo> {
        if self.is_exfat() {
            let attr = self.dirbuf[XDIR_ATTR] & AM_MASKX;
            let stamp = ld32(&self.dirbuf, XDIR_MOD_TIME);
            return Ok(FileInfo {
                size: if attr & AM_DIR != 0 {
                    0
                } else {
                    ld64(&self.dirbuf, XDIR_FILE_SIZE)
                },
                date: (stamp >> 16) as u16,
                time: stamp as u16,
                attr,
                name: xdir_name(&self.dirbuf).unwrap_or_else(|| "?".to_string()),
                alt_name: String::new(),
            });
        }

        let long = if self.opts.long_names && self.reload_lfn(dp)? {
            utf16_to_string(&self.lfnbuf).filter(|s| !s.is_empty())
        } else {
            None
        };
        let ent: &[u8] = self.dir_entry(dp)?;
        let view = SfnEntry(ent);
        let short = sfn_to_string(ent);
        let (name, alt_name) = match long {
            Some(name) => (name, short),
            None if short.is_empty() => ("?".to_string(), String::new()),
            None => {
                let display = sfn_display_name(ent);
                let alt = if view.nt_flags() & (NS_BODY_LOWER | NS_EXT_LOWER) != 0 {
                    short
                } else {
                    String::new()
                };
                (display, alt)
            }
        };
        let stamp = view.modified();
        Ok(FileInfo {
            size: view.size() as u64,
            date: (stamp >> 16) as u16,
            time: stamp as u16,
            attr: view.attr() & AM_MASK,
            name,
            alt_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::{formatted_volume, Format};

    fn root_cursor(vol: &Volume) -> DirCursor {
        let mut dp = DirCursor::default();
        dp.obj.id = vol.id;
        dp
    }

    fn prepare(vol: &mut Volume, dp: &mut DirCursor, name: &str) {
        let (flags, _) = create_name(name, &mut vol.lfnbuf, &mut dp.fname).unwrap();
        dp.ns = flags;
    }

    fn register(vol: &mut Volume, dp: &mut DirCursor, name: &str) {
        prepare(vol, dp, name);
        assert_eq!(vol.dir_find(dp), Err(FsError::NoFile));
        vol.dir_register(dp).unwrap();
        if vol.is_exfat() {
            vol.dirbuf[XDIR_ATTR] = AM_ARC;
            vol.store_xdir(dp).unwrap();
        } else {
            let ent = vol.dir_entry(dp).unwrap();
            ent[DIR_ATTR] = AM_ARC;
            vol.win.dirty = true;
        }
    }

    fn list(vol: &mut Volume) -> Vec<FileInfo> {
        let mut dp = root_cursor(vol);
        vol.dir_sdi(&mut dp, 0).unwrap();
        let mut out = Vec::new();
        while vol.dir_read(&mut dp, false).is_ok() {
            out.push(vol.get_fileinfo(&dp).unwrap());
            if vol.dir_next(&mut dp, false).is_err() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_max_dirb() {
        assert_eq!(max_dirb(1), 3 * SZDIRE);
        assert_eq!(max_dirb(15), 3 * SZDIRE);
        assert_eq!(max_dirb(16), 4 * SZDIRE);
        assert_eq!(max_dirb(255), DIRBUF_SIZE);
    }

    #[test]
    fn test_register_and_find_short_name() {
        let mut vol = formatted_volume(Format::Fat16);
        let mut dp = root_cursor(&vol);
        register(&mut vol, &mut dp, "README.TXT");

        let mut dp = root_cursor(&vol);
        prepare(&mut vol, &mut dp, "readme.txt");
        vol.dir_find(&mut dp).unwrap();
        let info = vol.get_fileinfo(&dp).unwrap();
        assert_eq!(info.name, "README.TXT");
        assert_eq!(info.alt_name, "");
    }

    #[test]
    fn test_lower_case_name_uses_nt_flags() {
        let mut vol = formatted_volume(Format::Fat16);
        let mut dp = root_cursor(&vol);
        register(&mut vol, &mut dp, "notes.txt");
        let names = list(&mut vol);
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].name, "notes.txt");
        assert_eq!(names[0].alt_name, "NOTES.TXT");
    }

    #[test]
    fn test_long_names_get_unique_short_aliases() {
        let mut vol = formatted_volume(Format::Fat32);
        let names = [
            "Quarterly Report 1.docx",
            "Quarterly Report 2.docx",
            "Quarterly Report 3.docx",
            "Quarterly Report 4.docx",
            "Quarterly Report 5.docx",
            "Quarterly Report 6.docx",
            "Quarterly Report 7.docx",
        ];
        for n in names {
            let mut dp = root_cursor(&vol);
            register(&mut vol, &mut dp, n);
        }
        let listed = list(&mut vol);
        assert_eq!(listed.len(), names.len());
        let mut alts: Vec<_> = listed.iter().map(|i| i.alt_name.clone()).collect();
        assert!(alts.contains(&"QUARTE~1.DOC".to_string()));
        alts.sort();
        alts.dedup();
        assert_eq!(alts.len(), names.len());

        for n in names {
            let mut dp = root_cursor(&vol);
            prepare(&mut vol, &mut dp, n);
            vol.dir_find(&mut dp).unwrap();
            assert_eq!(vol.get_fileinfo(&dp).unwrap().name, n);
        }
    }

    #[test]
    fn test_remove_deletes_long_name_block() {
        let mut vol = formatted_volume(Format::Fat16);
        let mut dp = root_cursor(&vol);
        register(&mut vol, &mut dp, "a rather long file name.text");
        let mut dp = root_cursor(&vol);
        prepare(&mut vol, &mut dp, "A Rather Long File Name.TEXT");
        vol.dir_find(&mut dp).unwrap();
        assert_eq!(dp.blk_ofs, Some(0));
        vol.dir_remove(&mut dp).unwrap();

        let mut dp = root_cursor(&vol);
        vol.dir_sdi(&mut dp, 0).unwrap();
        for _ in 0..4 {
            assert_eq!(vol.dir_entry(&dp).unwrap()[0], DDEM);
            vol.dir_next(&mut dp, false).unwrap();
        }
        assert!(list(&mut vol).is_empty());
    }

    #[test]
    fn test_exfat_entry_set_checksum_and_lookup() {
        let mut vol = formatted_volume(Format::ExFat);
        let mut dp = root_cursor(&vol);
        register(&mut vol, &mut dp, "Ünïcode name for the lookup test.bin");

        let mut dp = root_cursor(&vol);
        prepare(&mut vol, &mut dp, "ÜNÏCODE NAME FOR THE LOOKUP TEST.BIN");
        vol.dir_find(&mut dp).unwrap();
        assert_eq!(xdir_sum(&vol.dirbuf), ld16(&vol.dirbuf, XDIR_SET_SUM));
        assert_eq!(vol.dirbuf[XDIR_NUM_SEC], 4);
        let info = vol.get_fileinfo(&dp).unwrap();
        assert_eq!(info.name, "Ünïcode name for the lookup test.bin");
        assert_eq!(info.attr, AM_ARC);
    }

    #[test]
    fn test_exfat_corrupt_checksum_is_internal_error() {
        let mut vol = formatted_volume(Format::ExFat);
        let mut dp = root_cursor(&vol);
        register(&mut vol, &mut dp, "data.bin");
        let blk = dp.blk_ofs.unwrap();

        let mut dp = root_cursor(&vol);
        vol.dir_sdi(&mut dp, blk + SZDIRE as u32).unwrap();
        let ent = vol.dir_entry(&dp).unwrap();
        ent[XDIR_FILE_SIZE - SZDIRE] ^= 0xFF;
        vol.win.dirty = true;

        let mut dp = root_cursor(&vol);
        prepare(&mut vol, &mut dp, "data.bin");
        assert_eq!(vol.dir_find(&mut dp), Err(FsError::IntErr));
    }

    #[test]
    fn test_fixed_root_fills_up() {
        let mut vol = formatted_volume(Format::Fat12);
        let capacity = vol.n_rootdir;
        for i in 0..capacity {
            let mut dp = root_cursor(&vol);
            register(&mut vol, &mut dp, &format!("F{i}.DAT"));
        }
        let mut dp = root_cursor(&vol);
        prepare(&mut vol, &mut dp, "ONEMORE.DAT");
        assert_eq!(vol.dir_register(&mut dp), Err(FsError::Denied));
    }
}
