//! Cluster table access: FAT12/16/32 entry codec, the exFAT allocation
//! bitmap, and chain allocation/release on top of both.

use log::trace;

use super::layout::{ld16, ld32, st16, st32, GEN_FLAG_NO_FAT_CHAIN};
use super::volume::{FatKind, Volume};
use crate::device::IoctlRequest;
use crate::error::{FsError, FsResult};

/// exFAT end-of-chain value as returned by [`Volume::get_fat`].
pub(crate) const EXFAT_EOC: u32 = 0x7FFF_FFFF;

/// How an object's cluster chain is recorded on an exFAT volume.
///
/// FAT12/16/32 objects are always `Linked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ChainState {
    /// Every link is in the table (or the object has no clusters yet).
    #[default]
    Linked,
    /// Consecutive clusters from the start cluster, no table entries.
    Contiguous,
    /// Was contiguous when this session started growing it. The first
    /// `first_run` clusters still have implied links that are written to the
    /// table on sync.
    Fragmented { first_run: u32 },
}

impl ChainState {
    pub fn from_gen_flags(flags: u8) -> Self {
        if flags & GEN_FLAG_NO_FAT_CHAIN != 0 {
            ChainState::Contiguous
        } else {
            ChainState::Linked
        }
    }

    /// Stream extension general flags: allocation possible, plus the
    /// no-FAT-chain bit for contiguous objects.
    pub fn gen_flags(self) -> u8 {
        match self {
            ChainState::Contiguous => 1 | GEN_FLAG_NO_FAT_CHAIN,
            _ => 1,
        }
    }
}

/// Location of an exFAT object's own entry-set in its parent directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ParentRef {
    pub sclust: u32,
    pub size: u64,
    pub chain: ChainState,
    /// Byte offset of the entry-set within the parent.
    pub ofs: u32,
}

/// Identity shared by open files and directories.
#[derive(Debug, Clone, Default)]
pub(crate) struct ObjId {
    /// Mount generation of the owning volume.
    pub id: u16,
    pub attr: u8,
    pub chain: ChainState,
    /// Start cluster, 0 when nothing is allocated.
    pub sclust: u32,
    pub objsize: u64,
    /// exFAT: clusters of the trailing fragment whose links are pending.
    pub n_frag: u32,
    /// exFAT: last cluster of that pending fragment.
    pub frag_end: u32,
    pub parent: ParentRef,
}

impl Volume {
    /// Read the table entry following `clst` for `obj`.
    ///
    /// Values at or above `n_fatent` mark the end of the chain, 0 a free
    /// cluster. A raw value of 1 is reported as an internal error.
    pub(crate) fn get_fat(&mut self, obj: &ObjId, clst: u32) -> FsResult<u32> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(FsError::IntErr);
        }
        let val = match self.kind {
            FatKind::Fat12 => {
                let bc = clst as u64 + clst as u64 / 2;
                let (sect, ofs) = self.fat_pos(bc);
                self.move_window(sect)?;
                let mut wc = self.win.buf[ofs] as u32;
                let (sect, ofs) = self.fat_pos(bc + 1);
                self.move_window(sect)?;
                wc |= (self.win.buf[ofs] as u32) << 8;
                if clst & 1 != 0 {
                    wc >> 4
                } else {
                    wc & 0xFFF
                }
            }
            FatKind::Fat16 => {
                let (sect, ofs) = self.fat_pos(clst as u64 * 2);
                self.move_window(sect)?;
                ld16(&self.win.buf, ofs) as u32
            }
            FatKind::Fat32 => {
                let (sect, ofs) = self.fat_pos(clst as u64 * 4);
                self.move_window(sect)?;
                ld32(&self.win.buf, ofs) & 0x0FFF_FFFF
            }
            FatKind::ExFat => return self.get_exfat_link(obj, clst),
        };
        match val {
            1 => Err(FsError::IntErr),
            v => Ok(v),
        }
    }

    fn get_exfat_link(&mut self, obj: &ObjId, clst: u32) -> FsResult<u32> {
        if !((obj.objsize != 0 && obj.sclust != 0) || obj.chain == ChainState::Linked) {
            return Err(FsError::IntErr);
        }
        let cofs = clst.wrapping_sub(obj.sclust);
        match obj.chain {
            ChainState::Contiguous => {
                let clen = (obj.objsize.wrapping_sub(1) / self.ssize as u64 / self.csize as u64)
                    as u32;
                if cofs <= clen {
                    return Ok(if cofs == clen { EXFAT_EOC } else { clst + 1 });
                }
                Err(FsError::IntErr)
            }
            ChainState::Fragmented { first_run } if cofs < first_run => Ok(clst + 1),
            _ => {
                if obj.n_frag != 0 {
                    let first = obj.frag_end + 1 - obj.n_frag;
                    if clst == obj.frag_end {
                        return Ok(EXFAT_EOC);
                    }
                    if clst >= first && clst < obj.frag_end {
                        return Ok(clst + 1);
                    }
                }
                let (sect, ofs) = self.fat_pos(clst as u64 * 4);
                self.move_window(sect)?;
                match ld32(&self.win.buf, ofs) & 0x7FFF_FFFF {
                    1 => Err(FsError::IntErr),
                    v => Ok(v),
                }
            }
        }
    }

    /// Store a table entry. FAT32 keeps the reserved top four bits.
    pub(crate) fn put_fat(&mut self, clst: u32, val: u32) -> FsResult<()> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(FsError::IntErr);
        }
        match self.kind {
            FatKind::Fat12 => {
                let bc = clst as u64 + clst as u64 / 2;
                let odd = clst & 1 != 0;
                let (sect, ofs) = self.fat_pos(bc);
                self.move_window(sect)?;
                let b = &mut self.win.buf[ofs];
                *b = if odd {
                    (*b & 0x0F) | ((val as u8) << 4)
                } else {
                    val as u8
                };
                self.win.dirty = true;
                let (sect, ofs) = self.fat_pos(bc + 1);
                self.move_window(sect)?;
                let b = &mut self.win.buf[ofs];
                *b = if odd {
                    (val >> 4) as u8
                } else {
                    (*b & 0xF0) | ((val >> 8) as u8 & 0x0F)
                };
            }
            FatKind::Fat16 => {
                let (sect, ofs) = self.fat_pos(clst as u64 * 2);
                self.move_window(sect)?;
                st16(&mut self.win.buf, ofs, val as u16);
            }
            FatKind::Fat32 | FatKind::ExFat => {
                let (sect, ofs) = self.fat_pos(clst as u64 * 4);
                self.move_window(sect)?;
                let val = if self.kind == FatKind::Fat32 {
                    (val & 0x0FFF_FFFF) | (ld32(&self.win.buf, ofs) & 0xF000_0000)
                } else {
                    val
                };
                st32(&mut self.win.buf, ofs, val);
            }
        }
        self.win.dirty = true;
        Ok(())
    }

    fn bitmap_pos(&self, bit: u32) -> (u64, usize, u8) {
        let bits_per_sect = self.ssize as u64 * 8;
        (
            self.bitbase + bit as u64 / bits_per_sect,
            (bit / 8 % self.ssize) as usize,
            1u8 << (bit % 8),
        )
    }

    /// Find `ncl` consecutive free clusters, scanning circularly from `clst`.
    pub(crate) fn find_bitmap(&mut self, clst: u32, ncl: u32) -> FsResult<Option<u32>> {
        let total = self.n_fatent - 2;
        let mut start = clst.wrapping_sub(2);
        if start >= total {
            start = 0;
        }
        let (mut val, mut scl, mut ctr) = (start, start, 0u32);
        loop {
            let (sect, byte, mask) = self.bitmap_pos(val);
            self.move_window(sect)?;
            let used = self.win.buf[byte] & mask != 0;
            if !used {
                ctr += 1;
                if ctr == ncl {
                    return Ok(Some(scl + 2));
                }
            }
            val += 1;
            if val >= total {
                val = 0;
                scl = 0;
                ctr = 0;
            } else if used {
                scl = val;
                ctr = 0;
            }
            if val == start {
                return Ok(None);
            }
        }
    }

    /// Flip `ncl` bitmap bits starting at `clst` to `set`. Finding a bit
    /// already in the requested state is an internal error.
    pub(crate) fn change_bitmap(&mut self, clst: u32, ncl: u32, set: bool) -> FsResult<()> {
        let mut bit = clst - 2;
        for _ in 0..ncl {
            let (sect, byte, mask) = self.bitmap_pos(bit);
            self.move_window(sect)?;
            if (self.win.buf[byte] & mask != 0) == set {
                return Err(FsError::IntErr);
            }
            self.win.buf[byte] ^= mask;
            self.win.dirty = true;
            bit += 1;
        }
        Ok(())
    }

    /// Write the implied links of a chain that got fragmented this session.
    pub(crate) fn fill_first_frag(&mut self, obj: &mut ObjId) -> FsResult<()> {
        if let ChainState::Fragmented { first_run } = obj.chain {
            let mut cl = obj.sclust;
            for _ in 0..first_run {
                self.put_fat(cl, cl + 1)?;
                cl += 1;
            }
            obj.chain = ChainState::Linked;
        }
        Ok(())
    }

    /// Write the pending links of the trailing fragment ending at `lcl`,
    /// terminating it with `term`.
    pub(crate) fn fill_last_frag(&mut self, obj: &mut ObjId, lcl: u32, term: u32) -> FsResult<()> {
        while obj.n_frag > 0 {
            let cl = lcl - obj.n_frag + 1;
            let next = if obj.n_frag > 1 { cl + 1 } else { term };
            self.put_fat(cl, next)?;
            obj.n_frag -= 1;
        }
        Ok(())
    }

    fn trim_run(&self, scl: u32, ecl: u32) {
        if !self.opts.trim {
            return;
        }
        let start = self.clst2sect(scl);
        let end = self.clst2sect(ecl) + self.csize as u64 - 1;
        // Trim is only a hint; a device that rejects it loses nothing.
        let _ = self.dev.ioctl(IoctlRequest::Trim { start, end });
    }

    /// Free the chain starting at `clst`. When `pclst` is non-zero it is the
    /// cluster before `clst` and becomes the new end of the chain.
    pub(crate) fn remove_chain(&mut self, obj: &mut ObjId, clst: u32, pclst: u32) -> FsResult<()> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(FsError::IntErr);
        }
        let exfat = self.is_exfat();
        if pclst != 0 && !(exfat && obj.chain == ChainState::Contiguous) {
            self.put_fat(pclst, 0xFFFF_FFFF)?;
        }

        let (mut scl, mut ecl, mut clst) = (clst, clst, clst);
        loop {
            let nxt = self.get_fat(obj, clst)?;
            if nxt == 0 {
                break;
            }
            if !exfat {
                self.put_fat(clst, 0)?;
            }
            if let Some(n) = self.free_clst {
                if n < self.n_fatent - 2 {
                    self.free_clst = Some(n + 1);
                    self.fsi_dirty = true;
                }
            }
            if ecl + 1 == nxt {
                ecl = nxt;
            } else {
                if exfat {
                    self.change_bitmap(scl, ecl - scl + 1, false)?;
                }
                self.trim_run(scl, ecl);
                scl = nxt;
                ecl = nxt;
            }
            clst = nxt;
            if clst >= self.n_fatent {
                break;
            }
        }

        if exfat {
            if pclst == 0 {
                obj.chain = ChainState::Linked;
            } else {
                match obj.chain {
                    ChainState::Linked => {
                        // A table chain may have become contiguous again.
                        let mut cl = obj.sclust;
                        while cl != pclst {
                            let nxt = self.get_fat(obj, cl)?;
                            if nxt < 2 {
                                return Err(FsError::IntErr);
                            }
                            if nxt != cl + 1 {
                                break;
                            }
                            cl += 1;
                        }
                        if cl == pclst {
                            obj.chain = ChainState::Contiguous;
                        }
                    }
                    ChainState::Fragmented { first_run }
                        if pclst >= obj.sclust && pclst <= obj.sclust + first_run =>
                    {
                        obj.chain = ChainState::Contiguous;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Allocate one cluster, either starting a new chain (`clst` 0) or
    /// appending after `clst`.
    ///
    /// Returns `None` when the volume is full. If `clst` is already followed
    /// by another cluster, that cluster is returned unchanged.
    pub(crate) fn create_chain(&mut self, obj: &mut ObjId, clst: u32) -> FsResult<Option<u32>> {
        let mut scl = if clst == 0 {
            match self.last_clst {
                c if c == 0 || c >= self.n_fatent => 1,
                c => c,
            }
        } else {
            let cs = self.get_fat(obj, clst)?;
            if cs < 2 {
                return Err(FsError::IntErr);
            }
            if cs < self.n_fatent {
                return Ok(Some(cs));
            }
            clst
        };
        if self.free_clst == Some(0) {
            return Ok(None);
        }

        let ncl = if self.is_exfat() {
            let Some(ncl) = self.find_bitmap(scl, 1)? else {
                return Ok(None);
            };
            self.change_bitmap(ncl, 1, true)?;
            if clst == 0 {
                obj.chain = ChainState::Contiguous;
            } else if obj.chain == ChainState::Contiguous && ncl != scl + 1 {
                obj.chain = ChainState::Fragmented {
                    first_run: scl - obj.sclust,
                };
            }
            if obj.chain != ChainState::Contiguous {
                if ncl == clst + 1 {
                    obj.n_frag = if obj.n_frag != 0 { obj.n_frag + 1 } else { 2 };
                } else {
                    if obj.n_frag == 0 {
                        obj.n_frag = 1;
                    }
                    self.fill_last_frag(obj, clst, ncl)?;
                    obj.n_frag = 1;
                }
                obj.frag_end = ncl;
            }
            ncl
        } else {
            let mut ncl = 0;
            if scl == clst {
                // Try the cluster right after the tail first.
                ncl = scl + 1;
                if ncl >= self.n_fatent {
                    ncl = 2;
                }
                if self.get_fat(obj, ncl)? != 0 {
                    let hint = self.last_clst;
                    if hint >= 2 && hint < self.n_fatent {
                        scl = hint;
                    }
                    ncl = 0;
                }
            }
            if ncl == 0 {
                ncl = scl;
                loop {
                    ncl += 1;
                    if ncl >= self.n_fatent {
                        ncl = 2;
                        if ncl > scl {
                            return Ok(None);
                        }
                    }
                    if self.get_fat(obj, ncl)? == 0 {
                        break;
                    }
                    if ncl == scl {
                        return Ok(None);
                    }
                }
            }
            self.put_fat(ncl, 0xFFFF_FFFF)?;
            if clst != 0 {
                self.put_fat(clst, ncl)?;
            }
            ncl
        };

        trace!("allocated cluster {ncl} after {clst}");
        self.last_clst = ncl;
        if let Some(n) = self.free_clst {
            if n <= self.n_fatent - 2 {
                self.free_clst = Some(n.saturating_sub(1));
            }
        }
        self.fsi_dirty = true;
        Ok(Some(ncl))
    }

    /// Zero every sector of `clst`, leaving the window on its first sector.
    pub(crate) fn clear_cluster(&mut self, clst: u32) -> FsResult<()> {
        self.sync_window()?;
        let sect = self.clst2sect(clst);
        if sect == 0 {
            return Err(FsError::IntErr);
        }
        self.win.assume_zeroed(sect);
        for n in 0..self.csize as u64 {
            self.dev.write(&self.win.buf, sect + n, 1)?;
        }
        Ok(())
    }

    /// Count free clusters with a full table or bitmap scan.
    pub(crate) fn count_free(&mut self) -> FsResult<u32> {
        let mut nfree = 0u32;
        match self.kind {
            FatKind::Fat12 => {
                let obj = ObjId::default();
                for clst in 2..self.n_fatent {
                    if self.get_fat(&obj, clst)? == 0 {
                        nfree += 1;
                    }
                }
            }
            FatKind::ExFat => {
                let total = self.n_fatent - 2;
                let bits_per_sect = self.ssize * 8;
                let mut bit = 0u32;
                let mut sect = self.bitbase;
                while bit < total {
                    self.move_window(sect)?;
                    let n = bits_per_sect.min(total - bit);
                    let full = (n / 8) as usize;
                    nfree += self.win.buf[..full]
                        .iter()
                        .map(|b| b.count_zeros())
                        .sum::<u32>();
                    if n % 8 != 0 {
                        let mask = (1u8 << (n % 8)) - 1;
                        nfree += (!self.win.buf[full] & mask).count_ones();
                    }
                    bit += n;
                    sect += 1;
                }
            }
            FatKind::Fat16 | FatKind::Fat32 => {
                let width = if self.kind == FatKind::Fat16 { 2 } else { 4 };
                let per_sect = self.ssize / width;
                let mut sect = self.fatbase;
                let mut remaining = self.n_fatent;
                while remaining > 0 {
                    self.move_window(sect)?;
                    let n = per_sect.min(remaining);
                    for i in 0..n as usize {
                        let free = if width == 2 {
                            ld16(&self.win.buf, i * 2) == 0
                        } else {
                            ld32(&self.win.buf, i * 4) & 0x0FFF_FFFF == 0
                        };
                        if free {
                            nfree += 1;
                        }
                    }
                    remaining -= n;
                    sect += 1;
                }
            }
        }
        Ok(nfree)
    }
}
