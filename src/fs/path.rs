//! Path walking: volume prefixes, relative paths and segment-by-segment
//! resolution through the directory cursor.

use super::chain::{ChainState, ParentRef};
use super::dir::{ld_clust, DirCursor};
use super::layout::*;
use super::name::*;
use super::volume::Volume;
use crate::error::{FsError, FsResult};

/// Split an optional volume prefix (`"1:"` or a configured string id such as
/// `"sd:"`) from `path`. `None` selects the current drive.
pub(crate) fn split_volume<'p>(
    path: &'p str,
    volume_strings: &[String],
) -> FsResult<(Option<usize>, &'p str)> {
    let end = path
        .find(|c: char| is_separator(c) || (c as u32) < 0x20)
        .unwrap_or(path.len());
    let Some(colon) = path[..end].find(':') else {
        return Ok((None, path));
    };
    let (id, rest) = (&path[..colon], &path[colon + 1..]);

    if id.len() == 1 {
        if let Some(d) = id.chars().next().and_then(|c| c.to_digit(10)) {
            return Ok((Some(d as usize), rest));
        }
    }
    volume_strings
        .iter()
        .position(|s| s.trim_end_matches(':').eq_ignore_ascii_case(id))
        .map(|v| (Some(v), rest))
        .ok_or(FsError::InvalidDrive)
}

fn has_dot_segment(path: &str) -> bool {
    path.split(is_separator).any(|s| s == "." || s == "..")
}

/// Resolve `.` and `..` segments of `path` against `cwd` lexically, giving
/// an absolute path. `..` at the root stays at the root.
pub(crate) fn normalize_dots(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = if path.starts_with(is_separator) {
        Vec::new()
    } else {
        cwd.split(is_separator).filter(|s| !s.is_empty()).collect()
    };
    for seg in path.split(is_separator) {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Cut the path at the first control character.
fn terminated(path: &str) -> &str {
    match path.find(|c: char| (c as u32) < 0x20) {
        Some(i) => &path[..i],
        None => path,
    }
}

impl Volume {
    /// Start cluster recorded in the short-name entry under the cursor.
    pub(crate) fn entry_cluster(&mut self, dp: &DirCursor) -> FsResult<u32> {
        self.move_window(dp.sect)?;
        let ent = &self.win.buf[dp.dir_ofs..dp.dir_ofs + SZDIRE];
        Ok(ld_clust(self, ent))
    }

    /// Walk `path` (without volume prefix) from the root or the current
    /// directory.
    ///
    /// On success the cursor sits on the terminal object, or `dp.ns` carries
    /// `NS_NONAME` when the path names the start directory itself. A missing
    /// terminal segment yields `NoFile` with the cursor primed for
    /// registration; a missing intermediate one yields `NoPath`. When
    /// `names` is given, the stored name of each resolved segment is pushed.
    pub(crate) fn follow_path(
        &mut self,
        dp: &mut DirCursor,
        path: &str,
        mut names: Option<&mut Vec<String>>,
    ) -> FsResult<()> {
        let path = terminated(path);
        let normalized;
        let path = if has_dot_segment(path) {
            normalized = normalize_dots(&self.cdir.path, path);
            normalized.as_str()
        } else {
            path
        };

        dp.obj.id = self.id;
        dp.obj.n_frag = 0;
        dp.obj.chain = ChainState::Linked;
        dp.obj.objsize = 0;
        dp.stretched = false;
        let path = if path.starts_with(is_separator) {
            dp.obj.sclust = 0;
            dp.obj.parent = ParentRef::default();
            path.trim_start_matches(is_separator)
        } else {
            dp.obj.sclust = self.cdir.sclust;
            dp.obj.parent = self.cdir.parent;
            if let Some(names) = names.as_deref_mut() {
                names.extend(
                    self.cdir
                        .path
                        .split(is_separator)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
            }
            if self.is_exfat() && dp.obj.sclust != 0 {
                let mut dj = DirCursor::default();
                let obj = dp.obj.clone();
                self.load_obj_xdir(&mut dj, &obj)?;
                dp.obj.objsize = ld64(&self.dirbuf, XDIR_FILE_SIZE);
                dp.obj.chain = ChainState::from_gen_flags(self.dirbuf[XDIR_GEN_FLAGS]);
            }
            path
        };

        if path.is_empty() {
            dp.ns = NS_NONAME;
            return self.dir_sdi(dp, 0);
        }

        let mut path = path;
        loop {
            let (ns, rest) = create_name(path, &mut self.lfnbuf, &mut dp.fname)?;
            if !self.opts.long_names && ns & NS_LOSS != 0 {
                return Err(FsError::InvalidName);
            }
            dp.ns = ns;
            path = rest;

            match self.dir_find(dp) {
                Ok(()) => {}
                Err(FsError::NoFile) if ns & NS_DOT != 0 => {
                    // No dot entry here (root, or exFAT): stay in place.
                    if ns & NS_LAST == 0 {
                        continue;
                    }
                    dp.ns = NS_NONAME;
                    return Ok(());
                }
                Err(FsError::NoFile) if ns & NS_LAST == 0 => return Err(FsError::NoPath),
                Err(e) => return Err(e),
            }

            if let Some(names) = names.as_deref_mut() {
                if ns & NS_DOT == 0 {
                    names.push(self.get_fileinfo(dp)?.name);
                }
            }
            if ns & NS_LAST != 0 {
                return Ok(());
            }
            if dp.obj.attr & AM_DIR == 0 {
                return Err(FsError::NoPath);
            }

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
        }
    }
}
