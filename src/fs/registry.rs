//! The public entry point: attached drives, logical volume slots with their
//! per-volume locks, lazy mounting, and path-based operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use super::entry::FileInfo;
use super::file::{File, OpenMode};
use super::lock::LockTable;
use super::mkfs::{self, MkfsOptions};
use super::ops::Dir;
use super::path::split_volume;
use super::volume::{FatKind, Volume, VolumeOptions};
use crate::config::FsConfig;
use crate::device::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::partition::{create_partitions, PartitionStyle};

/// System id given to partitions created by [`FatFs::fdisk`].
const FDISK_SYSTEM_ID: u8 = 0x07;
const LOCK_POLL: Duration = Duration::from_millis(1);

/// Free space report of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeSpace {
    pub free_clusters: u32,
    pub total_clusters: u32,
    pub cluster_bytes: u64,
}

impl FreeSpace {
    pub fn free_bytes(&self) -> u64 {
        self.free_clusters as u64 * self.cluster_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_clusters as u64 * self.cluster_bytes
    }
}

// ---------------------------------------------------------------------------
// Volume slots
// ---------------------------------------------------------------------------

pub(crate) struct SlotState {
    vol: Option<Volume>,
    /// Registered with [`FatFs::mount`]; operations on a disabled slot fail.
    enabled: bool,
}

impl SlotState {
    /// The mounted volume, if `id` still names the current mount and the
    /// medium is still there.
    pub(crate) fn validate(&mut self, id: u16) -> FsResult<&mut Volume> {
        match self.vol.as_mut() {
            Some(vol) if id != 0 && vol.id == id && vol.is_alive() => Ok(vol),
            _ => Err(FsError::InvalidObject),
        }
    }
}

/// One logical volume and the lock serialising access to it.
///
/// The lock is not reentrant: a thread that already holds it (for example
/// from inside a [`File::forward`] sink) gets `Timeout` at once instead of
/// waiting on itself.
pub(crate) struct VolumeSlot {
    index: usize,
    state: Mutex<SlotState>,
    owner: Mutex<Option<ThreadId>>,
    timeout: Duration,
}

/// Held volume lock. Clears the owner record on release.
pub(crate) struct SlotGuard<'a> {
    state: MutexGuard<'a, SlotState>,
    owner: &'a Mutex<Option<ThreadId>>,
}

impl Deref for SlotGuard<'_> {
    type Target = SlotState;

    fn deref(&self) -> &SlotState {
        &self.state
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut SlotState {
        &mut self.state
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl VolumeSlot {
    fn new(index: usize, timeout: Duration) -> Self {
        Self {
            index,
            state: Mutex::new(SlotState {
                vol: None,
                enabled: false,
            }),
            owner: Mutex::new(None),
            timeout,
        }
    }

    fn owner(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquired<'a>(&'a self, state: MutexGuard<'a, SlotState>) -> SlotGuard<'a> {
        *self.owner() = Some(thread::current().id());
        SlotGuard {
            state,
            owner: &self.owner,
        }
    }

    /// Take the volume lock, giving up with `Timeout` after the configured
    /// wait.
    pub(crate) fn lock(&self) -> FsResult<SlotGuard<'_>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.state.try_lock() {
                Ok(guard) => return Ok(self.acquired(guard)),
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("volume {} lock poisoned, recovering", self.index);
                    return Ok(self.acquired(poisoned.into_inner()));
                }
                Err(TryLockError::WouldBlock) => {
                    if *self.owner() == Some(thread::current().id()) {
                        warn!("volume {}: lock re-entered by its holder", self.index);
                        return Err(FsError::Timeout);
                    }
                    if Instant::now() >= deadline {
                        warn!("volume {}: timed out waiting for lock", self.index);
                        return Err(FsError::Timeout);
                    }
                    thread::sleep(LOCK_POLL);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A set of logical FAT/exFAT volumes on attached block devices.
///
/// Paths may start with a volume prefix (`"1:/dir/file"`, or a configured
/// string id like `"sd:/file"`); without one the current drive is used.
/// Operations on different volumes run in parallel, those on one volume are
/// serialised.
pub struct FatFs {
    config: FsConfig,
    opts: VolumeOptions,
    drives: Mutex<HashMap<u8, Arc<dyn BlockDevice>>>,
    slots: Vec<Arc<VolumeSlot>>,
    locks: Arc<LockTable>,
    next_id: AtomicU16,
    current: AtomicUsize,
}

impl std::fmt::Debug for FatFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatFs")
            .field("volumes", &self.slots.len())
            .field("current", &self.current.load(Ordering::Relaxed))
            .field("locks", &self.locks)
            .finish()
    }
}

impl FatFs {
    pub fn new(config: FsConfig) -> FsResult<Self> {
        if let Err(e) = config.validate() {
            warn!("rejecting configuration: {e:#}");
            return Err(FsError::InvalidParameter);
        }
        let timeout = Duration::from_millis(config.lock_timeout_ms);
        let slots = (0..config.volumes)
            .map(|i| Arc::new(VolumeSlot::new(i, timeout)))
            .collect();
        Ok(Self {
            opts: VolumeOptions::from_config(&config),
            locks: Arc::new(LockTable::new(config.max_open_objects)),
            config,
            drives: Mutex::new(HashMap::new()),
            slots,
            next_id: AtomicU16::new(1),
            current: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    fn drives(&self) -> MutexGuard<'_, HashMap<u8, Arc<dyn BlockDevice>>> {
        self.drives.lock().unwrap_or_else(|poisoned| {
            warn!("drive table mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Make `dev` available as physical drive `pdrv`.
    pub fn attach(&self, pdrv: u8, dev: Arc<dyn BlockDevice>) {
        debug!("drive {pdrv} attached");
        self.drives().insert(pdrv, dev);
    }

    /// Remove physical drive `pdrv`, invalidating volumes mounted from it.
    pub fn detach(&self, pdrv: u8) -> FsResult<Option<Arc<dyn BlockDevice>>> {
        self.invalidate_drive(pdrv)?;
        Ok(self.drives().remove(&pdrv))
    }

    fn next_mount_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Slot named by the volume prefix of `path`, and the rest of the path.
    fn resolve<'p>(&self, path: &'p str) -> FsResult<(Arc<VolumeSlot>, &'p str)> {
        let (vol, rest) = split_volume(path, &self.config.volume_strings)?;
        let index = vol.unwrap_or_else(|| self.current.load(Ordering::Relaxed));
        let slot = self.slots.get(index).ok_or(FsError::InvalidDrive)?;
        Ok((Arc::clone(slot), rest))
    }

    fn drop_volume(&self, state: &mut SlotState) {
        if let Some(vol) = state.vol.take() {
            self.locks.release_volume(vol.id);
        }
    }

    /// Mount the slot's volume unless a live mount exists.
    fn ensure_mounted(&self, slot: &VolumeSlot, state: &mut SlotState) -> FsResult<()> {
        if !state.enabled {
            return Err(FsError::NotEnabled);
        }
        match state.vol.as_ref().map(Volume::is_alive) {
            Some(true) => return Ok(()),
            Some(false) => {
                debug!("volume {}: medium changed, remounting", slot.index);
                self.drop_volume(state);
            }
            None => {}
        }
        let mapping = self.config.mapping(slot.index);
        let dev = self
            .drives()
            .get(&mapping.drive)
            .cloned()
            .ok_or(FsError::NotReady)?;
        let vol = Volume::mount(
            dev,
            mapping.drive,
            mapping.partition,
            self.next_mount_id(),
            self.opts.clone(),
        )?;
        info!(
            "volume {}: mounted {} from drive {} ({} clusters of {} bytes)",
            slot.index,
            vol.kind,
            mapping.drive,
            vol.n_fatent - 2,
            vol.cluster_bytes()
        );
        state.vol = Some(vol);
        Ok(())
    }

    /// Run `f` on the mounted volume named by `path`, with the volume locked.
    fn with_volume<T>(
        &self,
        path: &str,
        write: bool,
        f: impl FnOnce(&mut Volume, &str, &Arc<VolumeSlot>) -> FsResult<T>,
    ) -> FsResult<T> {
        let (slot, rest) = self.resolve(path)?;
        let mut state = slot.lock()?;
        self.ensure_mounted(&slot, &mut state)?;
        let vol = state.vol.as_mut().ok_or(FsError::NotEnabled)?;
        if write {
            vol.check_writable()?;
        }
        f(vol, rest, &slot)
    }

    /// Register the volume named by `path` (e.g. `"0:"`). With `now` the
    /// volume is mounted immediately, otherwise on first access. Handles
    /// from an earlier mount become invalid.
    pub fn mount(&self, path: &str, now: bool) -> FsResult<()> {
        let (slot, _) = self.resolve(path)?;
        let mut state = slot.lock()?;
        self.drop_volume(&mut state);
        state.enabled = true;
        if now {
            self.ensure_mounted(&slot, &mut state)?;
        }
        Ok(())
    }

    /// Unregister a volume; its open handles become invalid.
    pub fn unmount(&self, path: &str) -> FsResult<()> {
        let (slot, _) = self.resolve(path)?;
        let mut state = slot.lock()?;
        if let Some(vol) = state.vol.as_mut() {
            if let Err(e) = vol.sync_fs() {
                warn!("volume {}: sync on unmount failed: {e}", slot.index);
            }
        }
        self.drop_volume(&mut state);
        state.enabled = false;
        info!("volume {} unmounted", slot.index);
        Ok(())
    }

    /// Filesystem type of the volume named by `path`, mounting it if needed.
    pub fn fs_type(&self, path: &str) -> FsResult<FatKind> {
        self.with_volume(path, false, |vol, _, _| Ok(vol.kind))
    }

    pub fn open(&self, path: &str, mode: OpenMode) -> FsResult<File> {
        let write = mode.bits() & !OpenMode::READ.bits() != 0;
        self.with_volume(path, write, |vol, rest, slot| {
            File::open(vol, Arc::clone(slot), &self.locks, rest, mode)
        })
    }

    pub fn opendir(&self, path: &str) -> FsResult<Dir> {
        self.with_volume(path, false, |vol, rest, slot| {
            Dir::open(vol, Arc::clone(slot), &self.locks, rest)
        })
    }

    /// Open `path` and return the first entry matching `pattern` (`?` and
    /// `*` wildcards); continue with [`Dir::find_next`].
    pub fn find_first(&self, path: &str, pattern: &str) -> FsResult<(Dir, Option<FileInfo>)> {
        let mut dir = self.opendir(path)?;
        dir.set_pattern(pattern);
        let first = dir.find_next()?;
        Ok((dir, first))
    }

    pub fn stat(&self, path: &str) -> FsResult<FileInfo> {
        self.with_volume(path, false, |vol, rest, _| vol.stat(rest))
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        self.with_volume(path, true, |vol, rest, _| vol.unlink(&self.locks, rest))
    }

    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        self.with_volume(path, true, |vol, rest, _| vol.mkdir(rest))
    }

    /// Rename or move within one volume. A volume prefix on `new` must name
    /// the same volume as `old`.
    pub fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let (new_vol, new_rest) = split_volume(new, &self.config.volume_strings)?;
        self.with_volume(old, true, |vol, rest, slot| {
            if new_vol.is_some_and(|v| v != slot.index) {
                return Err(FsError::InvalidDrive);
            }
            vol.rename(&self.locks, rest, new_rest)
        })
    }

    /// Set the attribute bits selected by `mask` to their values in `attr`.
    pub fn chmod(&self, path: &str, attr: u8, mask: u8) -> FsResult<()> {
        self.with_volume(path, true, |vol, rest, _| vol.chmod(rest, attr, mask))
    }

    /// Set the modification time from `info.date` and `info.time`.
    pub fn utime(&self, path: &str, info: &FileInfo) -> FsResult<()> {
        self.with_volume(path, true, |vol, rest, _| vol.utime(rest, info))
    }

    pub fn chdir(&self, path: &str) -> FsResult<()> {
        self.with_volume(path, false, |vol, rest, _| vol.chdir(rest))
    }

    /// Select the drive used by paths without a volume prefix.
    pub fn chdrive(&self, path: &str) -> FsResult<()> {
        let (vol, _) = split_volume(path, &self.config.volume_strings)?;
        let index = vol.ok_or(FsError::InvalidDrive)?;
        if index >= self.slots.len() {
            return Err(FsError::InvalidDrive);
        }
        self.current.store(index, Ordering::Relaxed);
        Ok(())
    }

    /// Current directory of the current drive, with its volume prefix.
    pub fn getcwd(&self) -> FsResult<String> {
        let index = self.current.load(Ordering::Relaxed);
        let prefix = match self.config.volume_strings.get(index) {
            Some(id) => format!("{}:", id.trim_end_matches(':')),
            None => format!("{index}:"),
        };
        self.with_volume("", false, |vol, _, _| Ok(format!("{prefix}{}", vol.cdir.path)))
    }

    pub fn getfree(&self, path: &str) -> FsResult<FreeSpace> {
        self.with_volume(path, false, |vol, _, _| {
            Ok(FreeSpace {
                free_clusters: vol.free_clusters()?,
                total_clusters: vol.n_fatent - 2,
                cluster_bytes: vol.cluster_bytes(),
            })
        })
    }

    /// Volume label and serial number.
    pub fn getlabel(&self, path: &str) -> FsResult<(String, u32)> {
        self.with_volume(path, false, |vol, _, _| vol.get_label())
    }

    /// Set the volume label; an empty label removes it. A volume prefix in
    /// `label` selects the volume.
    pub fn setlabel(&self, label: &str) -> FsResult<()> {
        self.with_volume(label, true, |vol, rest, _| vol.set_label(rest))
    }

    /// Flush every mounted volume.
    pub fn sync_all(&self) -> FsResult<()> {
        for slot in &self.slots {
            let mut state = slot.lock()?;
            if let Some(vol) = state.vol.as_mut() {
                vol.sync_fs()?;
            }
        }
        Ok(())
    }

    /// Create a filesystem on the volume named by `path`. The slot is
    /// unmounted first; it mounts the new filesystem on next access.
    pub fn mkfs(&self, path: &str, opts: &MkfsOptions) -> FsResult<FatKind> {
        let (slot, _) = self.resolve(path)?;
        let mut state = slot.lock()?;
        self.drop_volume(&mut state);
        let mapping = self.config.mapping(slot.index);
        let dev = self
            .drives()
            .get(&mapping.drive)
            .cloned()
            .ok_or(FsError::NotReady)?;
        mkfs::format(dev.as_ref(), mapping.partition, opts, &self.opts)
    }

    /// Write a new partition table on drive `pdrv`. Sizes are sector counts,
    /// or percentages of the drive when 100 or less.
    pub fn fdisk(&self, pdrv: u8, sizes: &[u64], style: PartitionStyle) -> FsResult<()> {
        let dev = self.drives().get(&pdrv).cloned().ok_or(FsError::NotReady)?;
        if dev.status().protected {
            return Err(FsError::WriteProtected);
        }
        self.invalidate_drive(pdrv)?;
        create_partitions(dev.as_ref(), sizes, FDISK_SYSTEM_ID, style)?;
        info!("drive {pdrv}: partitioned into {} parts", sizes.len());
        Ok(())
    }

    /// Drop the mounts of every volume living on drive `pdrv`.
    fn invalidate_drive(&self, pdrv: u8) -> FsResult<()> {
        for slot in &self.slots {
            if self.config.mapping(slot.index).drive != pdrv {
                continue;
            }
            let mut state = slot.lock()?;
            self.drop_volume(&mut state);
        }
        Ok(())
    }
}
