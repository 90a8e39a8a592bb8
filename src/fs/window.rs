//! The single-sector cache every table and directory access goes through.

use log::trace;

use crate::device::BlockDevice;
use crate::error::{FsError, FsResult};

/// Location of the primary allocation table, used to mirror writes into
/// the second copy when a volume carries two.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FatMirror {
    pub fat_base: u64,
    pub fat_size: u64,
    pub n_fats: u8,
}

impl FatMirror {
    fn secondary_of(&self, sector: u64) -> Option<u64> {
        if self.n_fats == 2 && sector >= self.fat_base && sector - self.fat_base < self.fat_size {
            Some(sector + self.fat_size)
        } else {
            None
        }
    }
}

pub(crate) struct SectorWindow {
    pub buf: Vec<u8>,
    /// Sector currently held, `None` when the buffer is invalid.
    pub sector: Option<u64>,
    pub dirty: bool,
}

impl SectorWindow {
    pub fn new(sector_size: usize) -> Self {
        Self {
            buf: vec![0u8; sector_size],
            sector: None,
            dirty: false,
        }
    }

    /// Write the buffer back if it has been modified.
    pub fn flush(&mut self, dev: &dyn BlockDevice, mirror: FatMirror) -> FsResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(sector) = self.sector else {
            self.dirty = false;
            return Ok(());
        };
        dev.write(&self.buf, sector, 1).map_err(FsError::from)?;
        self.dirty = false;
        if let Some(copy) = mirror.secondary_of(sector) {
            trace!("mirroring FAT sector {sector} to {copy}");
            dev.write(&self.buf, copy, 1).map_err(FsError::from)?;
        }
        Ok(())
    }

    /// Make `sector` resident, flushing the previous one first.
    pub fn load(&mut self, dev: &dyn BlockDevice, sector: u64, mirror: FatMirror) -> FsResult<()> {
        if self.sector == Some(sector) {
            return Ok(());
        }
        self.flush(dev, mirror)?;
        trace!("window -> sector {sector}");
        if let Err(e) = dev.read(&mut self.buf, sector, 1) {
            self.sector = None;
            return Err(e.into());
        }
        self.sector = Some(sector);
        Ok(())
    }

    /// Forget the resident sector without writing it.
    pub fn invalidate(&mut self) {
        self.sector = None;
        self.dirty = false;
    }

    /// Replace the contents with zeros and declare them to be `sector`,
    /// without reading the device.
    pub fn assume_zeroed(&mut self, sector: u64) {
        self.buf.fill(0);
        self.sector = Some(sector);
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;

    #[test]
    fn test_flush_mirrors_fat_sector() {
        let disk = RamDisk::new(32, 512);
        let mirror = FatMirror {
            fat_base: 1,
            fat_size: 4,
            n_fats: 2,
        };
        let mut win = SectorWindow::new(512);
        win.load(&disk, 2, mirror).unwrap();
        win.buf[0] = 0x5A;
        win.dirty = true;
        win.load(&disk, 20, mirror).unwrap();

        let mut buf = [0u8; 512];
        disk.read(&mut buf, 2, 1).unwrap();
        assert_eq!(buf[0], 0x5A);
        disk.read(&mut buf, 6, 1).unwrap();
        assert_eq!(buf[0], 0x5A);
    }

    #[test]
    fn test_flush_outside_fat_not_mirrored() {
        let disk = RamDisk::new(32, 512);
        let mirror = FatMirror {
            fat_base: 1,
            fat_size: 4,
            n_fats: 2,
        };
        let mut win = SectorWindow::new(512);
        win.load(&disk, 10, mirror).unwrap();
        win.buf[0] = 0x11;
        win.dirty = true;
        win.flush(&disk, mirror).unwrap();

        let mut buf = [0u8; 512];
        disk.read(&mut buf, 14, 1).unwrap();
        assert_eq!(buf[0], 0);
        assert!(!win.dirty);
    }
}
