use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::error::DiskError;

/// Drive status bits reported by [`BlockDevice::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskStatus {
    /// Drive has not been initialized.
    pub no_init: bool,
    /// No medium in the drive.
    pub no_disk: bool,
    /// Medium is write protected.
    pub protected: bool,
}

impl DiskStatus {
    pub const READY: DiskStatus = DiskStatus {
        no_init: false,
        no_disk: false,
        protected: false,
    };
}

/// Control requests understood by a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlRequest {
    /// Flush any write-back cache.
    Sync,
    GetSectorCount,
    GetSectorSize,
    /// Erase block size in units of sectors.
    GetBlockSize,
    /// Hint that sectors `start..=end` no longer hold data.
    Trim { start: u64, end: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    Value(u64),
}

impl IoctlReply {
    pub fn value(self) -> Option<u64> {
        match self {
            IoctlReply::Value(v) => Some(v),
            IoctlReply::Done => None,
        }
    }
}

/// Sector-addressed storage the filesystem engine runs on.
///
/// Implementations use interior mutability so a device can be shared by
/// several logical volumes (partitions) on the same physical drive.
pub trait BlockDevice: Send + Sync {
    fn status(&self) -> DiskStatus;

    fn initialize(&self) -> DiskStatus;

    /// Read `count` sectors starting at `sector` into `buf`.
    fn read(&self, buf: &mut [u8], sector: u64, count: u32) -> Result<(), DiskError>;

    /// Write `count` sectors starting at `sector` from `buf`.
    fn write(&self, buf: &[u8], sector: u64, count: u32) -> Result<(), DiskError>;

    fn ioctl(&self, request: IoctlRequest) -> Result<IoctlReply, DiskError>;
}

/// A block device backed by a heap buffer.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    sector_size: u32,
    write_protected: bool,
}

impl RamDisk {
    pub fn new(sector_count: u64, sector_size: u32) -> Self {
        Self {
            data: Mutex::new(vec![0u8; (sector_count * sector_size as u64) as usize]),
            sector_size,
            write_protected: false,
        }
    }

    /// Wrap an existing image. Trailing bytes beyond a whole sector are ignored.
    pub fn from_image(image: Vec<u8>, sector_size: u32) -> Self {
        Self {
            data: Mutex::new(image),
            sector_size,
            write_protected: false,
        }
    }

    pub fn write_protect(mut self, on: bool) -> Self {
        self.write_protected = on;
        self
    }

    /// Copy of the current image contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn sector_count(&self) -> u64 {
        let len = self.data.lock().map(|d| d.len()).unwrap_or(0) as u64;
        len / self.sector_size as u64
    }

    fn range(&self, sector: u64, count: u32, len: usize) -> Result<(usize, usize), DiskError> {
        let ss = self.sector_size as usize;
        let bytes = count as usize * ss;
        if len < bytes || sector + count as u64 > self.sector_count() {
            return Err(DiskError::Parameter);
        }
        let start = sector as usize * ss;
        Ok((start, start + bytes))
    }
}

impl BlockDevice for RamDisk {
    fn status(&self) -> DiskStatus {
        DiskStatus {
            protected: self.write_protected,
            ..DiskStatus::READY
        }
    }

    fn initialize(&self) -> DiskStatus {
        self.status()
    }

    fn read(&self, buf: &mut [u8], sector: u64, count: u32) -> Result<(), DiskError> {
        let (start, end) = self.range(sector, count, buf.len())?;
        let data = self.data.lock().map_err(|_| DiskError::Error)?;
        buf[..end - start].copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, buf: &[u8], sector: u64, count: u32) -> Result<(), DiskError> {
        if self.write_protected {
            return Err(DiskError::WriteProtected);
        }
        let (start, end) = self.range(sector, count, buf.len())?;
        let mut data = self.data.lock().map_err(|_| DiskError::Error)?;
        data[start..end].copy_from_slice(&buf[..end - start]);
        Ok(())
    }

    fn ioctl(&self, request: IoctlRequest) -> Result<IoctlReply, DiskError> {
        match request {
            IoctlRequest::Sync => Ok(IoctlReply::Done),
            IoctlRequest::GetSectorCount => Ok(IoctlReply::Value(self.sector_count())),
            IoctlRequest::GetSectorSize => Ok(IoctlReply::Value(self.sector_size as u64)),
            IoctlRequest::GetBlockSize => Ok(IoctlReply::Value(1)),
            IoctlRequest::Trim { start, end } => {
                if end < start || end >= self.sector_count() {
                    return Err(DiskError::Parameter);
                }
                Ok(IoctlReply::Done)
            }
        }
    }
}

/// A block device backed by a disk image file on the host.
pub struct ImageFile {
    file: Mutex<File>,
    sector_size: u32,
    sector_count: u64,
    read_only: bool,
}

impl ImageFile {
    /// Open an existing image read/write.
    pub fn open(path: &Path, sector_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?;
        Self::from_file(file, sector_size, false)
    }

    /// Open an existing image without write access.
    pub fn open_read_only(path: &Path, sector_size: u32) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?;
        Self::from_file(file, sector_size, true)
    }

    /// Create (or truncate) an image of `sector_count` zeroed sectors.
    pub fn create(path: &Path, sector_count: u64, sector_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to create image {}", path.display()))?;
        file.set_len(sector_count * sector_size as u64)
            .with_context(|| format!("failed to size image {}", path.display()))?;
        Self::from_file(file, sector_size, false)
    }

    fn from_file(file: File, sector_size: u32, read_only: bool) -> Result<Self> {
        let len = file.metadata().context("failed to stat image")?.len();
        Ok(Self {
            file: Mutex::new(file),
            sector_size,
            sector_count: len / sector_size as u64,
            read_only,
        })
    }
}

impl BlockDevice for ImageFile {
    fn status(&self) -> DiskStatus {
        DiskStatus {
            protected: self.read_only,
            ..DiskStatus::READY
        }
    }

    fn initialize(&self) -> DiskStatus {
        self.status()
    }

    fn read(&self, buf: &mut [u8], sector: u64, count: u32) -> Result<(), DiskError> {
        let bytes = count as usize * self.sector_size as usize;
        if buf.len() < bytes || sector + count as u64 > self.sector_count {
            return Err(DiskError::Parameter);
        }
        let mut file = self.file.lock().map_err(|_| DiskError::Error)?;
        file.seek(SeekFrom::Start(sector * self.sector_size as u64))
            .map_err(|_| DiskError::Error)?;
        file.read_exact(&mut buf[..bytes])
            .map_err(|_| DiskError::Error)
    }

    fn write(&self, buf: &[u8], sector: u64, count: u32) -> Result<(), DiskError> {
        if self.read_only {
            return Err(DiskError::WriteProtected);
        }
        let bytes = count as usize * self.sector_size as usize;
        if buf.len() < bytes || sector + count as u64 > self.sector_count {
            return Err(DiskError::Parameter);
        }
        let mut file = self.file.lock().map_err(|_| DiskError::Error)?;
        file.seek(SeekFrom::Start(sector * self.sector_size as u64))
            .map_err(|_| DiskError::Error)?;
        file.write_all(&buf[..bytes]).map_err(|_| DiskError::Error)
    }

    fn ioctl(&self, request: IoctlRequest) -> Result<IoctlReply, DiskError> {
        match request {
            IoctlRequest::Sync => {
                let file = self.file.lock().map_err(|_| DiskError::Error)?;
                file.sync_data().map_err(|_| DiskError::Error)?;
                Ok(IoctlReply::Done)
            }
            IoctlRequest::GetSectorCount => Ok(IoctlReply::Value(self.sector_count)),
            IoctlRequest::GetSectorSize => Ok(IoctlReply::Value(self.sector_size as u64)),
            IoctlRequest::GetBlockSize => Ok(IoctlReply::Value(1)),
            IoctlRequest::Trim { .. } => Ok(IoctlReply::Done),
        }
    }
}
