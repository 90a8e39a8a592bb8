use chrono::NaiveDate;
use serde::Serialize;

use super::layout::{AM_ARC, AM_DIR, AM_HID, AM_RDO, AM_SYS};

/// Status of a file or directory as reported by `stat` and `readdir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub size: u64,
    /// Packed FAT date: year since 1980 (7 bits), month, day.
    pub date: u16,
    /// Packed FAT time: hour, minute, second / 2.
    pub time: u16,
    pub attr: u8,
    /// Long name, or the short name with case flags applied.
    pub name: String,
    /// Short name when it differs from `name`, empty on exFAT.
    pub alt_name: String,
}

impl FileInfo {
    pub fn is_directory(&self) -> bool {
        self.attr & AM_DIR != 0
    }

    pub fn is_file(&self) -> bool {
        !self.is_directory()
    }

    pub fn is_read_only(&self) -> bool {
        self.attr & AM_RDO != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.attr & AM_HID != 0
    }

    pub fn is_system(&self) -> bool {
        self.attr & AM_SYS != 0
    }

    pub fn is_archive(&self) -> bool {
        self.attr & AM_ARC != 0
    }

    /// Modification time, `None` when the stored fields are out of range.
    pub fn modified(&self) -> Option<chrono::NaiveDateTime> {
        let date = NaiveDate::from_ymd_opt(
            1980 + (self.date >> 9) as i32,
            (self.date >> 5 & 0xF) as u32,
            (self.date & 0x1F) as u32,
        )?;
        date.and_hms_opt(
            (self.time >> 11) as u32,
            (self.time >> 5 & 0x3F) as u32,
            (self.time & 0x1F) as u32 * 2,
        )
    }

    pub fn size_string(&self) -> String {
        if self.is_directory() {
            return String::new();
        }
        crate::partition::format_size(self.size)
    }
}
