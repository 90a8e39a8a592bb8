use thiserror::Error;

/// Result code returned from every public entry point.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("a hard error occurred in the low level disk I/O layer")]
    DiskErr,

    #[error("internal consistency check failed")]
    IntErr,

    #[error("the physical drive cannot work")]
    NotReady,

    #[error("could not find the file")]
    NoFile,

    #[error("could not find the path")]
    NoPath,

    #[error("the path name format is invalid")]
    InvalidName,

    #[error("access denied due to prohibited access or directory full")]
    Denied,

    #[error("the object already exists")]
    Exist,

    #[error("the file or directory object is invalid")]
    InvalidObject,

    #[error("the physical drive is write protected")]
    WriteProtected,

    #[error("the logical drive number is invalid")]
    InvalidDrive,

    #[error("the volume is not mounted")]
    NotEnabled,

    #[error("there is no valid FAT volume")]
    NoFilesystem,

    #[error("format aborted: {0}")]
    MkfsAborted(&'static str),

    #[error("could not get a grant to access the volume within the timeout")]
    Timeout,

    #[error("the operation is rejected according to the file sharing policy")]
    Locked,

    #[error("working buffer could not be allocated")]
    NotEnoughCore,

    #[error("too many open objects")]
    TooManyOpenFiles,

    #[error("given parameter is invalid")]
    InvalidParameter,
}

pub type FsResult<T> = Result<T, FsError>;

/// Failure reported by a block device.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    #[error("unrecoverable device error")]
    Error,

    #[error("medium is write protected")]
    WriteProtected,

    #[error("device not ready")]
    NotReady,

    #[error("invalid parameter")]
    Parameter,
}

/// Any failed transfer is a hard disk error. `NotReady` and `WriteProtected`
/// results come from the drive status checks, never from here.
impl From<DiskError> for FsError {
    fn from(_: DiskError) -> Self {
        FsError::DiskErr
    }
}

impl From<FsError> for std::io::Error {
    fn from(e: FsError) -> Self {
        use std::io::ErrorKind;
        let kind = match e {
            FsError::NoFile | FsError::NoPath => ErrorKind::NotFound,
            FsError::Exist => ErrorKind::AlreadyExists,
            FsError::Denied | FsError::WriteProtected | FsError::Locked => {
                ErrorKind::PermissionDenied
            }
            FsError::InvalidName | FsError::InvalidParameter => ErrorKind::InvalidInput,
            FsError::Timeout => ErrorKind::TimedOut,
            FsError::NotEnoughCore => ErrorKind::OutOfMemory,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_error_mapping() {
        assert_eq!(FsError::from(DiskError::Error), FsError::DiskErr);
        assert_eq!(FsError::from(DiskError::Parameter), FsError::DiskErr);
        assert_eq!(FsError::from(DiskError::NotReady), FsError::DiskErr);
        assert_eq!(FsError::from(DiskError::WriteProtected), FsError::DiskErr);
    }

    #[test]
    fn test_io_error_kind() {
        let e: std::io::Error = FsError::NoFile.into();
        assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
        let e: std::io::Error = FsError::Locked.into();
        assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied);
    }
}
