//! # REOS: a Rust Educational Operating System core.
//!
//! This crate implements the storage and memory-management core of a small
//! instructional operating system as a hosted library: a write-back block
//! cache over a raw sector device, a flat on-disk filesystem ("PIFS") with
//! hierarchical directories, a swap area kept in a regular file of that
//! filesystem, a virtual-memory manager that evicts to swap under pressure,
//! and shared memory-mapped files with an asynchronous write-back worker.
//!
//! The subsystems stack bottom-up:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ vm::Vm                                      │
//! │ - logical pages, fault service, eviction    │
//! │ - mmap regions + write-back worker          │
//! └───────────────┬─────────────────────────────┘
//!                 │
//! ┌───────────────▼─────────────────────────────┐
//! │ vm::swap::SwapArea                          │
//! │ - slot bitmap over a PIFS file              │
//! └───────────────┬─────────────────────────────┘
//!                 │
//! ┌───────────────▼─────────────────────────────┐
//! │ fs::Pifs                                    │
//! │ - directories, files, extents, free bitmap  │
//! └───────────────┬─────────────────────────────┘
//!                 │
//! ┌───────────────▼─────────────────────────────┐
//! │ cache::BlockCache                           │
//! │ - leased sector pages, LRU, write-back      │
//! └───────────────┬─────────────────────────────┘
//!                 │
//! ┌───────────────▼─────────────────────────────┐
//! │ dev::BlockDevice                            │
//! │ - synchronous 512-byte sector I/O           │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The preemptive scheduler, the raw device driver, and the system-call
//! surface of the surrounding operating system are external collaborators:
//! host threads drive this library, a [`dev::BlockDevice`] implementation
//! stands in for the driver, and the managed system's threads are identified
//! by [`vm::TaskId`] values supplied by the caller.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

pub mod bitset;
pub mod cache;
pub mod dev;
pub mod fs;
pub mod lru;
pub mod sync;
pub mod vm;

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by the core subsystems.
/// Each variant corresponds to a specific type of error that might occur
/// while servicing an operation. These errors can be returned to the
/// surrounding operating system to indicate the nature of the failure.
#[derive(Debug, Eq, PartialEq)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Not a directory. (ENOTDIR)
    NotDirectory,
    /// Is a directory. (EISDIR)
    IsDirectory,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Directory not empty. (ENOTEMPTY)
    DirectoryNotEmpty,
    /// File system is corrupted. (EFSCORRUPTED)
    FilesystemCorrupted(&'static str),
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `isize` error
    /// code, for use as a return value in the syscall layer of the
    /// surrounding operating system.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoMemory => -12,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::NotDirectory => -20,
            KernelError::IsDirectory => -21,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::NameTooLong => -36,
            KernelError::DirectoryNotEmpty => -39,
            KernelError::FilesystemCorrupted(_) => -117,
            KernelError::NotSupportedOperation => -524,
        }
    }
}

/// The given `isize` does not indicate a [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -12 => Ok(Self::NoMemory),
            -14 => Ok(Self::BadAddress),
            -16 => Ok(Self::Busy),
            -17 => Ok(Self::FileExist),
            -20 => Ok(Self::NotDirectory),
            -21 => Ok(Self::IsDirectory),
            -22 => Ok(Self::InvalidArgument),
            -28 => Ok(Self::NoSpace),
            -36 => Ok(Self::NameTooLong),
            -39 => Ok(Self::DirectoryNotEmpty),
            -117 => Ok(Self::FilesystemCorrupted("")),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}

/// Size of a host-memory page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        assert_eq!(KernelError::NoSuchEntry.into_isize(), -2);
        assert_eq!(KernelError::try_from(-2), Ok(KernelError::NoSuchEntry));
        assert_eq!(KernelError::NoMemory.into_isize(), -12);
        assert_eq!(KernelError::try_from(-12), Ok(KernelError::NoMemory));
        assert_eq!(KernelError::DirectoryNotEmpty.into_isize(), -39);
        assert_eq!(
            KernelError::try_from(-39),
            Ok(KernelError::DirectoryNotEmpty)
        );
        assert!(KernelError::try_from(0).is_err());
        assert!(KernelError::try_from(-1000).is_err());
    }
}
