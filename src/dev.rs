//! Sector device abstraction.
//!
//! The block device is the lowest layer of the storage stack: a synchronous
//! array of fixed-size 512-byte sectors. The raw driver belongs to the
//! surrounding operating system; this module only defines the contract the
//! cache consumes ([`BlockDevice`]) and an in-memory implementation
//! ([`MemDisk`]) used for hosting and testing.

use crate::KernelError;
use std::sync::Mutex;

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector, the access granularity of the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Sector(pub u32);

impl Sector {
    /// Get the byte offset represented by the sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 as usize * SECTOR_SIZE
    }

    /// Cast into u32.
    #[inline]
    pub fn into_u32(self) -> u32 {
        self.0
    }
}

impl core::ops::Add<u32> for Sector {
    type Output = Self;

    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

/// A device that stores an array of 512-byte sectors.
///
/// Reads and writes are synchronous: when a call returns, the transfer has
/// completed. Sector 0 holds the filesystem header.
pub trait BlockDevice
where
    Self: Send + Sync,
{
    /// Number of sectors the device holds.
    fn sector_count(&self) -> u32;

    /// Read 512 bytes from the device starting at `sector`.
    fn read_sector(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError>;

    /// Write 512 bytes to the device starting at `sector`.
    fn write_sector(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError>;
}

/// An in-memory sector device.
///
/// Stands in for the raw driver when the core runs hosted. All sectors start
/// zeroed, like a freshly created disk image.
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    /// Create a device of `sector_count` zeroed sectors.
    pub fn new(sector_count: u32) -> Self {
        log::info!("memdisk: {} sectors ({} bytes)", sector_count, sector_count as usize * SECTOR_SIZE);
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sector_count as usize]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }

    fn read_sector(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let sectors = self.sectors.lock().unwrap();
        let src = sectors
            .get(sector.into_u32() as usize)
            .ok_or(KernelError::IOError)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_sector(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut sectors = self.sectors.lock().unwrap();
        let dst = sectors
            .get_mut(sector.into_u32() as usize)
            .ok_or(KernelError::IOError)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_round_trip() {
        let disk = MemDisk::new(8);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xaa;
        buf[SECTOR_SIZE - 1] = 0x55;
        disk.write_sector(Sector(3), &buf).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        disk.read_sector(Sector(3), &mut out).unwrap();
        assert_eq!(buf, out);

        // Untouched sectors read back zeroed.
        disk.read_sector(Sector(2), &mut out).unwrap();
        assert_eq!(out, [0u8; SECTOR_SIZE]);
    }

    #[test]
    fn out_of_range_is_io_error() {
        let disk = MemDisk::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            disk.read_sector(Sector(4), &mut buf),
            Err(KernelError::IOError)
        );
        assert_eq!(
            disk.write_sector(Sector(100), &buf),
            Err(KernelError::IOError)
        );
    }
}
