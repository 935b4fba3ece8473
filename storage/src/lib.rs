//! Storage types.
//!
//! The bootloader only ever talks to flash through these traits.  A flash
//! "area" is one partition of a device: an image slot, or the scratch area.
//! Offsets passed to `read`, `write` and `erase` are relative to the
//! beginning of the area.  `device_offset` gives the position of the area on
//! the underlying device, and sector descriptors are reported in device
//! terms, so callers that want area-relative sector offsets have to subtract
//! the offset of the first sector themselves.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("access is not aligned to the device granularity")]
    NotAligned,
    #[error("access is beyond the end of the area")]
    OutOfBounds,
    #[error("write to a location that has not been erased")]
    NotErased,
    /// The device lost power before the operation took effect.  Only
    /// produced by simulated devices.
    #[error("power lost during flash operation")]
    PowerLoss,
}

pub type Result<T> = core::result::Result<T, Error>;

/// A single erase unit of a flash area.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Sector {
    /// Offset of the sector from the start of the device.
    pub offset: usize,
    /// Size of the sector in bytes.
    pub size: usize,
}

/// Read only interface into flash.
pub trait ReadFlash {
    /// What is the read size (alignment and size multiple).
    fn read_size(&self) -> usize;
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()>;
    fn capacity(&self) -> usize;
}

/// Flash that can be written to.
pub trait Flash: ReadFlash {
    /// Write size (alignment and size multiple).
    fn write_size(&self) -> usize;
    /// Erase size.  For devices with sectors of differing sizes this is the
    /// largest of them.
    fn erase_size(&self) -> usize;

    fn erase(&mut self, from: usize, to: usize) -> Result<()>;
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Does this device need an erase before data can be programmed?  Devices
    /// that can be overwritten directly (MRAM, RRAM, some external parts)
    /// return false here.
    fn erase_required(&self) -> bool {
        true
    }

    /// The value every byte reads back as after an erase.
    fn erased_val(&self) -> u8 {
        0xff
    }

    /// Offset of this area from the start of the device.
    fn device_offset(&self) -> usize {
        0
    }

    /// Number of sectors making up this area.
    fn sector_count(&self) -> usize {
        self.capacity() / self.erase_size()
    }

    /// Describe a single sector.  The default assumes uniform sectors of
    /// `erase_size`.
    fn sector(&self, index: usize) -> Option<Sector> {
        if index >= self.sector_count() {
            return None;
        }
        let size = self.erase_size();
        Some(Sector {
            offset: self.device_offset() + index * size,
            size,
        })
    }
}

/// Anything readable that happens to be plain memory.  Used for images that
/// have been loaded into RAM.
impl ReadFlash for &[u8] {
    fn read_size(&self) -> usize {
        1
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()> {
        check_read(&*self, offset, bytes.len())?;
        bytes.copy_from_slice(&self[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.len()
    }
}

// Utilities taken from embedded-storage for validating arguments.
pub fn check_read<T: ReadFlash>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_slice(flash, flash.read_size(), offset, length)
}

/// Validate an erase range.  Both ends must fall on sector boundaries, which
/// for non-uniform devices means walking the sector list.
pub fn check_erase<T: Flash>(
    flash: &T,
    from: usize,
    to: usize,
) -> Result<()> {
    if from > to || to > flash.capacity() {
        return Err(Error::OutOfBounds);
    }
    let base = flash.device_offset();
    let mut from_ok = from == 0;
    let mut to_ok = to == 0;
    let mut index = 0;
    while let Some(sector) = flash.sector(index) {
        let end = sector.offset - base + sector.size;
        from_ok |= end == from;
        to_ok |= end == to;
        index += 1;
    }
    if !from_ok || !to_ok {
        return Err(Error::NotAligned);
    }
    Ok(())
}

pub fn check_write<T: Flash>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_slice(flash, flash.write_size(), offset, length)
}

pub fn check_slice<T: ReadFlash>(
    flash: &T,
    align: usize,
    offset: usize,
    length: usize,
) -> Result<()> {
    if length > flash.capacity() || offset > flash.capacity() - length {
        return Err(Error::OutOfBounds);
    }
    if offset % align != 0 || length % align != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}
