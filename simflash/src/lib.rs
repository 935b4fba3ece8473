//! Simulated flash
//!
//! The NOR-type flashes used in microcontrollers differ quite a bit in terms
//! of capabilities provided.  This simulator attempts to capture the diversity
//! of these devices, at least the parts the bootloader cares about:
//!
//! - Sectors need not be uniform.  Some parts (STM32F4 and friends) have a
//!   few small sectors followed by much larger ones.
//! - Most devices need an erase before a location can be programmed again,
//!   and each write unit can only be programmed once between erases.  Others
//!   (MRAM, RRAM, some external parts) can be overwritten directly.  Both
//!   styles are simulated.
//! - Power can be lost at any moment.  All areas built against the same
//!   [`PowerRail`] share a budget of mutating operations; once it runs out
//!   every further operation fails with `PowerLoss`, exactly as if the device
//!   had reset.  Restoring the rail is the next boot.
//!
//! Operations either happen entirely or not at all.  The bootloader writes
//! its progress markers in single write units, which real devices program
//! atomically.

use std::{cell::Cell, rc::Rc};

use storage::{Error, Flash, ReadFlash, Result, Sector};

pub mod gen;
pub mod styles;

#[derive(Debug, Default)]
struct RailState {
    /// Remaining mutating operations before power is cut.  None is unlimited.
    budget: Cell<Option<usize>>,
    tripped: Cell<bool>,
    writes: Cell<usize>,
    erases: Cell<usize>,
}

/// Power supply shared by the areas of one simulated device.
#[derive(Debug, Clone, Default)]
pub struct PowerRail(Rc<RailState>);

impl PowerRail {
    pub fn new() -> PowerRail {
        PowerRail::default()
    }

    /// Allow `ops` more writes or erases, then cut power.
    pub fn cut_after(&self, ops: usize) {
        self.0.budget.set(Some(ops));
        self.0.tripped.set(false);
    }

    /// Power back on, with no limit.
    pub fn restore(&self) {
        self.0.budget.set(None);
        self.0.tripped.set(false);
    }

    /// Did the last budget run out?
    pub fn tripped(&self) -> bool {
        self.0.tripped.get()
    }

    pub fn writes(&self) -> usize {
        self.0.writes.get()
    }

    pub fn erases(&self) -> usize {
        self.0.erases.get()
    }

    /// Total mutating operations performed since creation.
    pub fn ops(&self) -> usize {
        self.writes() + self.erases()
    }

    /// Account for one mutating operation, failing if power is gone.
    fn spend(&self) -> Result<()> {
        if self.0.tripped.get() {
            return Err(Error::PowerLoss);
        }
        match self.0.budget.get() {
            Some(0) => {
                self.0.tripped.set(true);
                Err(Error::PowerLoss)
            }
            Some(n) => {
                self.0.budget.set(Some(n - 1));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn check_reads(&self) -> Result<()> {
        if self.0.tripped.get() {
            Err(Error::PowerLoss)
        } else {
            Ok(())
        }
    }
}

/// One simulated flash area.
pub struct SimFlash {
    read_size: usize,
    write_size: usize,
    /// Size of each sector, in order.
    sectors: Vec<usize>,
    /// Offset of this area on the simulated device.
    base: usize,
    erase_required: bool,
    erased_val: u8,
    data: Vec<u8>,
    /// Per write unit, has it been programmed since the last erase.
    programmed: Vec<bool>,
    rail: PowerRail,
}

impl SimFlash {
    /// Build a flash area with uniform sectors.
    pub fn new(
        read_size: usize,
        write_size: usize,
        erase_size: usize,
        sectors: usize,
    ) -> Result<SimFlash> {
        SimFlash::with_sectors(read_size, write_size, &vec![erase_size; sectors])
    }

    /// Build a flash area with the given sector sizes.
    pub fn with_sectors(
        read_size: usize,
        write_size: usize,
        sectors: &[usize],
    ) -> Result<SimFlash> {
        if !read_size.is_power_of_two() || !write_size.is_power_of_two() || sectors.is_empty() {
            return Err(Error::NotAligned);
        }
        if sectors.iter().any(|s| *s == 0 || s % write_size != 0) {
            return Err(Error::NotAligned);
        }
        let capacity: usize = sectors.iter().sum();
        Ok(SimFlash {
            read_size,
            write_size,
            sectors: sectors.to_vec(),
            base: 0,
            erase_required: true,
            erased_val: 0xff,
            data: vec![0xff; capacity],
            programmed: vec![false; capacity / write_size],
            rail: PowerRail::new(),
        })
    }

    /// Attach this area to a shared power rail.
    pub fn on_rail(mut self, rail: &PowerRail) -> SimFlash {
        self.rail = rail.clone();
        self
    }

    /// Place this area at an offset on the device.
    pub fn at(mut self, base: usize) -> SimFlash {
        self.base = base;
        self
    }

    /// Make this a device that can be overwritten without erasing.
    pub fn without_erase(mut self) -> SimFlash {
        self.erase_required = false;
        self
    }

    pub fn rail(&self) -> &PowerRail {
        &self.rail
    }

    /// Install data directly, bypassing the power rail and programming
    /// checks.  This is how the test harness puts images into place.
    pub fn install(&mut self, bytes: &[u8], offset: usize) -> Result<()> {
        if offset > self.data.len() || bytes.len() > self.data.len() - offset {
            return Err(Error::OutOfBounds);
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        let first = offset / self.write_size;
        let last = (offset + bytes.len()).div_ceil(self.write_size);
        for unit in &mut self.programmed[first..last] {
            *unit = true;
        }
        Ok(())
    }

    /// The raw contents of this area.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Offset of a sector, relative to the area.
    fn sector_start(&self, index: usize) -> usize {
        self.sectors[..index].iter().sum()
    }
}

impl ReadFlash for SimFlash {
    fn read_size(&self) -> usize {
        self.read_size
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()> {
        self.rail.check_reads()?;
        storage::check_read(self, offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Flash for SimFlash {
    fn write_size(&self) -> usize {
        self.write_size
    }

    fn erase_size(&self) -> usize {
        self.sectors.iter().copied().max().unwrap_or(0)
    }

    fn erase(&mut self, from: usize, to: usize) -> Result<()> {
        storage::check_erase(self, from, to)?;
        self.rail.spend()?;
        self.rail.0.erases.set(self.rail.0.erases.get() + 1);
        self.data[from..to].fill(self.erased_val);
        for unit in &mut self.programmed[from / self.write_size..to / self.write_size] {
            *unit = false;
        }
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        storage::check_write(self, offset, bytes.len())?;
        let first = offset / self.write_size;
        let last = (offset + bytes.len()) / self.write_size;
        if self.erase_required && self.programmed[first..last].iter().any(|p| *p) {
            return Err(Error::NotErased);
        }
        self.rail.spend()?;
        self.rail.0.writes.set(self.rail.0.writes.get() + 1);
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        for unit in &mut self.programmed[first..last] {
            *unit = true;
        }
        Ok(())
    }

    fn erase_required(&self) -> bool {
        self.erase_required
    }

    fn erased_val(&self) -> u8 {
        self.erased_val
    }

    fn device_offset(&self) -> usize {
        self.base
    }

    fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    fn sector(&self, index: usize) -> Option<Sector> {
        let size = *self.sectors.get(index)?;
        Some(Sector {
            offset: self.base + self.sector_start(index),
            size,
        })
    }
}
