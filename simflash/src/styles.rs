//! Flash styles
//!
//! Various microcontrollers have various types of flash memories available to them.

use storage::Result;

use crate::{PowerRail, SimFlash};

/// How an area is divided into sectors.
pub enum Sectors {
    Uniform { size: usize, count: usize },
    Mixed(&'static [usize]),
}

/// The configuration of a single flash area.
pub struct AreaLayout {
    pub read_size: usize,
    pub write_size: usize,
    pub sectors: Sectors,
    /// False for devices that can be overwritten in place.
    pub erase_required: bool,
}

impl AreaLayout {
    pub fn build(&self) -> Result<SimFlash> {
        let flash = match self.sectors {
            Sectors::Uniform { size, count } => {
                SimFlash::new(self.read_size, self.write_size, size, count)?
            }
            Sectors::Mixed(sizes) => {
                SimFlash::with_sectors(self.read_size, self.write_size, sizes)?
            }
        };
        if self.erase_required {
            Ok(flash)
        } else {
            Ok(flash.without_erase())
        }
    }

    pub fn capacity(&self) -> usize {
        match self.sectors {
            Sectors::Uniform { size, count } => size * count,
            Sectors::Mixed(sizes) => sizes.iter().sum(),
        }
    }
}

/// The areas used for one image, with an optional scratch area.
pub struct DeviceLayout {
    pub name: &'static str,
    pub primary: &'static AreaLayout,
    pub secondary: &'static AreaLayout,
    pub scratch: Option<&'static AreaLayout>,
}

/// A built device.  All of the areas are on one power rail, and placed one
/// after another on the device.
pub struct Device {
    pub rail: PowerRail,
    pub primary: SimFlash,
    pub secondary: SimFlash,
    pub scratch: Option<SimFlash>,
}

impl DeviceLayout {
    pub fn build(&self) -> Result<Device> {
        let rail = PowerRail::new();
        let mut base = 0;
        let primary = self.primary.build()?.on_rail(&rail).at(base);
        base += self.primary.capacity();
        let secondary = self.secondary.build()?.on_rail(&rail).at(base);
        base += self.secondary.capacity();
        let scratch = match self.scratch {
            Some(layout) => Some(layout.build()?.on_rail(&rail).at(base)),
            None => None,
        };
        Ok(Device { rail, primary, secondary, scratch })
    }
}

/// K64-style.
/// These devices have small uniform sectors.
pub static K64_SLOT: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 8,
    sectors: Sectors::Uniform { size: 4 * 1024, count: 128 / 4 + 1 },
    erase_required: true,
};
pub static K64_SCRATCH: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 8,
    sectors: Sectors::Uniform { size: 4 * 1024, count: 1 },
    erase_required: true,
};

/// A large write, based on the STM32H745.  Few, very large sectors.  The
/// image and the trailer share the first sector.
pub static STM32H_SLOT: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 32,
    sectors: Sectors::Uniform { size: 128 * 1024, count: 4 },
    erase_required: true,
};
pub static STM32H_SCRATCH: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 32,
    sectors: Sectors::Uniform { size: 128 * 1024, count: 1 },
    erase_required: true,
};

/// Differently sized sectors within a slot, in the manner of the STM32F4
/// parts, scaled down.
pub static MIXED_SLOT: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 8,
    sectors: Sectors::Mixed(&[4096, 4096, 2048, 4096]),
    erase_required: true,
};

/// MRAM-like part.  No erase, small write unit.
pub static MRAM_SLOT: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 4,
    sectors: Sectors::Uniform { size: 1024, count: 24 },
    erase_required: false,
};
pub static MRAM_SCRATCH: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 4,
    sectors: Sectors::Uniform { size: 1024, count: 2 },
    erase_required: false,
};

pub static K64: DeviceLayout = DeviceLayout {
    name: "k64",
    primary: &K64_SLOT,
    secondary: &K64_SLOT,
    scratch: Some(&K64_SCRATCH),
};

pub static STM32H: DeviceLayout = DeviceLayout {
    name: "stm32h",
    primary: &STM32H_SLOT,
    secondary: &STM32H_SLOT,
    scratch: Some(&STM32H_SCRATCH),
};

pub static MIXED: DeviceLayout = DeviceLayout {
    name: "mixed",
    primary: &MIXED_SLOT,
    secondary: &MIXED_SLOT,
    scratch: Some(&K64_SCRATCH),
};

pub static MRAM: DeviceLayout = DeviceLayout {
    name: "mram",
    primary: &MRAM_SLOT,
    secondary: &MRAM_SLOT,
    scratch: Some(&MRAM_SCRATCH),
};

/// All of the devices.
pub static ALL_DEVICES: [&DeviceLayout; 4] = [&K64, &STM32H, &MIXED, &MRAM];

/// Devices with uniform sectors, usable by every strategy.
pub static UNIFORM_DEVICES: [&DeviceLayout; 3] = [&K64, &STM32H, &MRAM];

/// An iterator that returns each of the devices, built.
pub fn all_devices() -> impl Iterator<Item = (&'static str, Result<Device>)> {
    ALL_DEVICES.iter().map(|d| (d.name, d.build()))
}
