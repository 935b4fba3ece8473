//! Sector layout
//!
//! Flash drivers report sectors in device terms.  The swap code reasons in
//! offsets relative to the start of a slot, so the tables here are built
//! relative to the area, and the helpers that erase or scramble take area
//! offsets.

use storage::{Flash, Sector};

use crate::{
    config::{ScrambleMode, MAX_IMG_SECTORS},
    image::IMAGE_HEADER_SIZE,
    trailer::{align_up, Trailer},
    Error, Result,
};

/// The sectors of one area, with offsets relative to the area.
pub type SectorTable = heapless::Vec<Sector, MAX_IMG_SECTORS>;

/// Largest piece written at a time when scrambling a device that can't be
/// erased.
const SCRAMBLE_CHUNK: usize = 128;

/// Enumerate the sectors of an area.
pub fn read_sectors<F: Flash>(flash: &F, max: usize) -> Result<SectorTable> {
    let base = flash.device_offset();
    let mut table = SectorTable::new();
    let mut index = 0;
    while let Some(sector) = flash.sector(index) {
        if table.len() >= max {
            return Err(Error::TooManySectors);
        }
        let rel = Sector { offset: sector.offset - base, size: sector.size };
        table.push(rel).map_err(|_| Error::TooManySectors)?;
        index += 1;
    }
    Ok(table)
}

/// Index of the sector holding `off`.
pub fn sector_index_of(table: &SectorTable, off: usize) -> Option<usize> {
    table.iter().position(|s| s.offset <= off && off < s.offset + s.size)
}

/// Start of the sector, relative to the area, holding `off`.
pub fn sector_start_of<F: Flash>(flash: &F, off: usize) -> Result<usize> {
    let base = flash.device_offset();
    let mut index = 0;
    while let Some(sector) = flash.sector(index) {
        let start = sector.offset - base;
        if start <= off && off < start + sector.size {
            return Ok(start);
        }
        index += 1;
    }
    Err(Error::Flash(storage::Error::OutOfBounds))
}

/// The sectors being the same size throughout, what size are they?
pub fn uniform_size(table: &SectorTable) -> Option<usize> {
    let first = table.first()?.size;
    table.iter().all(|s| s.size == first).then_some(first)
}

/// Offset of the first sector holding any part of the trailer.
pub fn first_trailer_sector_off(table: &SectorTable, trailer: &Trailer) -> Result<usize> {
    let index = sector_index_of(table, trailer.status_off()).ok_or(Error::IncompatibleSlots)?;
    Ok(table[index].offset)
}

/// Split two slots into units that start and end on a sector boundary in
/// both of them.  No unit may be larger than the scratch area.
pub fn swap_units(
    primary: &SectorTable,
    secondary: &SectorTable,
    scratch_size: usize,
) -> Result<SectorTable> {
    let mut units = SectorTable::new();
    let (mut i, mut j) = (0, 0);
    let (mut end0, mut end1) = (0, 0);
    let mut start = 0;
    while i < primary.len() || j < secondary.len() {
        if end0 <= end1 {
            let sector = primary.get(i).ok_or(Error::IncompatibleSlots)?;
            end0 += sector.size;
            i += 1;
        } else {
            let sector = secondary.get(j).ok_or(Error::IncompatibleSlots)?;
            end1 += sector.size;
            j += 1;
        }
        if end0 == end1 {
            let size = end0 - start;
            if size > scratch_size {
                log::error!("Sector of {} bytes will not fit in scratch", size);
                return Err(Error::IncompatibleSlots);
            }
            units.push(Sector { offset: start, size }).map_err(|_| Error::TooManySectors)?;
            start = end0;
        }
    }
    if end0 != end1 {
        return Err(Error::IncompatibleSlots);
    }
    Ok(units)
}

/// Visit each sector fully inside `[off, off + size)`, in either direction.
/// A range that splits a sector is an error.
fn for_each_sector<F, A>(
    flash: &mut F,
    off: usize,
    size: usize,
    backwards: bool,
    mut action: A,
) -> Result<()>
where
    F: Flash,
    A: FnMut(&mut F, usize, usize) -> Result<()>,
{
    let base = flash.device_offset();
    let end = off + size;
    let count = flash.sector_count();
    let mut covered = 0;
    for n in 0..count {
        let index = if backwards { count - 1 - n } else { n };
        let Some(sector) = flash.sector(index) else { break };
        let start = sector.offset - base;
        let stop = start + sector.size;
        if stop <= off || start >= end {
            continue;
        }
        if start < off || stop > end {
            return Err(Error::Flash(storage::Error::NotAligned));
        }
        action(flash, start, stop)?;
        covered += sector.size;
    }
    if covered != size {
        return Err(Error::Flash(storage::Error::OutOfBounds));
    }
    Ok(())
}

/// Prepare a region for writing.  Only devices that need an erase are
/// touched.
pub fn erase_region<F: Flash>(
    flash: &mut F,
    off: usize,
    size: usize,
    backwards: bool,
) -> Result<()> {
    if !flash.erase_required() || size == 0 {
        return Ok(());
    }
    for_each_sector(flash, off, size, backwards, |f, from, to| Ok(f.erase(from, to)?))
}

/// Destroy the contents of a region.  Devices without erase get the erased
/// value written over it.
pub fn scramble_region<F: Flash>(
    flash: &mut F,
    off: usize,
    size: usize,
    backwards: bool,
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    if flash.erase_required() {
        return for_each_sector(flash, off, size, backwards, |f, from, to| Ok(f.erase(from, to)?));
    }

    let write_size = flash.write_size();
    if write_size > SCRAMBLE_CHUNK {
        return Err(Error::Config("write size too large"));
    }
    let chunk = SCRAMBLE_CHUNK / write_size * write_size;
    let buf = [flash.erased_val(); SCRAMBLE_CHUNK];
    let mut done = 0;
    while done < size {
        let todo = (size - done).min(chunk);
        let pos = if backwards { off + size - done - todo } else { off + done };
        flash.write(pos, &buf[..todo])?;
        done += todo;
    }
    Ok(())
}

/// The part of a slot to destroy to leave the image at `image_off` without
/// a valid header.
pub fn header_scramble_off_sz<F: Flash>(
    flash: &F,
    image_off: usize,
    mode: ScrambleMode,
) -> Result<(usize, usize)> {
    if mode == ScrambleMode::Slot {
        return Ok((0, flash.capacity()));
    }
    if flash.erase_required() {
        let start = sector_start_of(flash, image_off)?;
        let base = flash.device_offset();
        let mut index = 0;
        while let Some(sector) = flash.sector(index) {
            if sector.offset - base == start {
                return Ok((start, sector.size));
            }
            index += 1;
        }
        return Err(Error::Flash(storage::Error::OutOfBounds));
    }
    let len = match mode {
        ScrambleMode::Magic => 4,
        _ => IMAGE_HEADER_SIZE,
    };
    Ok((image_off, align_up(len, flash.write_size())))
}

/// Make a slot unbootable.  The trailer goes first, so that the slot stops
/// being an upgrade candidate before its image is damaged.
pub fn scramble_slot<F: Flash>(
    flash: &mut F,
    trailer: &Trailer,
    image_off: usize,
    mode: ScrambleMode,
) -> Result<()> {
    log::warn!("Scrambling slot ({:?})", mode);
    let (off, size) = header_scramble_off_sz(flash, image_off, mode)?;
    if mode == ScrambleMode::Slot {
        return scramble_region(flash, off, size, true);
    }
    trailer.scramble(flash)?;
    scramble_region(flash, off, size, false)
}

#[cfg(test)]
mod tests {
    use simflash::SimFlash;

    use super::*;

    fn table(sizes: &[usize]) -> SectorTable {
        let mut t = SectorTable::new();
        let mut off = 0;
        for s in sizes {
            t.push(Sector { offset: off, size: *s }).unwrap();
            off += s;
        }
        t
    }

    #[test]
    fn relative_sectors() {
        let flash = SimFlash::with_sectors(1, 8, &[4096, 4096, 2048, 4096]).unwrap().at(0x20000);
        let t = read_sectors(&flash, 32).unwrap();
        assert_eq!(t.len(), 4);
        assert_eq!(t[3], Sector { offset: 10240, size: 4096 });
        assert_eq!(read_sectors(&flash, 3), Err(Error::TooManySectors));
        assert_eq!(uniform_size(&t), None);
        assert_eq!(sector_start_of(&flash, 9000), Ok(8192));
    }

    #[test]
    fn units_follow_common_boundaries() {
        let a = table(&[1024, 1024, 2048, 4096]);
        let b = table(&[2048, 1024, 1024, 4096]);
        let units = swap_units(&a, &b, 4096).unwrap();
        let sizes: heapless::Vec<usize, 8> = units.iter().map(|u| u.size).collect();
        assert_eq!(&sizes[..], &[2048, 2048, 4096]);
        assert_eq!(swap_units(&a, &b, 2048), Err(Error::IncompatibleSlots));
        assert_eq!(swap_units(&a, &table(&[4096, 2048]), 8192), Err(Error::IncompatibleSlots));
    }

    #[test]
    fn scramble_without_erase() {
        let mut flash = SimFlash::new(1, 4, 1024, 2).unwrap().without_erase();
        flash.install(&[0x5a; 2048], 0).unwrap();
        scramble_region(&mut flash, 1024, 1024, true).unwrap();
        assert!(flash.contents()[1024..].iter().all(|b| *b == 0xff));
        assert!(flash.contents()[..1024].iter().all(|b| *b == 0x5a));
        assert_eq!(flash.rail().erases(), 0);

        // Erase is a no-op here.
        erase_region(&mut flash, 0, 1024, false).unwrap();
        assert_eq!(flash.contents()[0], 0x5a);
    }

    #[test]
    fn erase_by_sector() {
        let mut flash = SimFlash::new(1, 8, 1024, 4).unwrap();
        flash.install(&[0; 4096], 0).unwrap();
        erase_region(&mut flash, 1024, 2048, true).unwrap();
        assert_eq!(flash.rail().erases(), 2);
        assert_eq!(
            erase_region(&mut flash, 512, 1024, false),
            Err(Error::Flash(storage::Error::NotAligned))
        );
        assert_eq!(header_scramble_off_sz(&flash, 0, ScrambleMode::Magic), Ok((0, 1024)));
        assert_eq!(header_scramble_off_sz(&flash, 1024, ScrambleMode::Header), Ok((1024, 1024)));

        let plain = SimFlash::new(1, 4, 1024, 4).unwrap().without_erase();
        assert_eq!(header_scramble_off_sz(&plain, 1024, ScrambleMode::Magic), Ok((1024, 4)));
        assert_eq!(header_scramble_off_sz(&plain, 0, ScrambleMode::Slot), Ok((0, 4096)));
    }
}
