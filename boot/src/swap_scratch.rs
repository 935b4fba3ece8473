//! Swap using a scratch area
//!
//! The slots are exchanged a chunk at a time, starting from the top.  A
//! chunk is a run of swap units small enough to fit in the scratch area.
//! Each chunk goes through three states:
//!
//! 1. the secondary chunk is copied to scratch
//! 2. the primary chunk is copied to the secondary
//! 3. the scratch copy is written to the primary
//!
//! The first chunk is special.  When it includes the trailer sectors of the
//! primary, state 3 erases the trailer holding the status, so the status of
//! that chunk is kept in the scratch trailer, and moved into the primary once
//! the chunk is done.

use storage::{Flash, ReadFlash};

use crate::{
    config::MAX_IMG_SECTORS,
    loader::SwapCtx,
    sectors,
    status::BootStatus,
    view::{Area, SwapView},
    Error, Result,
};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct Chunk {
    /// Offset in both slots.
    pub off: usize,
    pub size: usize,
    /// Bytes actually copied.  The chunk holding the trailer stops short of
    /// the status area.
    pub copy_sz: usize,
}

#[derive(Debug)]
pub(crate) struct Plan {
    /// In the order they are swapped, the highest first.
    pub chunks: heapless::Vec<Chunk, MAX_IMG_SECTORS>,
    /// The first chunk keeps its status in the scratch area.
    pub use_scratch: bool,
}

/// Group the units holding the first `swap_size` bytes into chunks.
pub(crate) fn plan<F: Flash>(ctx: &SwapCtx<'_, F>, swap_size: usize) -> Result<Plan> {
    let status_off = ctx.trailer.status_off();
    if swap_size > status_off {
        return Err(Error::ImageTooLarge);
    }
    let scratch_cap = ctx.area(Area::Scratch)?.borrow().capacity();
    let scratch_room = ctx.area_trailer(Area::Scratch)?.status_off();
    let units = sectors::swap_units(ctx.sectors[0], ctx.sectors[1], scratch_cap)?;
    let trailer_off = sectors::first_trailer_sector_off(&units, &ctx.trailer)?;

    // Bytes to copy for a run, and the room scratch has for it.
    let need = |off: usize, end: usize| {
        if end > trailer_off {
            end.min(status_off) - off
        } else {
            end - off
        }
    };
    let room = |end: usize| if end > trailer_off { scratch_room } else { scratch_cap };

    let mut chunks: heapless::Vec<Chunk, MAX_IMG_SECTORS> = heapless::Vec::new();
    let mut cur: Option<Chunk> = None;
    for unit in units.iter().rev().filter(|u| u.offset < swap_size) {
        if let Some(c) = cur.as_mut() {
            let end = c.off + c.size;
            if need(unit.offset, end) <= room(end) {
                c.off = unit.offset;
                c.size += unit.size;
                continue;
            }
        }
        if let Some(c) = cur.take() {
            chunks.push(c).map_err(|_| Error::TooManySectors)?;
        }
        let end = unit.offset + unit.size;
        if need(unit.offset, end) > room(end) {
            log::error!("Unit at {:#x} does not fit in scratch", unit.offset);
            return Err(Error::ImageTooLarge);
        }
        cur = Some(Chunk { off: unit.offset, size: unit.size, copy_sz: 0 });
    }
    if let Some(c) = cur {
        chunks.push(c).map_err(|_| Error::TooManySectors)?;
    }

    for c in chunks.iter_mut() {
        c.copy_sz = need(c.off, c.off + c.size);
    }
    if chunks.iter().skip(1).any(|c| c.off + c.size > trailer_off) {
        return Err(Error::ImageTooLarge);
    }
    let use_scratch = chunks.first().is_some_and(|c| c.off + c.size > trailer_off);
    Ok(Plan { chunks, use_scratch })
}

/// Where each image is, after the steps already recorded in `bs`.
pub(crate) fn views<'s, F: Flash>(
    ctx: &SwapCtx<'s, F>,
    bs: &BootStatus,
) -> Result<[SwapView<'s, F>; 2]> {
    let plan = plan(ctx, bs.swap_size as usize)?;
    let mut op = ctx.view(Area::Primary, 0);
    let mut os = ctx.view(Area::Secondary, 0);
    for (n, c) in plan.chunks.iter().enumerate() {
        let idx = n as u32 + 1;
        if idx < bs.idx {
            op.map(c.off, c.copy_sz, Area::Secondary, c.off)?;
            os.map(c.off, c.copy_sz, Area::Primary, c.off)?;
        } else if idx == bs.idx {
            if bs.state >= 2 {
                os.map(c.off, c.copy_sz, Area::Scratch, 0)?;
            }
            if bs.state == 3 {
                op.map(c.off, c.copy_sz, Area::Secondary, c.off)?;
            }
        }
    }
    Ok([op, os])
}

/// Perform, or finish, the swap from the position in `bs`.
pub(crate) fn run<F: Flash>(ctx: &SwapCtx<'_, F>, bs: &mut BootStatus) -> Result<()> {
    let plan = plan(ctx, bs.swap_size as usize)?;
    let scratch = ctx.area(Area::Scratch)?;
    let scratch_cap = scratch.borrow().capacity();
    log::debug!("Scratch swap: {} chunks, use_scratch={}", plan.chunks.len(), plan.use_scratch);

    while let Some(chunk) = plan.chunks.get(bs.idx as usize - 1).copied() {
        if bs.idx == 1 {
            bs.use_scratch = plan.use_scratch;
        }
        match bs.state {
            1 => {
                sectors::scramble_region(&mut *scratch.borrow_mut(), 0, scratch_cap, true)?;
                if bs.idx == 1 {
                    ctx.status_init(bs, Area::Scratch)?;
                    if !bs.use_scratch {
                        ctx.scramble_trailer(Area::Primary)?;
                        ctx.status_init(bs, Area::Primary)?;
                        ctx.scramble_trailer(Area::Scratch)?;
                    }
                }
                let (off, sz) = (chunk.off, chunk.copy_sz);
                ctx.copy_region(&bs.keys, Area::Secondary, Area::Scratch, off, 0, sz, off)?;
                ctx.write_status(bs)?;
                bs.state = 2;
            }
            2 => {
                ctx.erase(Area::Secondary, chunk.off, chunk.size)?;
                if bs.idx == 1 {
                    ctx.scramble_trailer(Area::Secondary)?;
                }
                let (off, sz) = (chunk.off, chunk.copy_sz);
                ctx.copy_region(&bs.keys, Area::Primary, Area::Secondary, off, off, sz, off)?;
                ctx.write_status(bs)?;
                bs.state = 3;
            }
            3 => {
                ctx.erase(Area::Primary, chunk.off, chunk.size)?;
                let relocate = bs.use_scratch;
                if relocate {
                    ctx.scramble_trailer(Area::Primary)?;
                }
                let (off, sz) = (chunk.off, chunk.copy_sz);
                ctx.copy_region(&bs.keys, Area::Scratch, Area::Primary, 0, off, sz, off)?;
                if relocate {
                    relocate_status(ctx, bs)?;
                    bs.use_scratch = false;
                }
                ctx.write_status(bs)?;
                bs.idx += 1;
                bs.state = 1;
                if relocate {
                    ctx.scramble_trailer(Area::Scratch)?;
                }
            }
            state => {
                log::error!("Invalid swap state {}", state);
                return Err(Error::BadStatus);
            }
        }
    }
    Ok(())
}

/// Replay the entries of the first chunk into the primary trailer, then
/// give it a header.
fn relocate_status<F: Flash>(ctx: &SwapCtx<'_, F>, bs: &BootStatus) -> Result<()> {
    log::debug!("Moving status from scratch to primary");
    let mut entry = bs.clone();
    entry.use_scratch = false;
    for state in 1..bs.state {
        entry.state = state;
        ctx.write_status(&entry)?;
    }
    ctx.status_init(bs, Area::Primary)
}
