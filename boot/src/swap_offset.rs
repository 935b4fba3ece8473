//! Swap with the upgrade stored one sector in
//!
//! An upgrade is written to the secondary slot starting at its second
//! sector.  That leaves the first secondary sector free, so the slots can be
//! swapped a sector at a time without moving anything first: primary sector
//! `n` goes to secondary sector `n`, then secondary sector `n + 1` goes to
//! primary sector `n`.  When reverting, the image in the secondary starts at
//! zero, and the swap runs from the top down, pushing the primary image back
//! up one sector.

use storage::Flash;

use crate::{
    loader::SwapCtx,
    swap_move::{prologue, sector_size, sectors_used},
    status::BootStatus,
    trailer::SwapType,
    view::{Area, SwapView},
    Error, Result,
};

pub(crate) fn views<'s, F: Flash>(
    ctx: &SwapCtx<'s, F>,
    bs: &BootStatus,
) -> Result<[SwapView<'s, F>; 2]> {
    let sz = sector_size(ctx)?;
    let last = sectors_used(ctx, bs.swap_size as usize)?;
    let done = (bs.idx as usize - 1).min(last);
    let op_done = if bs.state == 2 { (done + 1).min(last) } else { done };

    if bs.swap_type == SwapType::Revert {
        let mut op = ctx.view(Area::Primary, 0);
        let from = (last - op_done) * sz;
        op.map(from, op_done * sz, Area::Secondary, from + sz)?;
        let mut os = ctx.view(Area::Secondary, 0);
        let from = (last - done) * sz;
        os.map(from, done * sz, Area::Primary, from)?;
        Ok([op, os])
    } else {
        let mut op = ctx.view(Area::Primary, 0);
        op.map(0, op_done * sz, Area::Secondary, 0)?;
        let mut os = ctx.view(Area::Secondary, sz);
        os.map(0, done * sz, Area::Primary, 0)?;
        Ok([op, os])
    }
}

pub(crate) fn run<F: Flash>(ctx: &SwapCtx<'_, F>, bs: &mut BootStatus, fresh: bool) -> Result<()> {
    let sz = sector_size(ctx)?;
    let last = sectors_used(ctx, bs.swap_size as usize)?;
    let revert = bs.swap_type == SwapType::Revert;
    if bs.is_reset(ctx.config.strategy) {
        prologue(ctx, bs, fresh)?;
    }

    while bs.idx as usize <= last {
        let step = bs.idx as usize;
        let sector = if revert { last - step } else { step - 1 };
        let off = sector * sz;
        match (bs.state, revert) {
            (1, false) => {
                ctx.erase(Area::Secondary, off, sz)?;
                ctx.copy_region(&bs.keys, Area::Primary, Area::Secondary, off, off, sz, off)?;
            }
            (2, false) => {
                ctx.erase(Area::Primary, off, sz)?;
                ctx.copy_region(&bs.keys, Area::Secondary, Area::Primary, off + sz, off, sz, off)?;
            }
            (1, true) => {
                ctx.erase(Area::Secondary, off + sz, sz)?;
                ctx.copy_region(&bs.keys, Area::Primary, Area::Secondary, off, off + sz, sz, off)?;
            }
            (2, true) => {
                ctx.erase(Area::Primary, off, sz)?;
                ctx.copy_region(&bs.keys, Area::Secondary, Area::Primary, off, off, sz, off)?;
            }
            (state, _) => {
                log::error!("Invalid swap state {}", state);
                return Err(Error::BadStatus);
            }
        }
        ctx.write_status(bs)?;
        if bs.state == 1 {
            bs.state = 2;
        } else {
            bs.idx += 1;
            bs.state = 1;
        }
    }
    Ok(())
}
