//! Swap by moving the primary image up
//!
//! Without a scratch area, room is made by first moving every sector of the
//! primary image up by one.  The slots are then swapped a sector at a time:
//! secondary sector `n` goes to primary sector `n`, and the moved primary
//! sector, now at `n + 1`, goes to secondary sector `n`.  Both slots need
//! the same, uniform, sector size, and the primary needs one spare sector
//! below its trailer.

use storage::Flash;

use crate::{
    config::Strategy,
    loader::SwapCtx,
    sectors,
    status::{BootStatus, StatusOp},
    trailer::SwapType,
    view::{Area, SwapView},
    Error, Result,
};

/// The common sector size of both slots.
pub(crate) fn sector_size<F: Flash>(ctx: &SwapCtx<'_, F>) -> Result<usize> {
    match (sectors::uniform_size(ctx.sectors[0]), sectors::uniform_size(ctx.sectors[1])) {
        (Some(a), Some(b)) if a == b => Ok(a),
        _ => {
            log::error!("Slots need equal, uniform sectors");
            Err(Error::IncompatibleSlots)
        }
    }
}

/// The largest image that can be swapped.  One sector is lost to the move,
/// and the sectors holding the trailer can't hold image data.
pub(crate) fn max_image_size<F: Flash>(ctx: &SwapCtx<'_, F>) -> Result<usize> {
    let size = sector_size(ctx)?;
    let trailer_off = sectors::first_trailer_sector_off(ctx.sectors[0], &ctx.trailer)?;
    trailer_off.checked_sub(size).ok_or(Error::ImageTooLarge)
}

/// Number of sectors the swap has to touch.
pub(crate) fn sectors_used<F: Flash>(ctx: &SwapCtx<'_, F>, swap_size: usize) -> Result<usize> {
    if swap_size > max_image_size(ctx)? {
        return Err(Error::ImageTooLarge);
    }
    Ok(swap_size.div_ceil(sector_size(ctx)?))
}

/// Work done once, before the first sector is touched.
///
/// A revert is only called for by the primary trailer, which is about to be
/// erased, so the revert is first recorded in the secondary trailer.  It
/// stays there until the primary trailer holds the new journal.
pub(crate) fn prologue<F: Flash>(ctx: &SwapCtx<'_, F>, bs: &BootStatus, fresh: bool) -> Result<()> {
    if fresh {
        if bs.swap_type == SwapType::Revert {
            ctx.scramble_trailer(Area::Secondary)?;
            ctx.status_init(bs, Area::Secondary)?;
        }
        ctx.scramble_trailer(Area::Primary)?;
        ctx.status_init(bs, Area::Primary)?;
    }
    ctx.scramble_trailer(Area::Secondary)
}

pub(crate) fn views<'s, F: Flash>(
    ctx: &SwapCtx<'s, F>,
    bs: &BootStatus,
) -> Result<[SwapView<'s, F>; 2]> {
    let sz = sector_size(ctx)?;
    let last = sectors_used(ctx, bs.swap_size as usize)?;
    let mut op = ctx.view(Area::Primary, 0);
    let mut os = ctx.view(Area::Secondary, 0);
    let done = (bs.idx as usize - 1).min(last);
    match bs.op {
        StatusOp::Move => {
            let from = (last - done) * sz;
            op.map(from, done * sz, Area::Primary, from + sz)?;
        }
        StatusOp::Swap => {
            op.map(0, done * sz, Area::Secondary, 0)?;
            op.map(done * sz, (last - done) * sz, Area::Primary, done * sz + sz)?;
            let os_done = if bs.state == 2 { (done + 1).min(last) } else { done };
            os.map(0, os_done * sz, Area::Primary, 0)?;
        }
    }
    Ok([op, os])
}

pub(crate) fn run<F: Flash>(ctx: &SwapCtx<'_, F>, bs: &mut BootStatus, fresh: bool) -> Result<()> {
    let sz = sector_size(ctx)?;
    let last = sectors_used(ctx, bs.swap_size as usize)?;
    if bs.is_reset(Strategy::SwapMove) {
        prologue(ctx, bs, fresh)?;
    }

    if bs.op == StatusOp::Move {
        while bs.idx as usize <= last {
            let n = last - bs.idx as usize;
            ctx.erase(Area::Primary, (n + 1) * sz, sz)?;
            let off = n * sz;
            ctx.copy_region(&bs.keys, Area::Primary, Area::Primary, off, off + sz, sz, off)?;
            ctx.write_status(bs)?;
            bs.idx += 1;
        }
        bs.op = StatusOp::Swap;
        bs.idx = 1;
        bs.state = 1;
    }

    while bs.idx as usize <= last {
        let off = (bs.idx as usize - 1) * sz;
        match bs.state {
            1 => {
                ctx.erase(Area::Primary, off, sz)?;
                ctx.copy_region(&bs.keys, Area::Secondary, Area::Primary, off, off, sz, off)?;
                ctx.write_status(bs)?;
                bs.state = 2;
            }
            2 => {
                ctx.erase(Area::Secondary, off, sz)?;
                ctx.copy_region(&bs.keys, Area::Primary, Area::Secondary, off + sz, off, sz, off)?;
                ctx.write_status(bs)?;
                bs.idx += 1;
                bs.state = 1;
            }
            state => {
                log::error!("Invalid swap state {}", state);
                return Err(Error::BadStatus);
            }
        }
    }
    Ok(())
}
