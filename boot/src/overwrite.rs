//! Overwrite-only upgrades
//!
//! The secondary image is copied over the primary, and the secondary slot
//! is then made unbootable.  Nothing is journaled: an interrupted copy is
//! simply started again, as the secondary trailer still requests it.  There
//! is no way back to the old image.

use storage::Flash;

use crate::{
    enc::KeyEnvelope,
    loader::{Slot, SwapCtx},
    sectors,
    trailer::{align_up, BootFlag, MagicState, SwapType},
    view::{image_extent, Area},
    Error, Result,
};

pub(crate) fn run<F: Flash>(ctx: &mut SwapCtx<'_, F>) -> Result<SwapType> {
    let state = ctx.secondary_trailer.read_swap_state(&mut *ctx.secondary.borrow_mut())?;
    if state.magic != MagicState::Good {
        return Ok(SwapType::None);
    }
    let swap_type = if state.image_ok == BootFlag::Set { SwapType::Perm } else { SwapType::Test };
    log::info!("Image {}: overwriting primary ({:?})", ctx.image_num, swap_type);

    let trailer = ctx.secondary_trailer;
    if !ctx.validate_candidate(0, swap_type)? {
        log::warn!("Image in the secondary slot is not valid!");
        sectors::scramble_slot(&mut *ctx.secondary.borrow_mut(), &trailer, 0, ctx.config.scramble)?;
        return Ok(SwapType::Fail);
    }

    let (hdr, size) = image_extent(ctx.view(Area::Secondary, 0)).ok_or(Error::InvalidImage)?;
    ctx.headers = [None, Some(hdr)];
    let mut keys = KeyEnvelope::default();
    ctx.load_key(ctx.view(Area::Secondary, 0), Slot::Secondary.index(), &mut keys)?;

    ctx.scramble_trailer(Area::Primary)?;
    let copy = align_up(size, ctx.write_sz);
    let last = sectors::sector_index_of(ctx.sectors[0], copy - 1).ok_or(Error::ImageTooLarge)?;
    let end = ctx.sectors[0][last].offset + ctx.sectors[0][last].size;
    ctx.erase(Area::Primary, 0, end)?;
    ctx.copy_region(&keys, Area::Secondary, Area::Primary, 0, 0, copy, 0)?;

    sectors::scramble_slot(&mut *ctx.secondary.borrow_mut(), &trailer, 0, ctx.config.scramble)?;
    log::info!("Image {}: overwrite complete", ctx.image_num);
    Ok(swap_type)
}
