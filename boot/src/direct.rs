//! Direct-XIP and RAM loading
//!
//! Neither strategy moves images between slots.  Both slots are candidates
//! and the one holding the newest valid image is booted, either in place or
//! after copying it into RAM.  With revert enabled the trailer tracks test
//! boots: the first boot of a new image sets copy done, and an image that
//! is booted again with copy done but without image ok was never confirmed,
//! so it is destroyed and the other slot is used.

use core::cell::RefCell;

use storage::{Flash, ReadFlash};

use crate::{
    enc::{self, KeyEnvelope},
    image::{Image, ImageHeader},
    loader::{BootLoader, BootResponse, Crypto, RamRegion, Slot},
    sectors,
    trailer::{align_up, BootFlag, MagicState, SwapType, Trailer},
    Error, Result,
};

impl<'a, F: Flash> BootLoader<'a, F> {
    pub(crate) fn boot_direct_image(&mut self, revert: bool, ram: bool) -> Result<BootResponse> {
        let image = self.current;
        let mut excluded = [false; 2];
        loop {
            let (slot, header) = self.pick_slot(image, &excluded, !ram)?;
            let area = self.flash.area(image, slot).ok_or(Error::CannotUpgrade)?;
            let trailer = Trailer::direct(area.borrow().capacity(), self.write_sz);
            let state = trailer.read_swap_state(&mut *area.borrow_mut())?;

            if revert
                && state.magic == MagicState::Good
                && state.copy_done == BootFlag::Set
                && state.image_ok == BootFlag::Unset
            {
                log::warn!("Image {} {:?} slot was not confirmed, reverting", image, slot);
                sectors::scramble_slot(&mut *area.borrow_mut(), &trailer, 0, self.config.scramble)?;
                excluded[slot.index()] = true;
                continue;
            }

            let ram_load = if ram {
                let region = self.ram.as_mut().ok_or(Error::Config("RAM load needs a RAM region"))?;
                match load_into_ram(region, area, &self.crypto, &header) {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        log::warn!("Image {} {:?} slot: RAM load failed: {}", image, slot, e);
                        excluded[slot.index()] = true;
                        continue;
                    }
                }
            } else {
                None
            };

            if revert && state.magic == MagicState::Good && state.copy_done == BootFlag::Unset {
                log::info!("Image {} {:?} slot: test boot", image, slot);
                trailer.write_copy_done(&mut *area.borrow_mut())?;
            }

            let image_off = area.borrow().device_offset();
            log::info!("Image {}: booting {:?} slot, version={}", image, slot, header.version());
            let st = &mut self.state[image];
            st.swap_type = SwapType::None;
            st.booted = Some(slot);
            st.headers[slot.index()] = Some(header);
            return Ok(BootResponse { image, slot, header, image_off, ram_load });
        }
    }

    /// The slot with the newest image, ignoring `excluded` ones.  Equal
    /// versions prefer the primary.
    fn pick_slot(
        &self,
        image: usize,
        excluded: &[bool; 2],
        verify: bool,
    ) -> Result<(Slot, ImageHeader)> {
        let mut best: Option<(Slot, ImageHeader)> = None;
        for slot in [Slot::Primary, Slot::Secondary] {
            if excluded[slot.index()] {
                continue;
            }
            let Some(area) = self.flash.area(image, slot) else {
                continue;
            };
            let Ok(img) = Image::from_flash(area) else {
                continue;
            };
            if verify && img.verify(self.crypto.verifier, None).is_failure() {
                log::warn!("Image {} {:?} slot is not valid", image, slot);
                continue;
            }
            if best.map_or(true, |(_, hdr)| img.header.version() > hdr.version()) {
                best = Some((slot, img.header));
            }
        }
        best.ok_or(Error::VerificationFailed)
    }
}

/// Copy the image in `area` to its load address, decrypting it on the way,
/// and check it there.  Gives the load address.
fn load_into_ram<F: Flash>(
    region: &mut RamRegion<'_>,
    area: &RefCell<F>,
    crypto: &Crypto<'_>,
    hdr: &ImageHeader,
) -> Result<usize> {
    let mut keys = KeyEnvelope::default();
    let size = {
        let image = Image::from_flash(area)?;
        if hdr.is_encrypted() {
            let unwrap = crypto
                .unwrap
                .ok_or(Error::Config("encrypted image needs a key unwrapper"))?;
            enc::load_key(&image, unwrap, 0, &mut keys)?;
        }
        align_up(image.full_image_size(), area.borrow().read_size())
    };

    let load = hdr.load_addr() as usize;
    let start = load.checked_sub(region.base).ok_or(Error::ImageTooLarge)?;
    let end = start
        .checked_add(size)
        .filter(|end| *end <= region.mem.len())
        .ok_or(Error::ImageTooLarge)?;
    if region.used.iter().any(|r| r.start < end && start < r.end) {
        return Err(Error::Config("images overlap in RAM"));
    }

    let dest = &mut region.mem[start..end];
    area.borrow_mut().read(0, dest)?;
    if let Some(key) = keys.key(0) {
        let cipher = crypto.cipher.ok_or(Error::Config("encrypted image needs a cipher"))?;
        enc::apply_in_body(cipher, key, hdr, 0, dest);
    }

    let valid = {
        let loaded = RefCell::new(&region.mem[start..end]);
        Image::from_flash(&loaded).is_ok_and(|img| img.verify(crypto.verifier, None).is_success())
    };
    if !valid {
        region.mem[start..end].fill(0);
        return Err(Error::VerificationFailed);
    }
    region.used.push(start..end).map_err(|_| Error::Config("too many images in RAM"))?;
    log::debug!("Loaded {} bytes at {:#x}", size, load);
    Ok(load)
}
