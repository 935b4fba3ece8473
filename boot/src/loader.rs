//! The boot loader
//!
//! A `BootLoader` owns the flash areas of every image, and on each boot
//! brings each image to a bootable state: finishing any interrupted swap,
//! starting a requested one, reverting an unconfirmed test, and finally
//! checking the image it is about to hand back.  Images are processed one at
//! a time, through a current image cursor.

use core::cell::RefCell;

use storage::{Flash, ReadFlash};

use crate::{
    config::{BootConfig, Strategy, BOOT_MAX_ALIGN, MAX_IMAGES},
    enc::{self, ImageCipher, KeyEnvelope, KeyUnwrap},
    fih::{HashOnly, SignatureVerifier},
    image::{Image, ImageHeader},
    overwrite,
    sectors::{self, SectorTable},
    status::{self, BootStatus, StatusSource},
    swap_move, swap_offset, swap_scratch,
    trailer::{
        self, flag_compatible_check, magic_compatible_check, BootFlag, MagicState, SwapState,
        SwapType, Trailer,
    },
    view::{image_extent, Area, SwapView},
    Error, Result,
};

/// Largest piece of an image moved at a time.
const COPY_BUF_SZ: usize = 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Slot {
    Primary = 0,
    Secondary = 1,
}

impl Slot {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// The two slots of an image.  An image without a secondary slot can never
/// be upgraded, only booted.
pub struct SlotPair<F> {
    pub primary: RefCell<F>,
    pub secondary: Option<RefCell<F>>,
}

/// Every flash area the boot loader manages.
pub struct FlashMap<F> {
    pub images: heapless::Vec<SlotPair<F>, MAX_IMAGES>,
    pub scratch: Option<RefCell<F>>,
}

impl<F> Default for FlashMap<F> {
    fn default() -> Self {
        FlashMap { images: heapless::Vec::new(), scratch: None }
    }
}

impl<F> FlashMap<F> {
    pub fn new() -> FlashMap<F> {
        FlashMap::default()
    }

    pub fn add_image(&mut self, primary: F, secondary: Option<F>) -> Result<()> {
        let pair = SlotPair {
            primary: RefCell::new(primary),
            secondary: secondary.map(RefCell::new),
        };
        self.images.push(pair).map_err(|_| Error::Config("too many images"))
    }

    pub fn set_scratch(&mut self, scratch: F) {
        self.scratch = Some(RefCell::new(scratch));
    }

    pub fn area(&self, image: usize, slot: Slot) -> Option<&RefCell<F>> {
        let pair = self.images.get(image)?;
        match slot {
            Slot::Primary => Some(&pair.primary),
            Slot::Secondary => pair.secondary.as_ref(),
        }
    }

    fn all_areas(&self) -> impl Iterator<Item = &RefCell<F>> {
        self.images
            .iter()
            .flat_map(|p| core::iter::once(&p.primary).chain(p.secondary.as_ref()))
            .chain(self.scratch.as_ref())
    }
}

/// The cryptographic services supplied by the board.
#[derive(Clone, Copy)]
pub struct Crypto<'a> {
    pub verifier: &'a dyn SignatureVerifier,
    pub cipher: Option<&'a dyn ImageCipher>,
    pub unwrap: Option<&'a dyn KeyUnwrap>,
}

impl Default for Crypto<'_> {
    fn default() -> Self {
        Crypto { verifier: &HashOnly, cipher: None, unwrap: None }
    }
}

/// What to boot, for one image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BootResponse {
    pub image: usize,
    pub slot: Slot,
    pub header: ImageHeader,
    /// Device offset of the start of the image.
    pub image_off: usize,
    /// Address the image was copied to, when loaded into RAM.
    pub ram_load: Option<usize>,
}

pub(crate) struct ImageState {
    pub swap_type: SwapType,
    pub booted: Option<Slot>,
    pub headers: [Option<ImageHeader>; 2],
    pub sectors: [SectorTable; 2],
}

impl ImageState {
    fn new() -> ImageState {
        ImageState {
            swap_type: SwapType::None,
            booted: None,
            headers: [None, None],
            sectors: [SectorTable::new(), SectorTable::new()],
        }
    }
}

/// Memory that images are loaded into by the RAM load strategy.  `base` is
/// the address of the first byte of `mem`.
pub(crate) struct RamRegion<'a> {
    pub mem: &'a mut [u8],
    pub base: usize,
    pub used: heapless::Vec<core::ops::Range<usize>, MAX_IMAGES>,
}

pub struct BootLoader<'a, F> {
    pub(crate) config: BootConfig,
    pub(crate) flash: FlashMap<F>,
    pub(crate) crypto: Crypto<'a>,
    pub(crate) ram: Option<RamRegion<'a>>,
    pub(crate) state: heapless::Vec<ImageState, MAX_IMAGES>,
    /// Alignment used for every trailer: the largest write size of any area.
    pub(crate) write_sz: usize,
    pub(crate) current: usize,
}

impl<'a, F: Flash> BootLoader<'a, F> {
    pub fn new(
        config: BootConfig,
        flash: FlashMap<F>,
        crypto: Crypto<'a>,
    ) -> Result<BootLoader<'a, F>> {
        config.validate()?;
        if flash.images.len() != config.image_number {
            return Err(Error::Config("image_number does not match the flash map"));
        }
        if config.strategy == Strategy::SwapScratch && flash.scratch.is_none() {
            return Err(Error::Config("swap using scratch needs a scratch area"));
        }

        let write_sz = flash.all_areas().map(|a| a.borrow().write_size()).max().unwrap_or(1);
        if write_sz > BOOT_MAX_ALIGN || !write_sz.is_power_of_two() {
            return Err(Error::Config("unsupported write size"));
        }

        let mut state = heapless::Vec::new();
        for pair in &flash.images {
            let mut st = ImageState::new();
            if !config.strategy.slots_equivalent() {
                let max = config.max_img_sectors;
                st.sectors[0] = sectors::read_sectors(&*pair.primary.borrow(), max)?;
                if let Some(secondary) = &pair.secondary {
                    st.sectors[1] = sectors::read_sectors(&*secondary.borrow(), max)?;
                }
            }
            state.push(st).map_err(|_| Error::Config("too many images"))?;
        }

        Ok(BootLoader {
            config,
            flash,
            crypto,
            ram: None,
            state,
            write_sz,
            current: 0,
        })
    }

    /// Give the loader memory to load images into.  `base` is the address
    /// `mem` appears at.
    pub fn with_ram(mut self, mem: &'a mut [u8], base: usize) -> BootLoader<'a, F> {
        self.ram = Some(RamRegion { mem, base, used: heapless::Vec::new() });
        self
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn flash(&self) -> &FlashMap<F> {
        &self.flash
    }

    pub fn into_flash(self) -> FlashMap<F> {
        self.flash
    }

    pub fn write_sz(&self) -> usize {
        self.write_sz
    }

    pub fn current_image(&self) -> usize {
        self.current
    }

    pub fn set_current_image(&mut self, image: usize) -> Result<()> {
        if image >= self.config.image_number {
            return Err(Error::Config("no such image"));
        }
        self.current = image;
        Ok(())
    }

    /// The area of a slot of the current image.
    pub fn img_area(&self, slot: Slot) -> Option<&RefCell<F>> {
        self.flash.area(self.current, slot)
    }

    /// Header of the image in a slot of the current image, as of the last
    /// boot.
    pub fn img_hdr(&self, slot: Slot) -> Option<&ImageHeader> {
        self.state.get(self.current)?.headers[slot.index()].as_ref()
    }

    pub fn img_num_sectors(&self, slot: Slot) -> usize {
        self.state.get(self.current).map_or(0, |s| s.sectors[slot.index()].len())
    }

    /// Offset of a sector, relative to its slot.
    pub fn img_sector_off(&self, slot: Slot, sector: usize) -> Option<usize> {
        Some(self.state.get(self.current)?.sectors[slot.index()].get(sector)?.offset)
    }

    pub fn img_sector_size(&self, slot: Slot, sector: usize) -> Option<usize> {
        Some(self.state.get(self.current)?.sectors[slot.index()].get(sector)?.size)
    }

    /// The swap performed on the current image by the last boot.
    pub fn swap_type(&self) -> SwapType {
        self.state.get(self.current).map_or(SwapType::None, |s| s.swap_type)
    }

    fn enc_block(&self) -> usize {
        self.config.encryption.map_or(0, |e| e.block_size())
    }

    /// The trailer of an image slot.
    pub fn slot_trailer(&self, area: &RefCell<F>) -> Trailer {
        Trailer::for_slot(
            self.config.strategy,
            area.borrow().capacity(),
            self.write_sz,
            self.config.status_entries(),
            self.enc_block(),
        )
    }

    fn scratch_trailer(&self, area: &RefCell<F>) -> Trailer {
        Trailer::swap(
            area.borrow().capacity(),
            self.write_sz,
            self.config.strategy.state_count(),
            self.enc_block(),
        )
    }

    /// Request an upgrade of `image` to the contents of its secondary slot.
    pub fn set_pending(&mut self, image: usize, permanent: bool) -> Result<()> {
        let pair = self.flash.images.get(image).ok_or(Error::Config("no such image"))?;
        let secondary = pair.secondary.as_ref().ok_or(Error::CannotUpgrade)?;
        let trailer = self.slot_trailer(secondary);
        trailer::set_pending(&trailer, &mut *secondary.borrow_mut(), image as u8, permanent)
    }

    /// Confirm the running `image`, so that it won't be reverted.
    pub fn set_confirmed(&mut self, image: usize) -> Result<()> {
        let slot = self.state.get(image).ok_or(Error::Config("no such image"))?.booted;
        let area = self
            .flash
            .area(image, slot.unwrap_or(Slot::Primary))
            .ok_or(Error::CannotUpgrade)?;
        let trailer = self.slot_trailer(area);
        trailer::set_confirmed(&trailer, &mut *area.borrow_mut())
    }

    /// Bring every image to a bootable state, and say what to boot.
    pub fn boot_go(&mut self) -> Result<heapless::Vec<BootResponse, MAX_IMAGES>> {
        let mut responses = heapless::Vec::new();
        for image in 0..self.config.image_number {
            self.current = image;
            let response = match self.config.strategy {
                Strategy::SwapScratch
                | Strategy::SwapMove
                | Strategy::SwapOffset
                | Strategy::OverwriteOnly => self.boot_swap_image()?,
                Strategy::DirectXip { revert } => self.boot_direct_image(revert, false)?,
                Strategy::RamLoad { revert } => self.boot_direct_image(revert, true)?,
            };
            responses.push(response).map_err(|_| Error::Config("too many images"))?;
        }
        Ok(responses)
    }

    fn boot_swap_image(&mut self) -> Result<BootResponse> {
        let image = self.current;
        if self.flash.images[image].secondary.is_some() {
            let outcome = self.swap_ctx(image).and_then(|mut ctx| match ctx.config.strategy {
                Strategy::OverwriteOnly => overwrite::run(&mut ctx),
                _ => ctx.upgrade(),
            });
            match outcome {
                Ok(swap_type) => self.state[image].swap_type = swap_type,
                Err(e) => {
                    if e == Error::BadStatus {
                        log::error!("Image {}: swap status is corrupt", image);
                        self.state[image].swap_type = SwapType::Panic;
                    }
                    return Err(e);
                }
            }
        }
        self.boot_primary(image)
    }

    /// Check the primary slot and describe it.
    fn boot_primary(&mut self, image: usize) -> Result<BootResponse> {
        let pair = &self.flash.images[image];
        let header = {
            let img = Image::from_flash(&pair.primary)?;
            log::info!("Primary slot: version={}", img.header.version());
            if self.config.validate_primary_slot
                && img.verify(self.crypto.verifier, None).is_failure()
            {
                log::error!("Image in the primary slot is not valid!");
                return Err(Error::VerificationFailed);
            }
            img.header
        };
        let image_off = pair.primary.borrow().device_offset();
        let secondary = pair.secondary.as_ref().and_then(|area| self.secondary_header(area));

        let st = &mut self.state[image];
        st.headers = [Some(header), secondary];
        st.booted = Some(Slot::Primary);
        Ok(BootResponse { image, slot: Slot::Primary, header, image_off, ram_load: None })
    }

    fn secondary_header(&self, area: &RefCell<F>) -> Option<ImageHeader> {
        let at = |base: usize| {
            image_extent(SwapView::new([None, Some(area), None], Area::Secondary, base))
                .map(|e| e.0)
        };
        match (self.config.strategy, self.state[self.current].sectors[1].first()) {
            (Strategy::SwapOffset, Some(first)) => at(first.size).or_else(|| at(0)),
            _ => at(0),
        }
    }

    pub(crate) fn swap_ctx(&self, image: usize) -> Result<SwapCtx<'_, F>> {
        let pair = &self.flash.images[image];
        let secondary = pair.secondary.as_ref().ok_or(Error::CannotUpgrade)?;
        let st = &self.state[image];
        let scratch = match self.config.strategy {
            Strategy::SwapScratch => self.flash.scratch.as_ref(),
            _ => None,
        };
        Ok(SwapCtx {
            config: &self.config,
            crypto: self.crypto,
            image_num: image as u8,
            write_sz: self.write_sz,
            primary: &pair.primary,
            secondary,
            scratch,
            sectors: [&st.sectors[0], &st.sectors[1]],
            trailer: self.slot_trailer(&pair.primary),
            secondary_trailer: self.slot_trailer(secondary),
            scratch_trailer: scratch.map(|s| self.scratch_trailer(s)),
            headers: [None, None],
        })
    }
}

/// Everything a swap of one image works with.
pub(crate) struct SwapCtx<'s, F> {
    pub config: &'s BootConfig,
    pub crypto: Crypto<'s>,
    pub image_num: u8,
    pub write_sz: usize,
    pub primary: &'s RefCell<F>,
    pub secondary: &'s RefCell<F>,
    pub scratch: Option<&'s RefCell<F>>,
    pub sectors: [&'s SectorTable; 2],
    pub trailer: Trailer,
    pub secondary_trailer: Trailer,
    pub scratch_trailer: Option<Trailer>,
    /// Headers of the images that started out in the primary and the
    /// secondary slot.  Used to find the payload when encrypting.
    pub headers: [Option<ImageHeader>; 2],
}

impl<'s, F: Flash> SwapCtx<'s, F> {
    pub fn area(&self, area: Area) -> Result<&'s RefCell<F>> {
        match area {
            Area::Primary => Ok(self.primary),
            Area::Secondary => Ok(self.secondary),
            Area::Scratch => self.scratch.ok_or(Error::Config("no scratch area")),
        }
    }

    pub fn area_trailer(&self, area: Area) -> Result<Trailer> {
        match area {
            Area::Primary => Ok(self.trailer),
            Area::Secondary => Ok(self.secondary_trailer),
            Area::Scratch => self.scratch_trailer.ok_or(Error::Config("no scratch area")),
        }
    }

    /// A view of the image at `base` in `area`, with nothing moved.
    pub fn view(&self, home: Area, base: usize) -> SwapView<'s, F> {
        SwapView::new([Some(self.primary), Some(self.secondary), self.scratch], home, base)
    }

    pub fn erase(&self, area: Area, off: usize, size: usize) -> Result<()> {
        sectors::erase_region(&mut *self.area(area)?.borrow_mut(), off, size, false)
    }

    pub fn scramble_trailer(&self, area: Area) -> Result<()> {
        let trailer = self.area_trailer(area)?;
        trailer.scramble(&mut *self.area(area)?.borrow_mut())
    }

    /// Copy `sz` bytes between areas.  Data leaving the secondary slot is
    /// decrypted with the key of the image that started there, and data
    /// entering it is encrypted with the key of the image that started in
    /// the primary.  `img_off` is the offset of the data within that image.
    pub fn copy_region(
        &self,
        keys: &KeyEnvelope,
        src: Area,
        dst: Area,
        src_off: usize,
        dst_off: usize,
        sz: usize,
        img_off: usize,
    ) -> Result<()> {
        let transform = match (src, dst) {
            (Area::Secondary, Area::Secondary) => None,
            (Area::Secondary, _) => Some(1),
            (_, Area::Secondary) => Some(0),
            _ => None,
        };
        let transform = match (transform, self.crypto.cipher) {
            (Some(slot), Some(cipher)) => match (keys.key(slot), &self.headers[slot]) {
                (Some(key), Some(hdr)) => Some((cipher, key, hdr)),
                _ => None,
            },
            _ => None,
        };

        let mut buf = [0u8; COPY_BUF_SZ];
        let mut done = 0;
        while done < sz {
            let todo = (sz - done).min(buf.len());
            let chunk = &mut buf[..todo];
            self.area(src)?.borrow_mut().read(src_off + done, chunk)?;
            if let Some((cipher, key, hdr)) = transform {
                enc::apply_in_body(cipher, key, hdr, img_off + done, chunk);
            }
            self.area(dst)?.borrow_mut().write(dst_off + done, chunk)?;
            done += todo;
        }
        Ok(())
    }

    /// Start the journal of a swap in the trailer of `area`.  The magic goes
    /// last, so a trailer with a good magic always holds a complete header.
    pub fn status_init(&self, bs: &BootStatus, area: Area) -> Result<()> {
        let trailer = self.area_trailer(area)?;
        let mut flash = self.area(area)?.borrow_mut();
        let flash = &mut *flash;
        log::debug!("Initializing status in {:?} ({:?})", area, bs.swap_type);
        if bs.swap_type != SwapType::None {
            trailer.write_swap_info(flash, bs.swap_type, self.image_num)?;
        }
        if bs.swap_type == SwapType::Perm {
            trailer.write_image_ok(flash)?;
        }
        trailer.write_swap_size(flash, bs.swap_size)?;
        if let Some(cfg) = &self.config.encryption {
            for slot in 0..2 {
                enc::write_enc_key(&trailer, flash, slot, &bs.keys, cfg)?;
            }
        }
        trailer.write_magic(flash)
    }

    /// Record completion of the current state, wherever the status lives.
    pub fn write_status(&self, bs: &BootStatus) -> Result<()> {
        let area = if bs.use_scratch { Area::Scratch } else { Area::Primary };
        let trailer = self.area_trailer(area)?;
        bs.write(&trailer, &mut *self.area(area)?.borrow_mut(), self.config.strategy)
    }

    fn check_layout(&self) -> Result<()> {
        match self.config.strategy {
            Strategy::SwapScratch => {
                let scratch = self.area(Area::Scratch)?.borrow().capacity();
                if self.primary.borrow().capacity() != self.secondary.borrow().capacity() {
                    return Err(Error::IncompatibleSlots);
                }
                sectors::swap_units(self.sectors[0], self.sectors[1], scratch).map(|_| ())
            }
            Strategy::SwapMove | Strategy::SwapOffset => {
                if self.primary.borrow().capacity() != self.secondary.borrow().capacity() {
                    return Err(Error::IncompatibleSlots);
                }
                swap_move::sector_size(self).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Can an image of `size` bytes be swapped in?
    fn fits(&self, size: usize) -> bool {
        match self.config.strategy {
            Strategy::SwapScratch => swap_scratch::plan(self, size).is_ok(),
            Strategy::SwapMove | Strategy::SwapOffset => {
                swap_move::max_image_size(self).is_ok_and(|max| size <= max)
            }
            Strategy::OverwriteOnly => size <= self.trailer.status_off(),
            _ => false,
        }
    }

    /// Where the image in the secondary slot starts.
    fn secondary_base(&self, swap_type: SwapType) -> Result<usize> {
        match (self.config.strategy, swap_type) {
            (Strategy::SwapOffset, SwapType::Test | SwapType::Perm) => swap_move::sector_size(self),
            _ => Ok(0),
        }
    }

    /// Check the image that would be swapped in.
    pub fn validate_candidate(&self, sec_off: usize, swap_type: SwapType) -> Result<bool> {
        let view = RefCell::new(self.view(Area::Secondary, sec_off));
        let image = match Image::from_flash(&view) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("Secondary slot: {}", e);
                return Ok(false);
            }
        };
        let hdr = image.header;
        log::info!("Secondary slot: version={}", hdr.version());
        if !self.fits(image.full_image_size()) {
            log::warn!("Image of {} bytes does not fit", image.full_image_size());
            return Ok(false);
        }
        if self.config.downgrade_prevention && swap_type != SwapType::Revert {
            if let Ok(primary) = ImageHeader::from_flash(&mut *self.primary.borrow_mut()) {
                if hdr.version() < primary.version() {
                    log::warn!(
                        "Refusing downgrade from {} to {}",
                        primary.version(),
                        hdr.version()
                    );
                    return Ok(false);
                }
            }
        }

        let mut keys = KeyEnvelope::default();
        let decrypt = if hdr.is_encrypted() {
            let (Some(cipher), Some(unwrap), Some(_)) =
                (self.crypto.cipher, self.crypto.unwrap, self.config.encryption)
            else {
                log::warn!("Encrypted image, but no decryption available");
                return Ok(false);
            };
            if enc::load_key(&image, unwrap, Slot::Secondary.index(), &mut keys).is_err() {
                log::warn!("Unable to recover image key");
                return Ok(false);
            }
            keys.key(Slot::Secondary.index()).map(|key| (cipher, key))
        } else {
            None
        };
        Ok(image.verify(self.crypto.verifier, decrypt).is_success())
    }

    /// Recover the key of the image seen through `view`, when it has one.
    pub fn load_key(
        &self,
        view: SwapView<'s, F>,
        slot: usize,
        keys: &mut KeyEnvelope,
    ) -> Result<()> {
        if self.config.encryption.is_none() {
            return Ok(());
        }
        let view = RefCell::new(view);
        let Ok(image) = Image::from_flash(&view) else {
            return Ok(());
        };
        if !image.header.is_encrypted() {
            return Ok(());
        }
        let unwrap = self
            .crypto
            .unwrap
            .ok_or(Error::Config("encrypted image needs a key unwrapper"))?;
        enc::load_key(&image, unwrap, slot, keys)
    }

    /// Decide what to do from the trailers, checking the image that would
    /// be swapped in.  A candidate that fails is scrambled.
    fn validated_swap_type(&self, primary: &SwapState) -> Result<SwapType> {
        let secondary = self.secondary_trailer.read_swap_state(&mut *self.secondary.borrow_mut())?;
        let swap_type = swap_type_from_tables(primary, &secondary);
        if !swap_type.is_upgrade() {
            return Ok(SwapType::None);
        }
        log::info!("Image {}: swap type {:?}", self.image_num, swap_type);
        let sec_off = self.secondary_base(swap_type)?;
        if self.validate_candidate(sec_off, swap_type)? {
            return Ok(swap_type);
        }
        log::warn!("Image in the secondary slot is not valid!");
        let trailer = self.secondary_trailer;
        let mut flash = self.secondary.borrow_mut();
        sectors::scramble_slot(&mut *flash, &trailer, sec_off, self.config.scramble)?;
        Ok(SwapType::Fail)
    }

    fn source_swap_info(&self, source: StatusSource) -> Result<(SwapType, u8)> {
        let area = match source {
            StatusSource::None => return Ok((SwapType::None, 0)),
            StatusSource::Primary => Area::Primary,
            StatusSource::Scratch => Area::Scratch,
        };
        let trailer = self.area_trailer(area)?;
        trailer.read_swap_info(&mut *self.area(area)?.borrow_mut())
    }

    /// Swap type recorded by a swap that was started, but has no completed
    /// steps.
    fn journaled_swap_type(&self, source: StatusSource) -> Result<Option<SwapType>> {
        let (swap_type, image_num) = self.source_swap_info(source)?;
        if swap_type.is_upgrade() && image_num == self.image_num {
            return Ok(Some(swap_type));
        }
        self.recorded_revert()
    }

    /// A move or offset revert that was cut off while rebuilding the primary
    /// trailer.  Applications only request tests and permanent swaps, so a
    /// revert in the secondary trailer was put there by the boot loader.
    fn recorded_revert(&self) -> Result<Option<SwapType>> {
        if !matches!(self.config.strategy, Strategy::SwapMove | Strategy::SwapOffset) {
            return Ok(None);
        }
        let state = self
            .secondary_trailer
            .read_swap_state(&mut *self.secondary.borrow_mut())?;
        let recorded = state.magic == MagicState::Good
            && state.swap_type == SwapType::Revert
            && state.image_num == self.image_num;
        Ok(recorded.then_some(SwapType::Revert))
    }

    fn read_position(&self, bs: &mut BootStatus) -> Result<()> {
        let strategy = self.config.strategy;
        let position = match bs.source {
            StatusSource::None => None,
            StatusSource::Primary => {
                let mut flash = self.primary.borrow_mut();
                status::read_position(&self.trailer, &mut *flash, strategy)?
            }
            StatusSource::Scratch => {
                bs.use_scratch = true;
                let trailer = self.area_trailer(Area::Scratch)?;
                let mut flash = self.area(Area::Scratch)?.borrow_mut();
                status::read_position(&trailer, &mut *flash, strategy)?
            }
        };
        if let Some((op, idx, state)) = position {
            bs.op = op;
            bs.idx = idx;
            bs.state = state;
        }
        Ok(())
    }

    fn read_journal(&self, bs: &mut BootStatus) -> Result<()> {
        let area = match bs.source {
            StatusSource::Scratch => Area::Scratch,
            _ => Area::Primary,
        };
        let trailer = self.area_trailer(area)?;
        let mut flash = self.area(area)?.borrow_mut();
        bs.swap_size = trailer.read_swap_size(&mut *flash)?;
        if let Some(cfg) = &self.config.encryption {
            for slot in 0..2 {
                let unwrap = self.crypto.unwrap;
                enc::read_enc_key(&trailer, &mut *flash, slot, &mut bs.keys, cfg, unwrap)?;
            }
        }
        Ok(())
    }

    /// Read both image headers through their views, giving the number of
    /// bytes that have to be swapped.
    fn read_headers(&mut self, views: [SwapView<'s, F>; 2]) -> u32 {
        let [op, os] = views;
        let op = image_extent(op);
        let os = image_extent(os);
        self.headers = [op.map(|e| e.0), os.map(|e| e.0)];
        op.map_or(0, |e| e.1).max(os.map_or(0, |e| e.1)) as u32
    }

    fn resume_views(&self, bs: &BootStatus) -> Result<[SwapView<'s, F>; 2]> {
        match self.config.strategy {
            Strategy::SwapScratch => swap_scratch::views(self, bs),
            Strategy::SwapMove => swap_move::views(self, bs),
            Strategy::SwapOffset => swap_offset::views(self, bs),
            _ => Err(Error::Config("strategy does not swap")),
        }
    }

    /// Finish or start a swap of this image, as the trailers call for.
    pub fn upgrade(&mut self) -> Result<SwapType> {
        let strategy = self.config.strategy;
        self.check_layout()?;

        let primary_state = self.trailer.read_swap_state(&mut *self.primary.borrow_mut())?;
        let scratch_state = match (self.scratch, &self.scratch_trailer) {
            (Some(area), Some(trailer)) => Some(trailer.read_swap_state(&mut *area.borrow_mut())?),
            _ => None,
        };
        let source = status::status_source(&primary_state, scratch_state.as_ref(), self.image_num);

        let mut bs = BootStatus::reset(strategy);
        bs.source = source;
        self.read_position(&mut bs)?;

        if bs.is_reset(strategy) {
            let swap_type = match self.journaled_swap_type(source)? {
                Some(swap_type) => {
                    log::info!("Image {}: restarting {:?} swap", self.image_num, swap_type);
                    swap_type
                }
                None => self.validated_swap_type(&primary_state)?,
            };
            if !swap_type.is_upgrade() {
                return Ok(swap_type);
            }
            bs.swap_type = swap_type;
            let sec_off = self.secondary_base(swap_type)?;
            let size = self.read_headers([
                self.view(Area::Primary, 0),
                self.view(Area::Secondary, sec_off),
            ]);
            if size == 0 {
                return Err(Error::InvalidImage);
            }
            bs.swap_size = size;
            let (primary, secondary) = (Slot::Primary.index(), Slot::Secondary.index());
            self.load_key(self.view(Area::Primary, 0), primary, &mut bs.keys)?;
            self.load_key(self.view(Area::Secondary, sec_off), secondary, &mut bs.keys)?;
        } else {
            let (swap_type, image_num) = self.source_swap_info(source)?;
            if swap_type == SwapType::None || image_num != self.image_num {
                log::error!(
                    "Journal of image {} holds {:?} for image {}",
                    self.image_num,
                    swap_type,
                    image_num
                );
                return Err(Error::SwapTypeMismatch);
            }
            bs.swap_type = swap_type;
            self.read_journal(&mut bs)?;
            let computed = self.read_headers(self.resume_views(&bs)?);
            if computed != bs.swap_size {
                log::error!(
                    "Swap size {} from the journal, {} from the images",
                    bs.swap_size,
                    computed
                );
                return Err(Error::SwapSizeMismatch { journaled: bs.swap_size, computed });
            }
            log::info!(
                "Image {}: resuming {:?} swap at idx={} state={}",
                self.image_num,
                bs.swap_type,
                bs.idx,
                bs.state
            );
        }

        // A journal already started in the primary needs no new header.
        let fresh = !(source == StatusSource::Primary && primary_state.magic == MagicState::Good);
        match strategy {
            Strategy::SwapScratch => swap_scratch::run(self, &mut bs)?,
            Strategy::SwapMove => swap_move::run(self, &mut bs, fresh)?,
            Strategy::SwapOffset => swap_offset::run(self, &mut bs, fresh)?,
            _ => return Err(Error::Config("strategy does not swap")),
        }
        self.finalize(&bs)?;
        log::info!("Image {}: {:?} swap complete", self.image_num, bs.swap_type);
        Ok(bs.swap_type)
    }

    /// Mark the primary trailer done.  Only flags that are still unset are
    /// written, so this may be repeated.
    fn finalize(&self, bs: &BootStatus) -> Result<()> {
        let mut flash = self.primary.borrow_mut();
        let state = self.trailer.read_swap_state(&mut *flash)?;
        if matches!(bs.swap_type, SwapType::Perm | SwapType::Revert)
            && state.image_ok == BootFlag::Unset
        {
            self.trailer.write_image_ok(&mut *flash)?;
        }
        if state.copy_done == BootFlag::Unset {
            self.trailer.write_copy_done(&mut *flash)?;
        }
        Ok(())
    }
}

struct SwapTable {
    magic_primary: MagicState,
    magic_secondary: MagicState,
    image_ok_primary: BootFlag,
    image_ok_secondary: BootFlag,
    copy_done_primary: BootFlag,
    swap_type: SwapType,
}

/// Which swap to perform, given the trailers of both slots.
///
/// ```text
///  primary magic | secondary magic | primary ok | secondary ok | copy done | swap
/// ---------------+-----------------+------------+--------------+-----------+-------
///  any           | good            | any        | unset        | any       | test
///  any           | good            | any        | set          | any       | perm
///  good          | unset           | unset      | any          | set       | revert
/// ```
const SWAP_TABLES: [SwapTable; 3] = [
    SwapTable {
        magic_primary: MagicState::Any,
        magic_secondary: MagicState::Good,
        image_ok_primary: BootFlag::Any,
        image_ok_secondary: BootFlag::Unset,
        copy_done_primary: BootFlag::Any,
        swap_type: SwapType::Test,
    },
    SwapTable {
        magic_primary: MagicState::Any,
        magic_secondary: MagicState::Good,
        image_ok_primary: BootFlag::Any,
        image_ok_secondary: BootFlag::Set,
        copy_done_primary: BootFlag::Any,
        swap_type: SwapType::Perm,
    },
    SwapTable {
        magic_primary: MagicState::Good,
        magic_secondary: MagicState::Unset,
        image_ok_primary: BootFlag::Unset,
        image_ok_secondary: BootFlag::Any,
        copy_done_primary: BootFlag::Set,
        swap_type: SwapType::Revert,
    },
];

pub(crate) fn swap_type_from_tables(primary: &SwapState, secondary: &SwapState) -> SwapType {
    for table in &SWAP_TABLES {
        if magic_compatible_check(table.magic_primary, primary.magic)
            && magic_compatible_check(table.magic_secondary, secondary.magic)
            && flag_compatible_check(table.image_ok_primary, primary.image_ok)
            && flag_compatible_check(table.image_ok_secondary, secondary.image_ok)
            && flag_compatible_check(table.copy_done_primary, primary.copy_done)
        {
            return table.swap_type;
        }
    }
    SwapType::None
}
