//! Image trailer
//!
//! The trailer lives at the very end of a slot, or of the scratch area.  It
//! records whether an upgrade has been requested, how far it got, and whether
//! the resulting image has been confirmed.  Laid out from the end of the
//! area downward, each field rounded up to the write alignment:
//!
//! ```text
//! +--------------------------------+ <- end of area
//! | magic (16 bytes, at the end)   |
//! | image ok                       |
//! | copy done                      |
//! | swap info                      |  swap and overwrite strategies
//! | swap size (u32, LE)            |  swap strategies
//! | key for slot 0                 |  with encryption
//! | key for slot 1                 |  with encryption
//! | status entries                 |  swap strategies
//! +--------------------------------+ <- start of trailer
//! ```
//!
//! The magic is always written last.  A trailer without a good magic says
//! nothing about the slot, whatever the other fields happen to hold.

use storage::Flash;

use crate::{
    config::{Strategy, BOOT_MAX_ALIGN},
    sectors, Error, Result,
};

pub const BOOT_MAGIC_SZ: usize = 16;

/// Magic written with alignments of 8 or less.
const BOOT_IMG_MAGIC: [u8; BOOT_MAGIC_SZ] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79, 0x80,
];

/// Larger alignments prefix this with the alignment, as a LE u16.
const BOOT_IMG_MAGIC_TAGGED: [u8; BOOT_MAGIC_SZ - 2] = [
    0x2d, 0xe1, 0x5d, 0x29, 0x41, 0x0b, 0x8d, 0x77, 0x67, 0x9c, 0x11, 0x0f, 0x1f, 0x8a,
];

pub const BOOT_FLAG_SET: u8 = 0x01;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum MagicState {
    Good = 1,
    Bad = 2,
    Unset = 3,
    /// Only meaningful in a state table: matches anything.
    Any = 4,
    /// Only meaningful in a state table: anything but good.
    NotGood = 5,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum BootFlag {
    Set = 1,
    Bad = 2,
    Unset = 3,
    Any = 4,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum SwapType {
    /// Nothing to do.
    None = 1,
    /// Swap to the secondary image, reverting on the next boot unless
    /// confirmed.
    Test = 2,
    /// Swap to the secondary image permanently.
    Perm = 3,
    /// Swap back to the image that was replaced by a test.
    Revert = 4,
    /// The secondary image failed to validate.
    Fail = 5,
    /// Swapping encountered an unrecoverable error.
    Panic = 0xff,
}

impl SwapType {
    fn from_raw(val: u8) -> Option<SwapType> {
        match val {
            1 => Some(SwapType::None),
            2 => Some(SwapType::Test),
            3 => Some(SwapType::Perm),
            4 => Some(SwapType::Revert),
            _ => None,
        }
    }

    /// Does this type move images between slots?
    pub fn is_upgrade(&self) -> bool {
        matches!(self, SwapType::Test | SwapType::Perm | SwapType::Revert)
    }
}

/// The decoded state of one trailer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SwapState {
    pub magic: MagicState,
    pub swap_type: SwapType,
    pub copy_done: BootFlag,
    pub image_ok: BootFlag,
    pub image_num: u8,
}

/// Match a state table entry against a decoded magic.
pub fn magic_compatible_check(tbl_val: MagicState, val: MagicState) -> bool {
    match tbl_val {
        MagicState::Any => true,
        MagicState::NotGood => val != MagicState::Good,
        _ => tbl_val == val,
    }
}

/// Match a state table entry against a decoded flag.
pub fn flag_compatible_check(tbl_val: BootFlag, val: BootFlag) -> bool {
    tbl_val == BootFlag::Any || tbl_val == val
}

/// The magic to write for a given alignment.
pub fn magic_for_align(align: usize) -> [u8; BOOT_MAGIC_SZ] {
    if align <= 8 {
        return BOOT_IMG_MAGIC;
    }
    let mut magic = [0u8; BOOT_MAGIC_SZ];
    magic[..2].copy_from_slice(&(align as u16).to_le_bytes());
    magic[2..].copy_from_slice(&BOOT_IMG_MAGIC_TAGGED);
    magic
}

/// Decode a magic.  Both encodings are accepted regardless of the alignment
/// of the area, so that trailers stay readable across alignment changes.
pub fn decode_magic(raw: &[u8; BOOT_MAGIC_SZ], erased_val: u8) -> MagicState {
    if raw.iter().all(|b| *b == erased_val) {
        return MagicState::Unset;
    }
    if *raw == BOOT_IMG_MAGIC {
        return MagicState::Good;
    }
    let align = u16::from_le_bytes([raw[0], raw[1]]) as usize;
    if raw[2..] == BOOT_IMG_MAGIC_TAGGED
        && align.is_power_of_two()
        && (16..=BOOT_MAX_ALIGN).contains(&align)
    {
        return MagicState::Good;
    }
    MagicState::Bad
}

pub fn decode_flag(raw: u8, erased_val: u8) -> BootFlag {
    if raw == erased_val {
        BootFlag::Unset
    } else if raw == BOOT_FLAG_SET {
        BootFlag::Set
    } else {
        BootFlag::Bad
    }
}

/// Unpack a swap info byte into its swap type and image number.
pub fn decode_swap_info(raw: u8, erased_val: u8) -> (SwapType, u8) {
    if raw == erased_val {
        return (SwapType::None, 0);
    }
    match SwapType::from_raw(raw & 0x0f) {
        Some(swap_type) => (swap_type, raw >> 4),
        None => (SwapType::None, 0),
    }
}

pub fn encode_swap_info(swap_type: SwapType, image_num: u8) -> u8 {
    (image_num << 4) | (swap_type as u8 & 0x0f)
}

pub const fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Trailer geometry for one area.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Trailer {
    capacity: usize,
    align: usize,
    swap_info: bool,
    swap_size: bool,
    /// Bytes of key material per slot, zero without encryption.
    enc_block: usize,
    /// Number of status entries.
    status_entries: usize,
}

impl Trailer {
    /// Full trailer used by the swap strategies.
    pub const fn swap(
        capacity: usize,
        align: usize,
        status_entries: usize,
        enc_block: usize,
    ) -> Trailer {
        Trailer {
            capacity,
            align,
            swap_info: true,
            swap_size: true,
            enc_block,
            status_entries,
        }
    }

    pub const fn overwrite(capacity: usize, align: usize) -> Trailer {
        Trailer {
            capacity,
            align,
            swap_info: true,
            swap_size: false,
            enc_block: 0,
            status_entries: 0,
        }
    }

    /// Direct-XIP and RAM-load only track confirmation.
    pub const fn direct(capacity: usize, align: usize) -> Trailer {
        Trailer {
            capacity,
            align,
            swap_info: false,
            swap_size: false,
            enc_block: 0,
            status_entries: 0,
        }
    }

    /// The trailer of a slot under a given strategy.
    pub fn for_slot(
        strategy: Strategy,
        capacity: usize,
        align: usize,
        status_entries: usize,
        enc_block: usize,
    ) -> Trailer {
        match strategy {
            Strategy::SwapScratch | Strategy::SwapMove | Strategy::SwapOffset => {
                Trailer::swap(capacity, align, status_entries, enc_block)
            }
            Strategy::OverwriteOnly => Trailer::overwrite(capacity, align),
            Strategy::DirectXip { .. } | Strategy::RamLoad { .. } => {
                Trailer::direct(capacity, align)
            }
        }
    }

    pub const fn align(&self) -> usize {
        self.align
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub const fn has_swap_info(&self) -> bool {
        self.swap_info
    }

    pub const fn enc_block(&self) -> usize {
        self.enc_block
    }

    pub const fn status_entries(&self) -> usize {
        self.status_entries
    }

    /// Offset of the 16 magic bytes.
    pub const fn magic_off(&self) -> usize {
        self.capacity - BOOT_MAGIC_SZ
    }

    /// Start of the write unit(s) holding the magic.
    const fn magic_write_off(&self) -> usize {
        self.capacity - align_up(BOOT_MAGIC_SZ, self.align)
    }

    pub const fn image_ok_off(&self) -> usize {
        self.magic_write_off() - self.align
    }

    pub const fn copy_done_off(&self) -> usize {
        self.image_ok_off() - self.align
    }

    pub const fn swap_info_off(&self) -> usize {
        self.copy_done_off() - self.align
    }

    pub const fn swap_size_off(&self) -> usize {
        self.swap_info_off() - align_up(4, self.align)
    }

    /// Key block for a slot.  Slot 0 sits above slot 1.
    pub const fn enc_key_off(&self, slot: usize) -> usize {
        self.swap_size_off() - (slot + 1) * align_up(self.enc_block, self.align)
    }

    /// Lowest offset used by anything but the status entries.
    pub const fn info_off(&self) -> usize {
        let mut off = self.copy_done_off();
        if self.swap_info {
            off -= self.align;
        }
        if self.swap_size {
            off -= align_up(4, self.align);
        }
        if self.enc_block > 0 {
            off -= 2 * align_up(self.enc_block, self.align);
        }
        off
    }

    pub const fn status_sz(&self) -> usize {
        self.status_entries * self.align
    }

    pub const fn status_off(&self) -> usize {
        self.info_off() - self.status_sz()
    }

    pub const fn status_entry_off(&self, index: usize) -> usize {
        self.status_off() + index * self.align
    }

    /// Size of the trailer fields without the status entries.
    pub const fn info_sz(&self) -> usize {
        self.capacity - self.info_off()
    }

    pub const fn trailer_sz(&self) -> usize {
        self.capacity - self.status_off()
    }

    /// Read single byte field, which occupies a whole write unit.
    fn read_byte<F: Flash>(&self, flash: &mut F, off: usize) -> Result<u8> {
        let mut buf = [0u8; BOOT_MAX_ALIGN];
        let len = self.align.max(flash.read_size());
        flash.read(off, &mut buf[..len])?;
        Ok(buf[0])
    }

    pub fn read_magic<F: Flash>(&self, flash: &mut F) -> Result<MagicState> {
        let mut magic = [0u8; BOOT_MAGIC_SZ];
        flash.read(self.magic_off(), &mut magic)?;
        Ok(decode_magic(&magic, flash.erased_val()))
    }

    pub fn read_swap_state<F: Flash>(&self, flash: &mut F) -> Result<SwapState> {
        let erased = flash.erased_val();
        let magic = self.read_magic(flash)?;
        let image_ok = decode_flag(self.read_byte(flash, self.image_ok_off())?, erased);
        let copy_done = decode_flag(self.read_byte(flash, self.copy_done_off())?, erased);
        let (swap_type, image_num) = if self.swap_info {
            decode_swap_info(self.read_byte(flash, self.swap_info_off())?, erased)
        } else {
            (SwapType::None, 0)
        };
        Ok(SwapState { magic, swap_type, copy_done, image_ok, image_num })
    }

    pub fn read_swap_info<F: Flash>(&self, flash: &mut F) -> Result<(SwapType, u8)> {
        let raw = self.read_byte(flash, self.swap_info_off())?;
        Ok(decode_swap_info(raw, flash.erased_val()))
    }

    pub fn read_swap_size<F: Flash>(&self, flash: &mut F) -> Result<u32> {
        let mut buf = [0u8; 4];
        flash.read(self.swap_size_off(), &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a trailer field, padding it out to the write alignment with
    /// the erased value.
    pub fn write_trailer<F: Flash>(&self, flash: &mut F, off: usize, data: &[u8]) -> Result<()> {
        let full = data.len() / self.align * self.align;
        if full > 0 {
            flash.write(off, &data[..full])?;
        }
        let rest = &data[full..];
        if !rest.is_empty() {
            let mut buf = [flash.erased_val(); BOOT_MAX_ALIGN];
            buf[..rest.len()].copy_from_slice(rest);
            flash.write(off + full, &buf[..self.align])?;
        }
        Ok(())
    }

    pub fn write_trailer_flag<F: Flash>(
        &self,
        flash: &mut F,
        off: usize,
        flag_val: u8,
    ) -> Result<()> {
        self.write_trailer(flash, off, &[flag_val])
    }

    pub fn write_magic<F: Flash>(&self, flash: &mut F) -> Result<()> {
        let len = align_up(BOOT_MAGIC_SZ, self.align);
        let mut buf = [flash.erased_val(); BOOT_MAX_ALIGN];
        buf[len - BOOT_MAGIC_SZ..len].copy_from_slice(&magic_for_align(self.align));
        flash.write(self.magic_write_off(), &buf[..len])?;
        Ok(())
    }

    pub fn write_image_ok<F: Flash>(&self, flash: &mut F) -> Result<()> {
        self.write_trailer_flag(flash, self.image_ok_off(), BOOT_FLAG_SET)
    }

    pub fn write_copy_done<F: Flash>(&self, flash: &mut F) -> Result<()> {
        self.write_trailer_flag(flash, self.copy_done_off(), BOOT_FLAG_SET)
    }

    pub fn write_swap_info<F: Flash>(
        &self,
        flash: &mut F,
        swap_type: SwapType,
        image_num: u8,
    ) -> Result<()> {
        let info = encode_swap_info(swap_type, image_num);
        self.write_trailer_flag(flash, self.swap_info_off(), info)
    }

    pub fn write_swap_size<F: Flash>(&self, flash: &mut F, swap_size: u32) -> Result<()> {
        self.write_trailer(flash, self.swap_size_off(), &swap_size.to_le_bytes())
    }

    /// Where scrambling the trailer begins.  Devices that need an erase lose
    /// every sector the trailer touches.
    pub fn scramble_offset<F: Flash>(&self, flash: &F) -> Result<usize> {
        if flash.erase_required() {
            sectors::sector_start_of(flash, self.status_off())
        } else {
            Ok(self.status_off() / self.align * self.align)
        }
    }

    /// Destroy the trailer, magic first.
    pub fn scramble<F: Flash>(&self, flash: &mut F) -> Result<()> {
        let off = self.scramble_offset(flash)?;
        sectors::scramble_region(flash, off, self.capacity - off, true)
    }
}

/// Request an upgrade to the image in a secondary slot.  With `permanent`
/// the image will not be reverted.
pub fn set_pending<F: Flash>(
    trailer: &Trailer,
    flash: &mut F,
    image_num: u8,
    permanent: bool,
) -> Result<()> {
    let state = trailer.read_swap_state(flash)?;
    match state.magic {
        // Already pending.
        MagicState::Good => Ok(()),
        MagicState::Unset => {
            if permanent {
                trailer.write_image_ok(flash)?;
            }
            if trailer.has_swap_info() {
                let swap_type = if permanent { SwapType::Perm } else { SwapType::Test };
                trailer.write_swap_info(flash, swap_type, image_num)?;
            }
            trailer.write_magic(flash)
        }
        _ => {
            // A corrupt trailer can't be written over.
            trailer.scramble(flash)?;
            Err(Error::BadMagic)
        }
    }
}

/// Mark the image in a primary slot as good, preventing a revert.
pub fn set_confirmed<F: Flash>(trailer: &Trailer, flash: &mut F) -> Result<()> {
    let state = trailer.read_swap_state(flash)?;
    match state.magic {
        MagicState::Good => (),
        // Never swapped into place, nothing to confirm.
        MagicState::Unset => return Ok(()),
        _ => return Err(Error::BadMagic),
    }
    if state.image_ok != BootFlag::Unset {
        return Ok(());
    }
    trailer.write_image_ok(flash)
}

const ALIGNMENTS: [usize; 6] = [1, 2, 4, 8, 16, 32];

// Check that fields never overlap, and that the trailer is exactly the sum
// of its parts, for each supported alignment.
const _: () = {
    let mut i = 0;
    while i < ALIGNMENTS.len() {
        let a = ALIGNMENTS[i];
        let entries = crate::config::MAX_IMG_SECTORS * 3;
        let t = Trailer::swap(1 << 20, a, entries, 32);
        assert!(t.magic_off() >= t.magic_write_off());
        assert!(t.image_ok_off() + a <= t.magic_write_off());
        assert!(t.copy_done_off() + a <= t.image_ok_off());
        assert!(t.swap_info_off() + a <= t.copy_done_off());
        assert!(t.swap_size_off() + 4 <= t.swap_info_off());
        assert!(t.enc_key_off(0) + 32 <= t.swap_size_off());
        assert!(t.enc_key_off(1) + 32 <= t.enc_key_off(0));
        assert!(t.info_off() == t.enc_key_off(1));
        assert!(t.status_off() % a == 0);
        let packed = align_up(BOOT_MAGIC_SZ, a)
            + 3 * a
            + align_up(4, a)
            + 2 * align_up(32, a)
            + entries * a;
        assert!(t.trailer_sz() == packed);
        i += 1;
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatible_magic() {
        use MagicState::*;
        assert!(magic_compatible_check(Any, Bad));
        assert!(magic_compatible_check(NotGood, Unset));
        assert!(magic_compatible_check(NotGood, Bad));
        assert!(!magic_compatible_check(NotGood, Good));
        assert!(magic_compatible_check(Good, Good));
        assert!(!magic_compatible_check(Unset, Good));
    }

    #[test]
    fn magic_encodings() {
        assert_eq!(decode_magic(&magic_for_align(8), 0xff), MagicState::Good);
        assert_eq!(decode_magic(&magic_for_align(16), 0xff), MagicState::Good);
        assert_eq!(decode_magic(&magic_for_align(32), 0x00), MagicState::Good);
        assert_eq!(magic_for_align(4), BOOT_IMG_MAGIC);
        assert_eq!(magic_for_align(32)[..2], [32, 0]);

        let mut odd = magic_for_align(32);
        odd[0] = 12;
        assert_eq!(decode_magic(&odd, 0xff), MagicState::Bad);
        assert_eq!(decode_magic(&[0xff; 16], 0xff), MagicState::Unset);
        assert_eq!(decode_magic(&[0x55; 16], 0xff), MagicState::Bad);
    }

    #[test]
    fn swap_info_packing() {
        assert_eq!(encode_swap_info(SwapType::Revert, 2), 0x24);
        assert_eq!(decode_swap_info(0x24, 0xff), (SwapType::Revert, 2));
        assert_eq!(decode_swap_info(0xff, 0xff), (SwapType::None, 0));
        assert_eq!(decode_swap_info(0x15, 0xff), (SwapType::None, 0));
        assert_eq!(decode_flag(0x01, 0xff), BootFlag::Set);
        assert_eq!(decode_flag(0x00, 0xff), BootFlag::Bad);
        assert_eq!(decode_flag(0x00, 0x00), BootFlag::Unset);
    }

    #[test]
    fn field_sets() {
        let swap = Trailer::swap(4096, 8, 0, 0);
        assert_eq!(swap.magic_off(), 4080);
        assert_eq!(swap.image_ok_off(), 4072);
        assert_eq!(swap.swap_size_off(), 4048);
        assert_eq!(swap.trailer_sz(), 48);

        let over = Trailer::overwrite(4096, 8);
        assert_eq!(over.trailer_sz(), 40);
        let direct = Trailer::direct(4096, 32);
        assert_eq!(direct.trailer_sz(), 96);
        assert_eq!(direct.magic_off(), 4080);
    }
}
