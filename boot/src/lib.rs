//! This is a basic bootloader built for embedded rust.
//!
//! The core of it is the image swap: promoting a staged image in the
//! secondary slot into the primary slot in a way that survives losing power
//! at any point.  Progress is kept in a trailer at the end of the slots (or
//! in the scratch area), and every boot reconstructs where the previous one
//! got to from flash alone.
//!
//! Several strategies are supported, chosen at runtime through
//! [`BootConfig`]: swap using a scratch area, swap by moving the primary up
//! one sector, swap with the upgrade image stored one sector in, plain
//! overwrite, direct execute-in-place from either slot, and loading into RAM.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

mod config;
mod direct;
mod enc;
mod fih;
mod image;
mod loader;
mod overwrite;
mod sectors;
mod status;
mod swap_move;
mod swap_offset;
mod swap_scratch;
mod trailer;
mod view;

pub use config::{
    BootConfig, EncryptionConfig, ScrambleMode, Strategy, BOOT_MAX_ALIGN, MAX_IMAGES,
    MAX_IMG_SECTORS,
};
pub use enc::{EncKey, ImageCipher, KeyEnvelope, KeyUnwrap};
pub use fih::{fih_memequal, FihRet, HashOnly, SignatureVerifier};
pub use image::{Image, ImageHeader, ImageVersion};
pub use loader::{BootLoader, BootResponse, Crypto, FlashMap, Slot, SlotPair};
pub use sectors::SectorTable;
pub use status::{BootStatus, StatusOp, StatusSource};
pub use trailer::{
    magic_compatible_check, set_confirmed, set_pending, BootFlag, MagicState, SwapState,
    SwapType, Trailer,
};

pub type Result<T> = core::result::Result<T, Error>;

// Use the error kind to avoid this depending on the particular flash.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("flash: {0}")]
    Flash(#[from] storage::Error),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("slot has more sectors than configured")]
    TooManySectors,
    #[error("slots have incompatible sector layouts")]
    IncompatibleSlots,
    #[error("image does not fit the slot")]
    ImageTooLarge,
    #[error("swap status is corrupt")]
    BadStatus,
    #[error("journaled swap size {journaled} does not match images ({computed})")]
    SwapSizeMismatch { journaled: u32, computed: u32 },
    #[error("journaled swap type does not match this image")]
    SwapTypeMismatch,
    #[error("trailer magic is not recognized")]
    BadMagic,
    #[error("image is malformed")]
    InvalidImage,
    #[error("image failed verification")]
    VerificationFailed,
    #[error("upgrade requested but cannot be performed")]
    CannotUpgrade,
}

/// Some kinds of flash can be mapped into memory.  This is needed for XIP devices.
pub trait MappedFlash {
    /// Return the base address of this flash partition, as mapped into memory.
    fn get_base(&self) -> usize;
}
