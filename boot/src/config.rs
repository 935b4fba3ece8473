//! Bootloader configuration
//!
//! Everything that a C bootloader would select with the preprocessor is
//! gathered here and chosen once at startup.  The types are serde friendly so
//! a board can keep its layout next to its other configuration.

use serde::{Deserialize, Serialize};

use crate::{
    enc::{ENC_TLV_LEN_SZ, MAX_ENC_TLV_SIZE},
    Error, Result,
};

/// Upper bound on the sectors in any one slot.  Sector tables are sized by
/// this.
pub const MAX_IMG_SECTORS: usize = 128;

/// Upper bound on the number of independently updated images.
pub const MAX_IMAGES: usize = 4;

/// Largest write alignment supported by the trailer layout.
pub const BOOT_MAX_ALIGN: usize = 32;

/// How an upgrade is carried out.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Strategy {
    /// Swap the slots a chunk at a time through a scratch area.
    #[default]
    SwapScratch,
    /// Move the primary image up one sector, then swap sector by sector.
    SwapMove,
    /// The upgrade image is stored one sector into the secondary slot, so
    /// the slots can be swapped without moving anything first.
    SwapOffset,
    /// Copy the secondary over the primary.  No revert is possible.
    OverwriteOnly,
    /// Run in place from whichever slot holds the newest image.
    DirectXip { revert: bool },
    /// Copy the newest image into RAM and run it there.
    RamLoad { revert: bool },
}

impl Strategy {
    /// Does this strategy physically exchange the contents of the slots?
    pub fn swaps(&self) -> bool {
        matches!(self, Strategy::SwapScratch | Strategy::SwapMove | Strategy::SwapOffset)
    }

    /// Number of journal states recorded for each chunk of a swap.
    pub const fn state_count(&self) -> usize {
        match self {
            Strategy::SwapScratch => 3,
            // One move state, then two swap states.
            Strategy::SwapMove => 3,
            Strategy::SwapOffset => 2,
            _ => 0,
        }
    }

    /// The two slots are interchangeable, and no layout needs to be read.
    pub fn slots_equivalent(&self) -> bool {
        matches!(self, Strategy::DirectXip { .. } | Strategy::RamLoad { .. })
    }

    pub fn uses_scratch(&self) -> bool {
        matches!(self, Strategy::SwapScratch)
    }
}

/// What to destroy when a slot has to be made unbootable.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ScrambleMode {
    /// Only the image header magic.
    Magic,
    /// The image header.
    #[default]
    Header,
    /// The whole slot.
    Slot,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Symmetric key size in bytes, 16 or 32.
    pub key_size: usize,
    /// Keep the wrapped key TLV in the trailer rather than the plain key.
    #[serde(default)]
    pub save_enctlv: bool,
    /// Size of the wrapped key TLV payload, used when `save_enctlv` is set.
    #[serde(default = "default_enc_tlv_size")]
    pub enc_tlv_size: usize,
}

fn default_enc_tlv_size() -> usize {
    // AES key wrap of a 128 bit key.
    24
}

impl EncryptionConfig {
    /// Bytes held in the trailer for each slot.  A saved TLV is preceded by
    /// its length.
    pub fn block_size(&self) -> usize {
        if self.save_enctlv {
            ENC_TLV_LEN_SZ + self.enc_tlv_size
        } else {
            self.key_size
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub strategy: Strategy,
    /// Number of images managed.
    pub image_number: usize,
    /// Most sectors any slot may have.  Sizes the status area.
    pub max_img_sectors: usize,
    pub encryption: Option<EncryptionConfig>,
    pub scramble: ScrambleMode,
    /// Check the primary image before booting it.
    pub validate_primary_slot: bool,
    /// Refuse upgrades that do not increase the version.
    pub downgrade_prevention: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            strategy: Strategy::default(),
            image_number: 1,
            max_img_sectors: MAX_IMG_SECTORS,
            encryption: None,
            scramble: ScrambleMode::default(),
            validate_primary_slot: true,
            downgrade_prevention: false,
        }
    }
}

impl BootConfig {
    pub fn validate(&self) -> Result<()> {
        if self.image_number == 0 || self.image_number > MAX_IMAGES {
            return Err(Error::Config("image_number out of range"));
        }
        if self.max_img_sectors == 0 || self.max_img_sectors > MAX_IMG_SECTORS {
            return Err(Error::Config("max_img_sectors out of range"));
        }
        if let Some(enc) = &self.encryption {
            if enc.key_size != 16 && enc.key_size != 32 {
                return Err(Error::Config("key_size must be 16 or 32"));
            }
            if enc.save_enctlv && enc.enc_tlv_size == 0 {
                return Err(Error::Config("enc_tlv_size must be set with save_enctlv"));
            }
            if enc.block_size() > MAX_ENC_TLV_SIZE {
                return Err(Error::Config("enc_tlv_size too large"));
            }
            if let Strategy::DirectXip { .. } = self.strategy {
                return Err(Error::Config("encryption is not possible with direct-xip"));
            }
        }
        Ok(())
    }

    /// Status entries kept for each chunk, total.
    pub fn status_entries(&self) -> usize {
        self.max_img_sectors * self.strategy.state_count()
    }
}
