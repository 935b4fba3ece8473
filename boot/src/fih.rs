//! Fault injection hardened results.
//!
//! A verification result is carried as a pair of words, the value and a
//! copy of it xored with a mask.  Success and failure differ in every other
//! bit, and a result whose two words disagree is neither.  Turning a failure
//! into a success with a glitch takes many flipped bits in two places.

use core::hint::black_box;

const FIH_MASK_VALUE: u32 = 0xA5C3_5A3C;
const FIH_POSITIVE_VALUE: u32 = 0x1AAA_AAAA;
const FIH_NEGATIVE_VALUE: u32 = 0x1555_5555;

#[derive(Debug, Clone, Copy)]
pub struct FihRet {
    val: u32,
    msk: u32,
}

impl FihRet {
    pub const SUCCESS: FihRet = FihRet::new(FIH_POSITIVE_VALUE);
    pub const FAILURE: FihRet = FihRet::new(FIH_NEGATIVE_VALUE);

    const fn new(val: u32) -> FihRet {
        FihRet { val, msk: val ^ FIH_MASK_VALUE }
    }

    fn is_valid(&self) -> bool {
        (black_box(self.val) ^ black_box(self.msk)) == FIH_MASK_VALUE
    }

    /// Equal values, both intact.
    pub fn fih_eq(&self, other: &FihRet) -> bool {
        self.is_valid()
            && other.is_valid()
            && black_box(self.val) == black_box(other.val)
            && black_box(self.msk) == black_box(other.msk)
    }

    pub fn is_success(&self) -> bool {
        self.fih_eq(&FihRet::SUCCESS)
    }

    /// Anything that isn't an intact success.
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }
}

impl From<bool> for FihRet {
    fn from(ok: bool) -> FihRet {
        if ok {
            FihRet::SUCCESS
        } else {
            FihRet::FAILURE
        }
    }
}

/// Compare two byte strings in time that depends only on their length.
pub fn fih_memequal(a: &[u8], b: &[u8]) -> FihRet {
    if a.len() != b.len() {
        return FihRet::FAILURE;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= black_box(x ^ y);
    }
    if black_box(diff) == 0 {
        FihRet::SUCCESS
    } else {
        FihRet::FAILURE
    }
}

/// Signature checking is outside of the bootloader.  An implementation
/// checks one signature TLV against the image hash.
pub trait SignatureVerifier {
    /// Must every image carry a signature that passes?
    fn required(&self) -> bool;

    /// Verify `sig`, a TLV of type `kind`, over `hash`.  `key` holds the
    /// contents of the key hash TLV that came before it, if any.
    fn verify(&self, kind: u16, hash: &[u8; 32], key: Option<&[u8]>, sig: &[u8]) -> FihRet;
}

/// Accept images on the strength of their hash alone.  Any signature
/// present fails, as there is nothing to check it with.
pub struct HashOnly;

impl SignatureVerifier for HashOnly {
    fn required(&self) -> bool {
        false
    }

    fn verify(&self, _kind: u16, _hash: &[u8; 32], _key: Option<&[u8]>, _sig: &[u8]) -> FihRet {
        FihRet::FAILURE
    }
}
