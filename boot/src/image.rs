//! Boot image support

use core::{cell::RefCell, fmt, mem::size_of};

use asraw::{AsMutRaw, AsRaw};
use storage::ReadFlash;
use sha2::{Digest, Sha256};

use crate::{
    enc::{EncKey, ImageCipher},
    fih::{fih_memequal, FihRet, SignatureVerifier},
    MappedFlash, Error, Result,
};

/// The image header contains the following magic value, indicating the
/// interpretation of the rest of the image header.
pub const IMAGE_MAGIC: u32 = 0x96f3b83d;

pub const IMAGE_HEADER_SIZE: usize = size_of::<ImageHeader>();

/// Header flags.
pub const IMAGE_F_ENCRYPTED_AES128: u32 = 0x0000_0004;
pub const IMAGE_F_ENCRYPTED_AES256: u32 = 0x0000_0008;

/// The result of a SHA256 hash, appropriate for stack allocation.
type Hash256 = [u8; 32];

/// Largest signature TLV we will read.
const MAX_SIG_LEN: usize = 512;

/// An image is a bootable image residing in a flash partition.  There is a
/// header at the beginning, and metadata immediately following the image.
/// This holds on to a RefCell to the flash to bind the data to a particular flash.
pub struct Image<'f, F> {
    flash: &'f RefCell<F>,
    pub header: ImageHeader,
    tlv_base: usize,
    /// Length of the protected TLV, zero if absent.
    prot_size: usize,
    tlv_size: usize,
}

impl<'f, F: ReadFlash> Image<'f, F> {
    /// Make an image from flash, if the image has a valid header. This does not
    /// indicate that the image itself is valid, merely that the header
    /// indicates an image is present.
    pub fn from_flash(flash: &'f RefCell<F>) -> Result<Image<'f, F>> {
        let header = ImageHeader::from_flash(&mut *flash.borrow_mut())?;

        // Find the base address of the TLV.
        let tlv_base = (header.img_size as usize)
            .checked_add(header.hdr_size as usize)
            .ok_or(Error::InvalidImage)?;

        // The protected TLV, when present, comes first, and its size is
        // recorded in the header.
        let prot_size = header.protected_tlv_size as usize;
        if prot_size > 0 {
            let info = read_info(flash, tlv_base)?;
            if info.magic != TLV_PROT_INFO_MAGIC || info.len as usize != prot_size {
                return Err(Error::InvalidImage);
            }
        }

        let info = read_info(flash, tlv_base + prot_size)?;
        if info.magic != TLV_INFO_MAGIC {
            return Err(Error::InvalidImage);
        }
        let tlv_size = info.len as usize;

        // Walk the entries, to make sure the lengths add up.
        let image = Image { flash, header, tlv_base, prot_size, tlv_size };
        for entry in image.tlvs()? {
            entry?;
        }

        Ok(image)
    }

    /// Iterate over the elements of the Tlv.  Protected entries come first.
    pub fn tlvs<'a>(&'a self) -> Result<TlvIter<'a, 'f, F>> {
        let info = read_info(self.flash, self.tlv_base + self.prot_size)?;
        if info.magic != TLV_INFO_MAGIC {
            return Err(Error::InvalidImage);
        }

        Ok(TlvIter {
            image: self,
            pos: size_of::<TlvInfo>(),
            prot_limit: self.prot_size,
            limit: self.prot_size + info.len as usize,
        })
    }

    /// Find the first TLV of a kind.
    pub fn find_tlv(&self, kind: u16) -> Result<Option<TlvIterEntry<'f, F>>> {
        for elt in self.tlvs()? {
            let elt = elt?;
            if elt.kind() == kind {
                return Ok(Some(elt));
            }
        }
        Ok(None)
    }

    /// Validate this image with nothing but its hash, in the clear.
    pub fn validate(&self) -> Result<()> {
        if self.verify(&crate::fih::HashOnly, None).is_success() {
            Ok(())
        } else {
            Err(Error::VerificationFailed)
        }
    }

    /// Verify this image.  Check the TLV entries, making sure that they are
    /// sufficient, and that indicated items, such as hashes and signatures are
    /// valid.  An encrypted payload is decrypted on the fly when a cipher and
    /// key are given.  Any failure to read is a failure to verify.
    pub fn verify(
        &self,
        verifier: &dyn SignatureVerifier,
        decrypt: Option<(&dyn ImageCipher, &EncKey)>,
    ) -> FihRet {
        match self.verify_inner(verifier, decrypt) {
            Ok(ret) => ret,
            Err(e) => {
                log::warn!("Image verification: {}", e);
                FihRet::FAILURE
            }
        }
    }

    fn verify_inner(
        &self,
        verifier: &dyn SignatureVerifier,
        decrypt: Option<(&dyn ImageCipher, &EncKey)>,
    ) -> Result<FihRet> {
        // An encrypted image checked without a key must already be in the
        // clear, as it is in the primary slot or in RAM.
        let image_hash = self.calculate_sha256(decrypt)?;

        // Things we must see.
        let mut seen_sha = false;
        let mut seen_sig = false;
        let mut key: heapless::Vec<u8, 64> = heapless::Vec::new();

        for elt in self.tlvs()? {
            let elt = elt?;
            match elt.kind() {
                TLV_SHA256 => {
                    if seen_sha {
                        // Only a single hash is allowed.
                        return Ok(FihRet::FAILURE);
                    }
                    seen_sha = true;
                    let mut hash = [0u8; 32];
                    elt.read_data(&mut hash)?;
                    if fih_memequal(&hash, &image_hash).is_failure() {
                        log::warn!("Hash verification failure");
                        return Ok(FihRet::FAILURE);
                    }
                }
                TLV_KEYHASH => {
                    key.resize_default(elt.data_len()).map_err(|_| Error::InvalidImage)?;
                    elt.read_data(&mut key)?;
                }
                TLV_RSA2048_PSS | TLV_ECDSA224 | TLV_ECDSA_SIG | TLV_RSA3072_PSS | TLV_ED25519 => {
                    if !seen_sha {
                        return Ok(FihRet::FAILURE);
                    }
                    let mut sig = [0u8; MAX_SIG_LEN];
                    let sig = sig.get_mut(..elt.data_len()).ok_or(Error::InvalidImage)?;
                    elt.read_data(sig)?;
                    let k = if key.is_empty() { None } else { Some(&key[..]) };
                    if verifier.verify(elt.kind(), &image_hash, k, sig).is_failure() {
                        log::warn!("Signature verification failure");
                        return Ok(FihRet::FAILURE);
                    }
                    seen_sig = true;
                }
                // Key material is consumed by the key envelope, counters
                // and dependencies are not checked here.
                TLV_ENC_RSA2048 | TLV_ENC_KW | TLV_ENC_EC256 | TLV_ENC_X25519 | TLV_SEC_CNT
                | TLV_DEPENDENCY => (),
                kind => {
                    log::warn!("Unexpected TLV 0x{:x}", kind);
                    return Ok(FihRet::FAILURE);
                }
            }
        }
        if !seen_sha {
            log::warn!("Expecting SHA TLV");
            return Ok(FihRet::FAILURE);
        }
        if verifier.required() && !seen_sig {
            log::warn!("Expecting signature TLV");
            return Ok(FihRet::FAILURE);
        }
        Ok(FihRet::SUCCESS)
    }

    /// Compute the hash of the header, the payload, and the protected TLV.
    fn calculate_sha256(&self, decrypt: Option<(&dyn ImageCipher, &EncKey)>) -> Result<Hash256> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 128];
        let body = self.header.hdr_size as usize..self.tlv_base;
        let end = self.tlv_base + self.prot_size;
        let mut pos = 0;
        while pos < end {
            // Keep pieces from straddling the edges of the payload.
            let edge = if pos < body.start {
                body.start
            } else if pos < body.end {
                body.end
            } else {
                end
            };
            let todo = (edge - pos).min(buffer.len());
            let buf = &mut buffer[0..todo];
            self.flash.borrow_mut().read(pos, buf)?;
            if let Some((cipher, key)) = decrypt {
                if body.contains(&pos) {
                    cipher.apply(key, pos - body.start, buf);
                }
            }
            hasher.update(&*buf);
            pos += todo;
        }
        let mut result = [0u8; 32];
        result.copy_from_slice(hasher.finalize().as_slice());
        Ok(result)
    }
}

fn read_info<F: ReadFlash>(flash: &RefCell<F>, pos: usize) -> Result<TlvInfo> {
    let mut info = TlvInfo::default();
    flash.borrow_mut().read(pos, info.as_mut_raw())?;
    Ok(info)
}

impl<'a, F> Image<'a, F> {
    /// Return the size, in bytes, of the entire image, including the TLV.
    pub fn full_image_size(&self) -> usize {
        self.tlv_base + self.prot_size + self.tlv_size
    }
}

pub struct TlvIter<'a, 'f, F> {
    image: &'a Image<'f, F>,
    pos: usize,
    /// End of the protected entries.  The unprotected info header follows.
    prot_limit: usize,
    limit: usize,
}

pub struct TlvIterEntry<'f, F> {
    flash: &'f RefCell<F>,
    kind: u16,
    pos: usize,
    len: usize,
}

/// Helper like '?' for iterator operations, where errors should return
/// Some(Err(e)) instead of just the error.  This macro contains a return.
macro_rules! iter_try {
    ($e:expr) => {
        match $e {
            Ok(r) => r,
            Err(e) => return Some(Err(e.into())),
        }
    };
}

impl<'a, 'f, F: ReadFlash> Iterator for TlvIter<'a, 'f, F> {
    type Item = Result<TlvIterEntry<'f, F>>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.prot_limit && self.prot_limit > 0 {
            // Skip over the unprotected info.
            self.pos += size_of::<TlvInfo>();
        }
        if self.pos >= self.limit {
            return None;
        }

        let mut entry = TlvEntry::default();
        let pos = iter_try!(self
            .image
            .tlv_base
            .checked_add(self.pos)
            .ok_or(Error::InvalidImage));
        iter_try!(self
            .image
            .flash
            .borrow_mut()
            .read(pos, entry.as_mut_raw()));
        let data_pos = iter_try!(pos
            .checked_add(size_of::<TlvEntry>())
            .ok_or(Error::InvalidImage));
        self.pos = iter_try!(self
            .pos
            .checked_add(size_of::<TlvEntry>() + entry.len as usize)
            .ok_or(Error::InvalidImage));
        if self.pos > self.limit {
            return Some(Err(Error::InvalidImage));
        }
        Some(Ok(TlvIterEntry {
            flash: self.image.flash,
            kind: entry.kind,
            pos: data_pos,
            len: entry.len as usize,
        }))
    }
}

impl<'f, F: ReadFlash> TlvIterEntry<'f, F> {
    /// What is the kind of this TLV entry.
    pub fn kind(&self) -> u16 {
        self.kind
    }

    /// What is the size of the payload.
    pub fn data_len(&self) -> usize {
        self.len
    }

    /// Read the payload into the given bytes.
    pub fn read_data(&self, data: &mut [u8]) -> Result<()> {
        if data.len() != self.len {
            return Err(Error::InvalidImage);
        }
        self.flash.borrow_mut().read(self.pos, data)?;
        Ok(())
    }
}

/// For mapped flash, we can get the base address of the XIP area.
impl<'f, F: MappedFlash> Image<'f, F> {
    pub fn get_image_base(&self) -> usize {
        self.flash.borrow().get_base() + self.header.hdr_size as usize
    }
}

/// The image begins with the following header.  This is intended to be
/// interpreted as a C struct.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[repr(C)]
pub struct ImageHeader {
    /// Magic number, indicates this particular header.
    magic: u32,
    /// The address to load this image.  Only used for non-XIP.  It seems to be
    /// used if non-zero, which assumes that RAM does not start at address zero.
    load_addr: u32,
    /// The size of the header.  This struct is at the beginning, and there is
    /// some amount of padding before the actual image starts.  This is used
    /// because many architectures place alignment requirements on the runable
    /// image.
    hdr_size: u16,
    /// The size of the protected TLV.  The size is included here.  See below on
    /// the TLV for the meaning of this value.
    protected_tlv_size: u16,
    /// The size of the image, not counting the header.
    img_size: u32,
    /// Flags for this image.
    flags: u32,
    /// Version of this particular image.
    version: ImageVersion,
    /// Padding, to reach a nicely aligned minimum size.
    pad1: u32,
}

impl AsRaw for ImageHeader {}
unsafe impl AsMutRaw for ImageHeader {}

impl ImageHeader {
    /// Read the header at the start of an area.  Only the magic is checked.
    pub fn from_flash<F: ReadFlash>(flash: &mut F) -> Result<ImageHeader> {
        let mut header = ImageHeader::default();
        flash.read(0, header.as_mut_raw())?;
        if header.magic != IMAGE_MAGIC {
            return Err(Error::InvalidImage);
        }
        Ok(header)
    }

    pub fn hdr_size(&self) -> u16 {
        self.hdr_size
    }

    pub fn img_size(&self) -> u32 {
        self.img_size
    }

    pub fn load_addr(&self) -> u32 {
        self.load_addr
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn version(&self) -> ImageVersion {
        self.version
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & (IMAGE_F_ENCRYPTED_AES128 | IMAGE_F_ENCRYPTED_AES256) != 0
    }

    /// The payload range, relative to the start of the image.
    pub fn body(&self) -> core::ops::Range<usize> {
        let start = self.hdr_size as usize;
        start..start + self.img_size as usize
    }
}

/// Each image has a version.  This is a pseudo-semantic version used to
/// determine upgrade elligibility and compatible between multi-image setups.
/// Versions order by major, minor, revision then build number.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
#[repr(C)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}+{}", self.major, self.minor, self.revision, self.build_num)
    }
}

/// The TLV block contains this header.
#[derive(Debug, Default)]
#[repr(C)]
struct TlvInfo {
    /// Magic one of TLV_INFO_MAGIC or TLV_PROT_INFO_MAGIC.
    magic: u16,
    /// Length of TLV, including this header.
    len: u16,
}

const TLV_INFO_MAGIC: u16 = 0x6907;
const TLV_PROT_INFO_MAGIC: u16 = 0x6908;

// Supported TLVS
const TLV_KEYHASH: u16 = 0x01;
const TLV_SHA256: u16 = 0x10;
const TLV_RSA2048_PSS: u16 = 0x20;
const TLV_ECDSA224: u16 = 0x21;
const TLV_ECDSA_SIG: u16 = 0x22;
const TLV_RSA3072_PSS: u16 = 0x23;
const TLV_ED25519: u16 = 0x24;
pub const TLV_ENC_RSA2048: u16 = 0x30;
pub const TLV_ENC_KW: u16 = 0x31;
pub const TLV_ENC_EC256: u16 = 0x32;
pub const TLV_ENC_X25519: u16 = 0x33;
const TLV_DEPENDENCY: u16 = 0x40;
const TLV_SEC_CNT: u16 = 0x50;

impl AsRaw for TlvInfo {}
unsafe impl AsMutRaw for TlvInfo {}

/// Each TLV entry is preceeded by this header.
#[derive(Debug, Default)]
#[repr(C)]
struct TlvEntry {
    /// The kind of entry.
    kind: u16,
    /// Length of the payload, not including this header.
    len: u16,
}

impl AsRaw for TlvEntry {}
unsafe impl AsMutRaw for TlvEntry {}
