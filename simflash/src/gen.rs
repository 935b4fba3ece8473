//! Image generation.
//!
//! Builds images in the layout the bootloader expects: a 32 byte header,
//! padded out to the header size, a pseudo-random payload, and the TLV area
//! carrying a SHA256 of the header and payload.  Images can optionally be
//! "encrypted" with a toy keystream, which stands in for AES-CTR in tests.
//! The key is carried in an `ENC_KW` TLV, wrapped with an equally toy key
//! wrap.  Neither offers any protection whatever.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use sha2::{Digest, Sha256};

use anyhow::{bail, Result};

pub const IMAGE_MAGIC: u32 = 0x96f3b83d;
pub const TLV_INFO_MAGIC: u16 = 0x6907;
pub const TLV_SHA256: u16 = 0x10;
pub const TLV_ENC_KW: u16 = 0x31;
pub const IMAGE_F_ENCRYPTED_AES128: u32 = 0x04;

/// Key encryption key shared by the generator and the test unwrapper.
pub const KEK: [u8; 16] = [
    0x3c, 0x91, 0x0e, 0x57, 0xa2, 0x6b, 0xf4, 0x18, 0xcd, 0x29, 0x70, 0x8e, 0x45, 0xb3, 0x1a, 0xd6,
];

/// Marker at the front of a wrapped key.
const WRAP_IV: [u8; 8] = [0xa6; 8];

pub struct GeneratedImage {
    /// The image as it should be placed in flash.
    pub data: Vec<u8>,
    /// The same image with the payload in the clear.
    pub plain: Vec<u8>,
}

pub struct GenBuilder {
    /// Size of the zeroed header.
    header_size: usize,
    /// Total size of the image, not counting the TLV.
    size: usize,
    /// Seed for the PRNG
    seed: usize,
    version: (u8, u8, u16, u32),
    load_addr: u32,
    key: Option<[u8; 16]>,
}

impl Default for GenBuilder {
    fn default() -> Self {
        GenBuilder {
            header_size: 256,
            size: 76_137,
            seed: 1,
            version: (0, 1, 0, 0),
            load_addr: 0,
            key: None,
        }
    }
}

impl GenBuilder {
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    pub fn seed(&mut self, seed: usize) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn header_size(&mut self, header_size: usize) -> &mut Self {
        self.header_size = header_size;
        self
    }

    pub fn version(&mut self, major: u8, minor: u8, revision: u16, build: u32) -> &mut Self {
        self.version = (major, minor, revision, build);
        self
    }

    pub fn load_addr(&mut self, load_addr: u32) -> &mut Self {
        self.load_addr = load_addr;
        self
    }

    /// Encrypt the payload with the given key.
    pub fn encrypt(&mut self, key: [u8; 16]) -> &mut Self {
        self.key = Some(key);
        self
    }

    pub fn build(&self) -> Result<GeneratedImage> {
        if self.header_size < 32 || self.size <= self.header_size {
            bail!("Image of {} bytes cannot hold a {} byte header", self.size, self.header_size);
        }
        let hdr_size = u16::try_from(self.header_size)?;
        let img_size = u32::try_from(self.size - self.header_size)?;

        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed as u64);
        let mut plain = vec![0u8; self.size];
        rng.fill_bytes(&mut plain[self.header_size..]);

        let flags = if self.key.is_some() { IMAGE_F_ENCRYPTED_AES128 } else { 0 };
        let (major, minor, revision, build) = self.version;
        let mut hdr = Vec::with_capacity(32);
        hdr.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        hdr.extend_from_slice(&self.load_addr.to_le_bytes());
        hdr.extend_from_slice(&hdr_size.to_le_bytes());
        hdr.extend_from_slice(&0u16.to_le_bytes());
        hdr.extend_from_slice(&img_size.to_le_bytes());
        hdr.extend_from_slice(&flags.to_le_bytes());
        hdr.push(major);
        hdr.push(minor);
        hdr.extend_from_slice(&revision.to_le_bytes());
        hdr.extend_from_slice(&build.to_le_bytes());
        hdr.extend_from_slice(&0u32.to_le_bytes());
        plain[..32].copy_from_slice(&hdr);

        // The hash always covers the plaintext.
        let hash = Sha256::digest(&plain);

        let mut tlv = Vec::new();
        push_tlv(&mut tlv, TLV_SHA256, &hash);
        if let Some(key) = &self.key {
            push_tlv(&mut tlv, TLV_ENC_KW, &wrap_key(key));
        }
        let tlv_len = u16::try_from(tlv.len() + 4)?;

        let mut data = plain.clone();
        if let Some(key) = &self.key {
            xor_keystream(key, 0, &mut data[self.header_size..]);
        }

        for image in [&mut plain, &mut data] {
            image.extend_from_slice(&TLV_INFO_MAGIC.to_le_bytes());
            image.extend_from_slice(&tlv_len.to_le_bytes());
            image.extend_from_slice(&tlv);
        }

        Ok(GeneratedImage { data, plain })
    }
}

fn push_tlv(tlv: &mut Vec<u8>, kind: u16, data: &[u8]) {
    tlv.extend_from_slice(&kind.to_le_bytes());
    tlv.extend_from_slice(&(data.len() as u16).to_le_bytes());
    tlv.extend_from_slice(data);
}

/// Apply the toy keystream to `buf`, which sits at `off` bytes into the
/// payload.  Applying it twice gives back the original data.
pub fn xor_keystream(key: &[u8], off: usize, buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        let pos = off + i;
        let block = (pos / 16) as u32;
        let mix = block.wrapping_mul(0x9e37_79b9).to_le_bytes();
        *byte ^= key[pos % key.len()] ^ mix[pos % 4] ^ (pos as u8);
    }
}

/// Wrap a key for the `ENC_KW` TLV.
pub fn wrap_key(key: &[u8; 16]) -> [u8; 24] {
    let mut blob = [0u8; 24];
    blob[..8].copy_from_slice(&WRAP_IV);
    for (i, b) in blob[8..].iter_mut().enumerate() {
        *b = key[i] ^ KEK[i];
    }
    blob
}

/// Undo `wrap_key`.  Returns None if the blob isn't a wrapped key.
pub fn unwrap_key(blob: &[u8]) -> Option<[u8; 16]> {
    if blob.len() != 24 || blob[..8] != WRAP_IV {
        return None;
    }
    let mut key = [0u8; 16];
    for (i, b) in key.iter_mut().enumerate() {
        *b = blob[8 + i] ^ KEK[i];
    }
    Some(key)
}
