//! Encryption key envelope
//!
//! Encrypted images carry their key, wrapped, in a TLV.  While a swap is in
//! progress the keys of both slots are kept in the trailer, so a resumed
//! swap uses exactly the keys the first attempt did.  Either the unwrapped
//! key is stored, or with `save_enctlv` the wrapped TLV itself, to be
//! unwrapped again on resume.
//!
//! The ciphers themselves, and the key unwrapping, are provided by the
//! board.

use core::fmt;

use storage::{Flash, ReadFlash};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    config::EncryptionConfig,
    image::{Image, ImageHeader},
    trailer::Trailer,
    Error, Result,
};

pub const MAX_KEY_SIZE: usize = 32;

/// Largest wrapped key TLV kept in the trailer.
pub const MAX_ENC_TLV_SIZE: usize = 256;

/// A saved TLV starts with its length, little endian.
pub const ENC_TLV_LEN_SZ: usize = 2;

/// A symmetric image key.
#[derive(Clone, Eq, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct EncKey {
    bytes: [u8; MAX_KEY_SIZE],
    len: usize,
}

impl EncKey {
    pub fn new(key: &[u8]) -> Option<EncKey> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return None;
        }
        let mut bytes = [0u8; MAX_KEY_SIZE];
        bytes[..key.len()].copy_from_slice(key);
        Some(EncKey { bytes, len: key.len() })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl fmt::Debug for EncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncKey({} bytes)", self.len)
    }
}

/// Counter mode image cipher.  `off` is the offset of `buf` into the image
/// payload, which determines the counter.  Encrypting and decrypting are the
/// same operation.
pub trait ImageCipher {
    fn apply(&self, key: &EncKey, off: usize, buf: &mut [u8]);
}

/// Recovers the key of an image from its key TLV.
pub trait KeyUnwrap {
    /// The TLV kind this unwrapper understands.
    fn tlv_kind(&self) -> u16;

    fn unwrap(&self, blob: &[u8]) -> Option<EncKey>;
}

/// The keys of both slots of the image being swapped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyEnvelope {
    keys: [Option<EncKey>; 2],
    tlvs: [[u8; MAX_ENC_TLV_SIZE]; 2],
    tlv_lens: [usize; 2],
}

impl Default for KeyEnvelope {
    fn default() -> Self {
        KeyEnvelope {
            keys: [None, None],
            tlvs: [[0; MAX_ENC_TLV_SIZE]; 2],
            tlv_lens: [0; 2],
        }
    }
}

impl fmt::Debug for KeyEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEnvelope")
            .field("keys", &self.keys)
            .field("tlv_lens", &self.tlv_lens)
            .finish()
    }
}

impl KeyEnvelope {
    pub fn key(&self, slot: usize) -> Option<&EncKey> {
        self.keys.get(slot)?.as_ref()
    }

    pub fn set_key(&mut self, slot: usize, key: Option<EncKey>) {
        self.keys[slot] = key;
    }

    pub fn tlv(&self, slot: usize) -> &[u8] {
        &self.tlvs[slot][..self.tlv_lens[slot]]
    }

    fn set_tlv(&mut self, slot: usize, blob: &[u8]) -> Result<()> {
        let dest = self.tlvs[slot].get_mut(..blob.len()).ok_or(Error::InvalidImage)?;
        dest.copy_from_slice(blob);
        self.tlv_lens[slot] = blob.len();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.zeroize();
    }
}

/// Recover the key of an encrypted image into the envelope for `slot`.
pub fn load_key<F: ReadFlash>(
    image: &Image<'_, F>,
    unwrap: &dyn KeyUnwrap,
    slot: usize,
    env: &mut KeyEnvelope,
) -> Result<()> {
    let tlv = image.find_tlv(unwrap.tlv_kind())?.ok_or(Error::InvalidImage)?;
    let mut blob = [0u8; MAX_ENC_TLV_SIZE];
    let blob = blob.get_mut(..tlv.data_len()).ok_or(Error::InvalidImage)?;
    tlv.read_data(blob)?;
    let key = unwrap.unwrap(blob).ok_or(Error::InvalidImage)?;
    env.set_key(slot, Some(key));
    env.set_tlv(slot, blob)?;
    blob.zeroize();
    Ok(())
}

/// Persist the key of `slot`.  A slot without a key leaves its block erased.
pub fn write_enc_key<F: Flash>(
    trailer: &Trailer,
    flash: &mut F,
    slot: usize,
    env: &KeyEnvelope,
    config: &EncryptionConfig,
) -> Result<()> {
    let Some(key) = env.key(slot) else {
        return Ok(());
    };
    let off = trailer.enc_key_off(slot);
    if config.save_enctlv {
        let mut block = [flash.erased_val(); MAX_ENC_TLV_SIZE];
        let tlv = env.tlv(slot);
        if tlv.len() > config.enc_tlv_size {
            return Err(Error::Config("enc_tlv_size smaller than key TLV"));
        }
        block[..ENC_TLV_LEN_SZ].copy_from_slice(&(tlv.len() as u16).to_le_bytes());
        block[ENC_TLV_LEN_SZ..ENC_TLV_LEN_SZ + tlv.len()].copy_from_slice(tlv);
        let res = trailer.write_trailer(flash, off, &block[..config.block_size()]);
        block.zeroize();
        res
    } else {
        trailer.write_trailer(flash, off, key.as_bytes())
    }
}

/// Read back the key of `slot`.  An erased block means the slot image is
/// not encrypted.
pub fn read_enc_key<F: Flash>(
    trailer: &Trailer,
    flash: &mut F,
    slot: usize,
    env: &mut KeyEnvelope,
    config: &EncryptionConfig,
    unwrap: Option<&dyn KeyUnwrap>,
) -> Result<()> {
    let size = config.block_size();
    let mut block = [0u8; MAX_ENC_TLV_SIZE];
    let block = block.get_mut(..size).ok_or(Error::Config("key block too large"))?;
    flash.read(trailer.enc_key_off(slot), block)?;

    let erased = flash.erased_val();
    let res = if block.iter().all(|b| *b == erased) {
        env.set_key(slot, None);
        Ok(())
    } else if config.save_enctlv {
        read_saved_tlv(block, slot, env, config, unwrap)
    } else {
        env.set_key(slot, EncKey::new(&block[..config.key_size]));
        Ok(())
    };
    block.zeroize();
    res
}

/// Unwrap a saved TLV.  Only the stored length is used, the rest of the
/// block is padding.
fn read_saved_tlv(
    block: &[u8],
    slot: usize,
    env: &mut KeyEnvelope,
    config: &EncryptionConfig,
    unwrap: Option<&dyn KeyUnwrap>,
) -> Result<()> {
    let unwrap = unwrap.ok_or(Error::Config("save_enctlv needs a key unwrapper"))?;
    let len = u16::from_le_bytes([block[0], block[1]]) as usize;
    if len == 0 || len > config.enc_tlv_size {
        log::error!("Saved key TLV of {} bytes", len);
        return Err(Error::BadStatus);
    }
    let blob = &block[ENC_TLV_LEN_SZ..ENC_TLV_LEN_SZ + len];
    let key = unwrap.unwrap(blob).ok_or(Error::BadStatus)?;
    env.set_key(slot, Some(key));
    env.set_tlv(slot, blob)
}

/// Apply the cipher to the part of `buf` that lies within the payload of the
/// image described by `hdr`.  `img_off` is where `buf` starts, relative to
/// the start of that image.
pub fn apply_in_body(
    cipher: &dyn ImageCipher,
    key: &EncKey,
    hdr: &ImageHeader,
    img_off: usize,
    buf: &mut [u8],
) {
    let body = hdr.body();
    let start = img_off.max(body.start);
    let end = (img_off + buf.len()).min(body.end);
    if start >= end {
        return;
    }
    cipher.apply(key, start - body.start, &mut buf[start - img_off..end - img_off]);
}

#[cfg(test)]
mod tests {
    use simflash::SimFlash;

    use super::*;

    /// Accepts only a 17 byte blob: the key, then a marker.
    struct Exact;

    impl KeyUnwrap for Exact {
        fn tlv_kind(&self) -> u16 {
            0x31
        }

        fn unwrap(&self, blob: &[u8]) -> Option<EncKey> {
            if blob.len() != 17 {
                return None;
            }
            EncKey::new(&blob[..16])
        }
    }

    struct Xor;

    impl ImageCipher for Xor {
        fn apply(&self, key: &EncKey, off: usize, buf: &mut [u8]) {
            for (i, b) in buf.iter_mut().enumerate() {
                let k = key.as_bytes();
                *b ^= k[(off + i) % k.len()].wrapping_add((off + i) as u8);
            }
        }
    }

    #[test]
    fn key_bounds() {
        assert!(EncKey::new(&[]).is_none());
        assert!(EncKey::new(&[0; 33]).is_none());
        assert_eq!(EncKey::new(&[1; 16]).unwrap().as_bytes(), &[1; 16]);
    }

    #[test]
    fn body_only() {
        let mut hdr = ImageHeader::default();
        asraw::AsMutRaw::as_mut_raw(&mut hdr)[8] = 16;
        asraw::AsMutRaw::as_mut_raw(&mut hdr)[12] = 32;
        assert_eq!(hdr.body(), 16..48);

        let key = EncKey::new(&[0x5a; 16]).unwrap();
        let mut whole = [0u8; 64];
        apply_in_body(&Xor, &key, &hdr, 0, &mut whole);

        // Doing it in pieces at odd offsets gives the same answer.
        let mut pieces = [0u8; 64];
        for (n, chunk) in pieces.chunks_mut(7).enumerate() {
            apply_in_body(&Xor, &key, &hdr, n * 7, chunk);
        }
        assert_eq!(whole, pieces);
        assert!(whole[..16].iter().all(|b| *b == 0));
        assert!(whole[48..].iter().all(|b| *b == 0));
        assert!(whole[16..48].iter().any(|b| *b != 0));
    }

    #[test]
    fn short_wrapped_key() {
        let config = EncryptionConfig { key_size: 16, save_enctlv: true, enc_tlv_size: 24 };
        let mut flash = SimFlash::new(1, 8, 4096, 4).unwrap();
        let trailer = Trailer::swap(flash.capacity(), 8, 8 * 3, config.block_size());

        // The marker looks like erased flash.
        let mut blob = [0x3c; 17];
        blob[16] = 0xff;
        let mut env = KeyEnvelope::default();
        env.set_key(1, EncKey::new(&blob[..16]));
        env.set_tlv(1, &blob).unwrap();
        write_enc_key(&trailer, &mut flash, 0, &env, &config).unwrap();
        write_enc_key(&trailer, &mut flash, 1, &env, &config).unwrap();

        let mut back = KeyEnvelope::default();
        read_enc_key(&trailer, &mut flash, 0, &mut back, &config, Some(&Exact)).unwrap();
        read_enc_key(&trailer, &mut flash, 1, &mut back, &config, Some(&Exact)).unwrap();
        assert!(back.key(0).is_none());
        assert_eq!(back.key(1), env.key(1));
        assert_eq!(back.tlv(1), &blob[..]);
    }
}
