// Shared test harness.  Not every test uses every helper.
#![allow(dead_code)]

use std::{cell::RefCell, sync::Once};

use boot::{
    BootConfig, BootLoader, BootResponse, Crypto, EncKey, EncryptionConfig, FlashMap, HashOnly,
    ImageCipher, KeyUnwrap, Strategy, SwapState, SwapType,
};
use simflash::{
    gen::{self, GenBuilder, GeneratedImage},
    styles::DeviceLayout,
    PowerRail, SimFlash,
};
use storage::Flash;

static LOGGER: Once = Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Warn)
            .init();
    });
}

/// Stands in for AES-CTR, using the keystream of the image generator.
pub struct ToyCipher;

impl ImageCipher for ToyCipher {
    fn apply(&self, key: &EncKey, off: usize, buf: &mut [u8]) {
        gen::xor_keystream(key.as_bytes(), off, buf);
    }
}

/// Undoes the key wrap of the image generator.
pub struct ToyUnwrap;

impl KeyUnwrap for ToyUnwrap {
    fn tlv_kind(&self) -> u16 {
        gen::TLV_ENC_KW
    }

    fn unwrap(&self, blob: &[u8]) -> Option<EncKey> {
        EncKey::new(&gen::unwrap_key(blob)?)
    }
}

pub fn plain_crypto() -> Crypto<'static> {
    Crypto::default()
}

pub fn toy_crypto() -> Crypto<'static> {
    Crypto { verifier: &HashOnly, cipher: Some(&ToyCipher), unwrap: Some(&ToyUnwrap) }
}

pub const IMAGE_KEY: [u8; 16] = [
    0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xf0, 0x01,
];

pub fn config(strategy: Strategy) -> BootConfig {
    BootConfig { strategy, max_img_sectors: 64, ..BootConfig::default() }
}

pub fn encrypted_config(strategy: Strategy, save_enctlv: bool) -> BootConfig {
    let encryption = EncryptionConfig { key_size: 16, save_enctlv, enc_tlv_size: 24 };
    BootConfig { encryption: Some(encryption), ..config(strategy) }
}

/// A generated image of `size` bytes before the TLV.
pub fn image(size: usize, seed: usize, major: u8) -> GeneratedImage {
    GenBuilder::default().size(size).seed(seed).version(major, 0, 0, 0).build().unwrap()
}

pub fn encrypted_image(size: usize, seed: usize, major: u8) -> GeneratedImage {
    GenBuilder::default()
        .size(size)
        .seed(seed)
        .version(major, 0, 0, 0)
        .encrypt(IMAGE_KEY)
        .build()
        .unwrap()
}

/// Offset of the upgrade image in the secondary slot.
pub fn upgrade_offset(cfg: &BootConfig, slot: &SimFlash) -> usize {
    match cfg.strategy {
        Strategy::SwapOffset => slot.erase_size(),
        _ => 0,
    }
}

/// A device with images installed, and nothing booted yet.
pub struct Setup {
    pub rail: PowerRail,
    pub map: FlashMap<SimFlash>,
}

pub fn setup(
    layout: &DeviceLayout,
    cfg: &BootConfig,
    primary: Option<&[u8]>,
    secondary: Option<&[u8]>,
) -> Setup {
    let mut dev = layout.build().unwrap();
    if let Some(data) = primary {
        dev.primary.install(data, 0).unwrap();
    }
    if let Some(data) = secondary {
        let off = upgrade_offset(cfg, &dev.secondary);
        dev.secondary.install(data, off).unwrap();
    }
    let mut map = FlashMap::new();
    map.add_image(dev.primary, Some(dev.secondary)).unwrap();
    if let Some(scratch) = dev.scratch {
        map.set_scratch(scratch);
    }
    Setup { rail: dev.rail, map }
}

/// Request an upgrade of image 0.
pub fn set_pending(
    cfg: &BootConfig,
    map: FlashMap<SimFlash>,
    permanent: bool,
) -> FlashMap<SimFlash> {
    let mut bl = BootLoader::new(*cfg, map, plain_crypto()).unwrap();
    bl.set_pending(0, permanent).unwrap();
    bl.into_flash()
}

pub fn set_confirmed(cfg: &BootConfig, map: FlashMap<SimFlash>) -> FlashMap<SimFlash> {
    let mut bl = BootLoader::new(*cfg, map, plain_crypto()).unwrap();
    bl.set_confirmed(0).unwrap();
    bl.into_flash()
}

/// The result of one boot.
pub struct Boot {
    pub result: boot::Result<BootResponse>,
    pub swap_type: SwapType,
    pub map: FlashMap<SimFlash>,
}

pub fn boot(cfg: &BootConfig, map: FlashMap<SimFlash>, crypto: Crypto<'static>) -> Boot {
    let mut bl = BootLoader::new(*cfg, map, crypto).unwrap();
    let result = bl.boot_go().map(|r| r[0]);
    let swap_type = bl.swap_type();
    Boot { result, swap_type, map: bl.into_flash() }
}

pub fn primary(map: &FlashMap<SimFlash>) -> &RefCell<SimFlash> {
    &map.images[0].primary
}

pub fn secondary(map: &FlashMap<SimFlash>) -> &RefCell<SimFlash> {
    map.images[0].secondary.as_ref().unwrap()
}

/// Bytes of an area, from `off`.
pub fn area_bytes(area: &RefCell<SimFlash>, off: usize, len: usize) -> Vec<u8> {
    area.borrow().contents()[off..off + len].to_vec()
}

pub fn trailer_state(
    cfg: &BootConfig,
    map: FlashMap<SimFlash>,
    slot: usize,
) -> (SwapState, FlashMap<SimFlash>) {
    let bl = BootLoader::new(*cfg, map, plain_crypto()).unwrap();
    let area = if slot == 0 { primary(bl.flash()) } else { secondary(bl.flash()) };
    let trailer = bl.slot_trailer(area);
    let state = trailer.read_swap_state(&mut *area.borrow_mut()).unwrap();
    (state, bl.into_flash())
}

/// Check that the slots hold the expected images.  The primary holds
/// `primary` at zero, the secondary holds `secondary` at `sec_off`.
pub fn check_slots(
    map: &FlashMap<SimFlash>,
    primary_img: &[u8],
    secondary_img: &[u8],
    sec_off: usize,
) {
    assert!(
        area_bytes(primary(map), 0, primary_img.len()) == primary_img,
        "primary slot does not hold the expected image"
    );
    assert!(
        area_bytes(secondary(map), sec_off, secondary_img.len()) == secondary_img,
        "secondary slot does not hold the expected image"
    );
}
