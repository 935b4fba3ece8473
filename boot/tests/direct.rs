// Direct-XIP and RAM loading.

mod common;

use boot::{BootConfig, BootLoader, BootResponse, Crypto, Slot, Strategy};
use simflash::{
    gen::GenBuilder,
    styles::{self, DeviceLayout},
    SimFlash,
};
use storage::ReadFlash;

use common::*;

const RAM_BASE: usize = 0x2000_0000;
const RAM_SIZE: usize = 0x8000;

fn direct(revert: bool) -> BootConfig {
    config(Strategy::DirectXip { revert })
}

fn boot_once(
    cfg: &BootConfig,
    map: boot::FlashMap<SimFlash>,
) -> (BootResponse, boot::FlashMap<SimFlash>) {
    let b = boot(cfg, map, plain_crypto());
    (b.result.unwrap(), b.map)
}

#[test]
fn newest_wins() {
    init_logging();
    let cfg = direct(false);
    for layout in &styles::ALL_DEVICES {
        let old = image(7000, 51, 1);
        let new = image(6500, 52, 2);

        let s = setup(layout, &cfg, Some(&old.data), Some(&new.data));
        let (resp, map) = boot_once(&cfg, s.map);
        assert_eq!(resp.slot, Slot::Secondary);
        assert_eq!(resp.header.version().major, 2);
        assert_eq!(resp.image_off, layout.primary.capacity());
        assert_eq!(resp.ram_load, None);
        // Nothing is written without revert.
        assert_eq!(s.rail.ops(), 0);
        check_slots(&map, &old.data, &new.data, 0);

        let s = setup(layout, &cfg, Some(&new.data), Some(&old.data));
        let (resp, _) = boot_once(&cfg, s.map);
        assert_eq!(resp.slot, Slot::Primary);
        assert_eq!(resp.image_off, 0);
    }
}

#[test]
fn equal_versions_prefer_primary() {
    init_logging();
    let cfg = direct(false);
    let a = image(5000, 53, 4);
    let b = image(5100, 54, 4);
    let s = setup(&styles::K64, &cfg, Some(&a.data), Some(&b.data));
    let (resp, _) = boot_once(&cfg, s.map);
    assert_eq!(resp.slot, Slot::Primary);
}

#[test]
fn invalid_slot_skipped() {
    init_logging();
    let cfg = direct(false);
    let old = image(7000, 55, 1);
    let mut new = image(6500, 56, 2);
    new.data[3000] ^= 1;
    let s = setup(&styles::K64, &cfg, Some(&old.data), Some(&new.data));
    let (resp, _) = boot_once(&cfg, s.map);
    assert_eq!(resp.slot, Slot::Primary);
    assert_eq!(resp.header.version().major, 1);

    // With nothing bootable, there is nothing to say.
    let s = setup(&styles::K64, &cfg, None, Some(&new.data));
    let b = boot(&cfg, s.map, plain_crypto());
    assert_eq!(b.result.err(), Some(boot::Error::VerificationFailed));
}

fn revert_layout(layout: &DeviceLayout) {
    let cfg = direct(true);
    let old = image(7000, 57, 1);
    let new = image(6500, 58, 2);
    let s = setup(layout, &cfg, Some(&old.data), Some(&new.data));
    let map = set_pending(&cfg, s.map, false);

    // The first boot of the new image is a test.
    let (resp, map) = boot_once(&cfg, map);
    assert_eq!(resp.slot, Slot::Secondary);
    let (state, map) = trailer_state(&cfg, map, 1);
    assert_eq!(state.copy_done, boot::BootFlag::Set);
    assert_eq!(state.image_ok, boot::BootFlag::Unset);

    // Not confirmed, so it is thrown away.
    let (resp, map) = boot_once(&cfg, map);
    assert_eq!(resp.slot, Slot::Primary);
    assert_eq!(resp.header.version().major, 1);
    let ops = s.rail.ops();
    let (resp, _) = boot_once(&cfg, map);
    assert_eq!(resp.slot, Slot::Primary);
    assert_eq!(s.rail.ops(), ops);
}

#[test]
fn unconfirmed_reverts() {
    init_logging();
    for layout in &styles::ALL_DEVICES {
        revert_layout(layout);
    }
}

#[test]
fn confirmed_stays() {
    init_logging();
    let cfg = direct(true);
    let old = image(7000, 59, 1);
    let new = image(6500, 60, 2);
    let s = setup(&styles::K64, &cfg, Some(&old.data), Some(&new.data));
    let map = set_pending(&cfg, s.map, false);

    let mut bl = BootLoader::new(cfg, map, plain_crypto()).unwrap();
    let resp = bl.boot_go().unwrap();
    assert_eq!(resp[0].slot, Slot::Secondary);
    bl.set_confirmed(0).unwrap();
    let mut map = bl.into_flash();

    let ops = s.rail.ops();
    for _ in 0..2 {
        let (resp, next) = boot_once(&cfg, map);
        assert_eq!(resp.slot, Slot::Secondary);
        map = next;
    }
    assert_eq!(s.rail.ops(), ops);
    check_slots(&map, &old.data, &new.data, 0);
}

fn ram_image(
    size: usize,
    seed: usize,
    major: u8,
    load: u32,
    encrypt: bool,
) -> simflash::gen::GeneratedImage {
    let mut gen = GenBuilder::default();
    gen.size(size).seed(seed).version(major, 0, 0, 0).load_addr(load);
    if encrypt {
        gen.encrypt(IMAGE_KEY);
    }
    gen.build().unwrap()
}

/// Boot with a RAM region, giving the response and the RAM contents.
fn ram_boot(
    cfg: &BootConfig,
    map: boot::FlashMap<SimFlash>,
    crypto: Crypto<'static>,
) -> (boot::Result<BootResponse>, Vec<u8>) {
    let mut ram = vec![0u8; RAM_SIZE];
    let result = {
        let mut bl = BootLoader::new(*cfg, map, crypto).unwrap().with_ram(&mut ram, RAM_BASE);
        let result = bl.boot_go().map(|r| r[0]);
        bl.into_flash();
        result
    };
    (result, ram)
}

#[test]
fn ram_load() {
    init_logging();
    let cfg = config(Strategy::RamLoad { revert: false });
    let old = ram_image(5000, 61, 1, 0x2000_0400, false);
    let new = ram_image(6000, 62, 2, 0x2000_2000, false);
    let s = setup(&styles::K64, &cfg, Some(&old.data), Some(&new.data));
    let (result, ram) = ram_boot(&cfg, s.map, plain_crypto());
    let resp = result.unwrap();
    assert_eq!(resp.slot, Slot::Secondary);
    assert_eq!(resp.ram_load, Some(0x2000_2000));
    assert!(ram[0x2000..0x2000 + new.data.len()] == new.data[..]);
    assert_eq!(s.rail.ops(), 0);
}

#[test]
fn ram_load_decrypts() {
    init_logging();
    let cfg = encrypted_config(Strategy::RamLoad { revert: false }, false);
    let new = ram_image(6000, 63, 2, 0x2000_1000, true);
    let s = setup(&styles::K64, &cfg, None, Some(&new.data));
    let (result, ram) = ram_boot(&cfg, s.map, toy_crypto());
    assert_eq!(result.unwrap().ram_load, Some(0x2000_1000));
    assert!(ram[0x1000..0x1000 + new.plain.len()] == new.plain[..]);

    // Without the means to decrypt, the image can't be loaded.
    let s = setup(&styles::K64, &cfg, None, Some(&new.data));
    let (result, ram) = ram_boot(&cfg, s.map, plain_crypto());
    assert!(result.is_err());
    assert!(ram.iter().all(|b| *b == 0));
}

#[test]
fn ram_load_out_of_range() {
    init_logging();
    let cfg = config(Strategy::RamLoad { revert: false });
    let old = ram_image(5000, 64, 1, 0x2000_0000, false);
    // Past the end of RAM.
    let new = ram_image(6000, 65, 2, 0x2000_7000, false);
    let s = setup(&styles::K64, &cfg, Some(&old.data), Some(&new.data));
    let (result, ram) = ram_boot(&cfg, s.map, plain_crypto());
    let resp = result.unwrap();
    assert_eq!(resp.slot, Slot::Primary);
    assert_eq!(resp.ram_load, Some(0x2000_0000));
    assert!(ram[..old.data.len()] == old.data[..]);
}

#[test]
fn ram_load_checks_copy() {
    init_logging();
    let cfg = config(Strategy::RamLoad { revert: false });
    let old = ram_image(5000, 66, 1, 0x2000_0000, false);
    let mut new = ram_image(6000, 67, 2, 0x2000_2000, false);
    new.data[4000] ^= 0x80;
    let s = setup(&styles::K64, &cfg, Some(&old.data), Some(&new.data));
    let (result, ram) = ram_boot(&cfg, s.map, plain_crypto());
    assert_eq!(result.unwrap().slot, Slot::Primary);
    // The bad copy is gone.
    assert!(ram[0x2000..0x2000 + new.data.len()].iter().all(|b| *b == 0));
}

#[test]
fn ram_load_needs_ram() {
    init_logging();
    let cfg = config(Strategy::RamLoad { revert: false });
    let old = ram_image(5000, 68, 1, 0x2000_0000, false);
    let s = setup(&styles::K64, &cfg, Some(&old.data), None);
    let b = boot(&cfg, s.map, plain_crypto());
    assert!(matches!(b.result, Err(boot::Error::Config(_))));
}

#[test]
fn image_detail() {
    init_logging();
    let cfg = direct(false);
    let img = image(5000, 69, 3);
    let s = setup(&styles::K64, &cfg, Some(&img.data), None);
    let mut bl = BootLoader::new(cfg, s.map, plain_crypto()).unwrap();
    bl.boot_go().unwrap();
    assert_eq!(bl.img_hdr(Slot::Primary).map(|h| h.img_size()), Some(5000 - 256));
    assert!(bl.img_hdr(Slot::Secondary).is_none());
    // Slots are not split up when nothing moves between them.
    assert_eq!(bl.img_num_sectors(Slot::Primary), 0);
    assert_eq!(
        bl.img_area(Slot::Primary).map(|a| a.borrow().capacity()),
        Some(styles::K64_SLOT.capacity())
    );
}
