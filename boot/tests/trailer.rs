// Requesting and confirming upgrades through the trailer.

use boot::{set_confirmed, set_pending, BootFlag, MagicState, SwapType, Trailer};
use simflash::{styles, SimFlash};
use storage::ReadFlash;

fn slot(layout: &styles::AreaLayout) -> (SimFlash, Trailer) {
    let flash = layout.build().unwrap();
    let trailer = Trailer::swap(flash.capacity(), 8, 64 * 3, 0);
    (flash, trailer)
}

#[test]
fn pending_once() {
    let (mut flash, trailer) = slot(&styles::K64_SLOT);
    set_pending(&trailer, &mut flash, 0, false).unwrap();
    let state = trailer.read_swap_state(&mut flash).unwrap();
    assert_eq!(state.magic, MagicState::Good);
    assert_eq!(state.swap_type, SwapType::Test);
    assert_eq!(state.image_ok, BootFlag::Unset);
    assert_eq!(state.copy_done, BootFlag::Unset);

    // Asking again changes nothing.
    let ops = flash.rail().ops();
    set_pending(&trailer, &mut flash, 0, true).unwrap();
    assert_eq!(flash.rail().ops(), ops);
    assert_eq!(trailer.read_swap_state(&mut flash).unwrap().image_ok, BootFlag::Unset);
}

#[test]
fn pending_permanent() {
    let (mut flash, trailer) = slot(&styles::K64_SLOT);
    set_pending(&trailer, &mut flash, 3, true).unwrap();
    let state = trailer.read_swap_state(&mut flash).unwrap();
    assert_eq!(state.swap_type, SwapType::Perm);
    assert_eq!(state.image_num, 3);
    assert_eq!(state.image_ok, BootFlag::Set);
    // Magic, image ok and swap info.
    assert_eq!(flash.rail().writes(), 3);
}

#[test]
fn pending_over_garbage() {
    for layout in [&styles::K64_SLOT, &styles::MRAM_SLOT] {
        let (mut flash, trailer) = slot(layout);
        flash.install(&[0x5a; 16], trailer.magic_off()).unwrap();
        assert_eq!(trailer.read_swap_state(&mut flash).unwrap().magic, MagicState::Bad);
        assert_eq!(set_pending(&trailer, &mut flash, 0, false), Err(boot::Error::BadMagic));
        // The trailer was cleared, so the next request works.
        assert_eq!(trailer.read_swap_state(&mut flash).unwrap().magic, MagicState::Unset);
        set_pending(&trailer, &mut flash, 0, false).unwrap();
        assert_eq!(trailer.read_swap_state(&mut flash).unwrap().magic, MagicState::Good);
    }
}

#[test]
fn confirm() {
    let (mut flash, trailer) = slot(&styles::K64_SLOT);
    // Nothing was ever swapped in.
    set_confirmed(&trailer, &mut flash).unwrap();
    assert_eq!(flash.rail().ops(), 0);

    trailer.write_magic(&mut flash).unwrap();
    trailer.write_copy_done(&mut flash).unwrap();
    set_confirmed(&trailer, &mut flash).unwrap();
    let state = trailer.read_swap_state(&mut flash).unwrap();
    assert_eq!(state.image_ok, BootFlag::Set);
    let ops = flash.rail().ops();
    set_confirmed(&trailer, &mut flash).unwrap();
    assert_eq!(flash.rail().ops(), ops);

    let (mut flash, trailer) = slot(&styles::K64_SLOT);
    flash.install(&[0; 16], trailer.magic_off()).unwrap();
    assert_eq!(set_confirmed(&trailer, &mut flash), Err(boot::Error::BadMagic));
}

#[test]
fn large_alignment() {
    // Tagged magic, with each field in its own 32 byte unit.
    let mut flash = styles::STM32H_SLOT.build().unwrap();
    let trailer = Trailer::swap(flash.capacity(), 32, 4 * 3, 16);
    set_pending(&trailer, &mut flash, 1, false).unwrap();
    assert_eq!(&flash.contents()[trailer.magic_off()..trailer.magic_off() + 2], &[32, 0]);
    let state = trailer.read_swap_state(&mut flash).unwrap();
    assert_eq!(state.magic, MagicState::Good);
    assert_eq!(state.image_num, 1);
    assert_eq!(trailer.trailer_sz(), 32 + 3 * 32 + 32 + 2 * 32 + 12 * 32);
    trailer.write_swap_size(&mut flash, 0x1234).unwrap();
    assert_eq!(trailer.read_swap_size(&mut flash), Ok(0x1234));
}
