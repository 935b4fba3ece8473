//! AsRaw gives a byte view over plain `repr(C)` structures.
//!
//! The image header and TLV headers sitting in flash are described by
//! `repr(C)` structs on the bootloader side.  Reading one from flash is done
//! by handing the mutable byte view of a default-initialized struct to the
//! flash driver.  `AsRaw` is safe, as viewing any initialized struct as bytes
//! is fine.  `AsMutRaw` is unsafe to implement, as the implementor promises
//! that every bit pattern is a valid value of every field.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::{mem, slice};

pub trait AsRaw: Sized {
    fn as_raw(&self) -> &[u8] {
        unsafe {
            slice::from_raw_parts(self as *const _ as *const u8,
                                  mem::size_of::<Self>())
        }
    }

    /// Size of the raw representation.
    fn raw_size() -> usize {
        mem::size_of::<Self>()
    }
}

/// Provide a mutable view into a structure.
///
/// # Safety
///
/// Only implement this for `repr(C)` structs whose fields accept every
/// possible bit pattern (integers and arrays of integers).
pub unsafe trait AsMutRaw: Sized {
    fn as_mut_raw(&mut self) -> &mut [u8] {
        unsafe {
            slice::from_raw_parts_mut(self as *mut _ as *mut u8,
                                      mem::size_of::<Self>())
        }
    }

    /// Fill this struct from the leading bytes of `bytes`.  Returns false,
    /// leaving the struct untouched, if there aren't enough bytes.
    fn fill_from(&mut self, bytes: &[u8]) -> bool {
        let len = mem::size_of::<Self>();
        if bytes.len() < len {
            return false;
        }
        self.as_mut_raw().copy_from_slice(&bytes[..len]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shaped like the TLV area info header: magic followed by length.
    #[derive(Debug, Default, Eq, PartialEq)]
    #[repr(C)]
    struct Info {
        magic: u16,
        len: u16,
    }

    impl AsRaw for Info {}
    unsafe impl AsMutRaw for Info {}

    /// A struct with interior padding.
    #[derive(Debug, Default, Eq, PartialEq)]
    #[repr(C)]
    struct Padded {
        a: u32,
        b: u8,
        c: u16,
    }

    impl AsRaw for Padded {}
    unsafe impl AsMutRaw for Padded {}

    #[test]
    fn info_bytes() {
        let info = Info { magic: 0x6907, len: 0x0028 };
        let raw = info.as_raw();
        assert_eq!(Info::raw_size(), 4);
        assert!(raw == [0x07, 0x69, 0x28, 0x00] || raw == [0x69, 0x07, 0x00, 0x28]);
    }

    #[test]
    fn fill_from_flash_bytes() {
        let mut info = Info::default();
        assert!(!info.fill_from(&[0x07, 0x69, 0x28]));
        assert_eq!(info, Info::default());

        assert!(info.fill_from(&[0x07, 0x69, 0x28, 0x00, 0xff, 0xff]));
        let little = Info { magic: 0x6907, len: 0x0028 };
        let big = Info { magic: 0x0769, len: 0x2800 };
        assert!(info == little || info == big);
    }

    #[test]
    fn padding_is_part_of_the_view() {
        let mut p = Padded::default();
        p.as_mut_raw().copy_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x54, 0xde, 0xab, 0xcd]);
        assert_eq!(p.b, 0x54);
        assert!(p.c == 0xabcd || p.c == 0xcdab);
        // The padding byte after `b` is carried in the raw view.
        assert_eq!(p.as_raw()[5], 0xde);
    }
}
