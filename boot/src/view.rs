//! Logical view of an image part way through a swap
//!
//! Once a swap has started, neither slot holds a whole image.  The pieces of
//! the image that started out in a slot are spread over the primary, the
//! secondary and the scratch area, in a pattern that depends only on the
//! strategy and on how far the swap got.  A `SwapView` stitches them back
//! together, so the header and TLV info of either image can be read with the
//! ordinary image code, without moving anything.

use core::cell::RefCell;

use storage::ReadFlash;

use crate::{
    config::MAX_IMG_SECTORS,
    image::{Image, ImageHeader},
    Error, Result,
};

/// The flash areas taking part in a swap.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Area {
    Primary = 0,
    Secondary = 1,
    Scratch = 2,
}

/// A run of the image that currently lives somewhere other than home.
#[derive(Debug, Clone, Copy)]
struct Segment {
    logical: usize,
    len: usize,
    area: Area,
    off: usize,
}

const MAX_SEGMENTS: usize = MAX_IMG_SECTORS + 4;

pub(crate) struct SwapView<'v, F> {
    areas: [Option<&'v RefCell<F>>; 3],
    /// Where bytes not covered by a segment are read.
    home: Area,
    home_base: usize,
    segments: heapless::Vec<Segment, MAX_SEGMENTS>,
}

impl<'v, F: ReadFlash> SwapView<'v, F> {
    /// A view of the image at `home_base` in `home`, with nothing moved.
    pub fn new(
        areas: [Option<&'v RefCell<F>>; 3],
        home: Area,
        home_base: usize,
    ) -> SwapView<'v, F> {
        SwapView { areas, home, home_base, segments: heapless::Vec::new() }
    }

    /// Record that `len` bytes of the image, starting at `logical`, are now
    /// at `off` in `area`.
    pub fn map(&mut self, logical: usize, len: usize, area: Area, off: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.segments
            .push(Segment { logical, len, area, off })
            .map_err(|_| Error::TooManySectors)
    }

    fn area(&self, area: Area) -> storage::Result<&'v RefCell<F>> {
        self.areas[area as usize].ok_or(storage::Error::OutOfBounds)
    }
}

impl<F: ReadFlash> ReadFlash for SwapView<'_, F> {
    fn read_size(&self) -> usize {
        self.area(self.home).map_or(1, |a| a.borrow().read_size())
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        let mut done = 0;
        while done < bytes.len() {
            let pos = offset + done;
            let seg = self.segments.iter().find(|s| s.logical <= pos && pos < s.logical + s.len);
            let (area, off, avail) = match seg {
                Some(s) => (s.area, s.off + (pos - s.logical), s.logical + s.len - pos),
                None => {
                    let next = self
                        .segments
                        .iter()
                        .filter(|s| s.logical > pos)
                        .map(|s| s.logical)
                        .min()
                        .unwrap_or(usize::MAX);
                    (self.home, self.home_base + pos, next - pos)
                }
            };
            let todo = (bytes.len() - done).min(avail);
            self.area(area)?.borrow_mut().read(off, &mut bytes[done..done + todo])?;
            done += todo;
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.area(self.home)
            .map_or(0, |a| a.borrow().capacity().saturating_sub(self.home_base))
    }
}

/// The header and full size of the image seen through `view`, if there is
/// a well formed one.
pub(crate) fn image_extent<R: ReadFlash>(view: R) -> Option<(ImageHeader, usize)> {
    let view = RefCell::new(view);
    let image = Image::from_flash(&view).ok()?;
    Some((image.header, image.full_image_size()))
}
