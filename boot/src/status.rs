//! Image upgrade status
//!
//! A swap proceeds a chunk at a time, and each chunk goes through a small
//! number of states.  After the flash operations of a state are complete, an
//! entry is written to the status area of the trailer holding the status.
//! Entries are written in order and never rewritten, so the number of entries
//! written is the position the swap has reached.
//!
//! Entry layout, in units of the write alignment:
//!
//! ```text
//! scratch:  (idx - 1) * 3 + (state - 1)
//! offset:   (idx - 1) * 2 + (state - 1)
//! move:     move entries, (idx - 1), for each of max sectors
//!           then swap entries, max + (idx - 1) * 2 + (state - 1)
//! ```
//!
//! Where the status is kept depends on what is in flight.  The first chunk
//! of a scratch swap may have to overwrite the primary trailer, so its status
//! lives in the scratch trailer until that chunk is done.  Every other chunk,
//! and every chunk of the other strategies, keeps its status in the primary
//! trailer.  The table below picks the source from the state of the two
//! trailers.
//!
//! ```text
//! +---------------+---------------+-------------+-------------+
//! | primary magic | scratch magic | copy done   | source      |
//! +---------------+---------------+-------------+-------------+
//! | good          | not good      | set         | none        |
//! | good          | not good      | unset       | primary     |
//! | any           | good          | any         | scratch     |
//! | unset         | any           | unset       | primary     |
//! +---------------+---------------+-------------+-------------+
//! ```

use storage::Flash;

use crate::{
    config::Strategy,
    enc::KeyEnvelope,
    trailer::{
        flag_compatible_check, magic_compatible_check, BootFlag, MagicState, SwapState, SwapType,
        Trailer,
    },
    Error, Result,
};

/// Which kind of step a status entry describes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StatusOp {
    /// Moving the primary image up a sector.
    Move = 1,
    Swap = 2,
}

/// Where the status of an interrupted swap was found.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StatusSource {
    None,
    Scratch,
    Primary,
}

/// The progress of a swap, reconstructed from flash at boot.
#[derive(Debug, Clone)]
pub struct BootStatus {
    /// Chunk being worked on, starting at 1.
    pub idx: u32,
    /// The next state to perform within the chunk, starting at 1.
    pub state: u8,
    pub op: StatusOp,
    /// The status of the current chunk is in the scratch area.
    pub use_scratch: bool,
    pub swap_type: SwapType,
    pub swap_size: u32,
    pub source: StatusSource,
    /// Working keys of both slots.
    pub keys: KeyEnvelope,
}

impl BootStatus {
    /// Status of a swap that hasn't started.
    pub fn reset(strategy: Strategy) -> BootStatus {
        BootStatus {
            idx: 1,
            state: 1,
            op: initial_op(strategy),
            use_scratch: false,
            swap_type: SwapType::None,
            swap_size: 0,
            source: StatusSource::None,
            keys: KeyEnvelope::default(),
        }
    }

    pub fn is_reset(&self, strategy: Strategy) -> bool {
        self.op == initial_op(strategy) && self.idx == 1 && self.state == 1
    }

    /// Index of the entry for the current state, in units of the write
    /// alignment from the start of the status area.
    pub fn internal_off(&self, strategy: Strategy, max_entries: usize) -> usize {
        let idx = self.idx as usize - 1;
        let state = self.state as usize - 1;
        match (strategy, self.op) {
            (Strategy::SwapMove, StatusOp::Move) => idx,
            (Strategy::SwapMove, StatusOp::Swap) => max_entries + idx * 2 + state,
            _ => idx * strategy.state_count() + state,
        }
    }

    /// Record that the current state has completed.
    pub fn write<F: Flash>(
        &self,
        trailer: &Trailer,
        flash: &mut F,
        strategy: Strategy,
    ) -> Result<()> {
        let max_entries = trailer.status_entries() / strategy.state_count();
        let index = self.internal_off(strategy, max_entries);
        if index >= trailer.status_entries() {
            return Err(Error::TooManySectors);
        }
        log::debug!("status: idx={} state={} op={:?}", self.idx, self.state, self.op);
        trailer.write_trailer_flag(flash, trailer.status_entry_off(index), self.state)
    }
}

fn initial_op(strategy: Strategy) -> StatusOp {
    match strategy {
        Strategy::SwapMove => StatusOp::Move,
        _ => StatusOp::Swap,
    }
}

struct StatusTable {
    magic_primary: MagicState,
    magic_scratch: MagicState,
    copy_done_primary: BootFlag,
    source: StatusSource,
}

const STATUS_TABLES: [StatusTable; 4] = [
    StatusTable {
        magic_primary: MagicState::Good,
        magic_scratch: MagicState::NotGood,
        copy_done_primary: BootFlag::Set,
        source: StatusSource::None,
    },
    StatusTable {
        magic_primary: MagicState::Good,
        magic_scratch: MagicState::NotGood,
        copy_done_primary: BootFlag::Unset,
        source: StatusSource::Primary,
    },
    StatusTable {
        magic_primary: MagicState::Any,
        magic_scratch: MagicState::Good,
        copy_done_primary: BootFlag::Any,
        source: StatusSource::Scratch,
    },
    StatusTable {
        magic_primary: MagicState::Unset,
        magic_scratch: MagicState::Any,
        copy_done_primary: BootFlag::Unset,
        source: StatusSource::Primary,
    },
];

/// Decide which trailer holds the status of the current image.  A scratch
/// trailer belonging to another image is ignored.
pub fn status_source(
    primary: &SwapState,
    scratch: Option<&SwapState>,
    image_num: u8,
) -> StatusSource {
    let scratch_magic = scratch.map_or(MagicState::Unset, |s| s.magic);
    for table in &STATUS_TABLES {
        if magic_compatible_check(table.magic_primary, primary.magic)
            && magic_compatible_check(table.magic_scratch, scratch_magic)
            && flag_compatible_check(table.copy_done_primary, primary.copy_done)
        {
            if table.source == StatusSource::Scratch
                && scratch.map(|s| s.image_num) != Some(image_num)
            {
                return StatusSource::None;
            }
            log::debug!("Status source: {:?}", table.source);
            return table.source;
        }
    }
    StatusSource::None
}

/// Count the written entries in a run of the status area.  They must form
/// an unbroken prefix.
fn written_prefix<F: Flash>(
    trailer: &Trailer,
    flash: &mut F,
    first: usize,
    count: usize,
) -> Result<usize> {
    let erased = flash.erased_val();
    let mut written = 0;
    let mut gap = false;
    let mut buf = [0u8; 1];
    for index in first..first + count {
        flash.read(trailer.status_entry_off(index), &mut buf)?;
        if buf[0] == erased {
            gap = true;
        } else if gap {
            log::error!("Status entries are not contiguous");
            return Err(Error::BadStatus);
        } else {
            written += 1;
        }
    }
    Ok(written)
}

/// Read the status entries of a trailer, giving the step to resume at as
/// `(op, idx, state)`.  None means no entries are written.
pub fn read_position<F: Flash>(
    trailer: &Trailer,
    flash: &mut F,
    strategy: Strategy,
) -> Result<Option<(StatusOp, u32, u8)>> {
    let states = strategy.state_count();
    let entries = trailer.status_entries();
    if strategy == Strategy::SwapMove {
        let max = entries / states;
        let moved = written_prefix(trailer, flash, 0, max)?;
        let swapped = written_prefix(trailer, flash, max, entries - max)?;
        if swapped > 0 {
            return Ok(Some((StatusOp::Swap, (swapped / 2 + 1) as u32, (swapped % 2 + 1) as u8)));
        }
        if moved > 0 {
            return Ok(Some((StatusOp::Move, (moved + 1) as u32, 1)));
        }
        return Ok(None);
    }
    let done = written_prefix(trailer, flash, 0, entries)?;
    if done == 0 {
        return Ok(None);
    }
    Ok(Some((StatusOp::Swap, (done / states + 1) as u32, (done % states + 1) as u8)))
}

#[cfg(test)]
mod tests {
    use simflash::SimFlash;
    use storage::ReadFlash;

    use super::*;

    fn state(magic: MagicState, copy_done: BootFlag, image_num: u8) -> SwapState {
        SwapState {
            magic,
            swap_type: SwapType::Test,
            copy_done,
            image_ok: BootFlag::Unset,
            image_num,
        }
    }

    #[test]
    fn sources() {
        use BootFlag as F;
        use MagicState as M;
        let cases = [
            (state(M::Good, F::Set, 0), None, StatusSource::None),
            (state(M::Good, F::Unset, 0), None, StatusSource::Primary),
            (state(M::Good, F::Unset, 0), Some(state(M::Bad, F::Unset, 0)), StatusSource::Primary),
            (state(M::Bad, F::Unset, 0), Some(state(M::Good, F::Unset, 0)), StatusSource::Scratch),
            (state(M::Good, F::Unset, 0), Some(state(M::Good, F::Unset, 1)), StatusSource::None),
            (state(M::Unset, F::Unset, 0), None, StatusSource::Primary),
            (state(M::Bad, F::Unset, 0), None, StatusSource::None),
        ];
        for (primary, scratch, expect) in cases {
            assert_eq!(status_source(&primary, scratch.as_ref(), 0), expect);
        }
    }

    #[test]
    fn entry_offsets() {
        let mut bs = BootStatus::reset(Strategy::SwapMove);
        assert!(bs.is_reset(Strategy::SwapMove));
        bs.idx = 3;
        assert_eq!(bs.internal_off(Strategy::SwapMove, 32), 2);
        bs.op = StatusOp::Swap;
        bs.state = 2;
        assert_eq!(bs.internal_off(Strategy::SwapMove, 32), 32 + 4 + 1);
        assert_eq!(bs.internal_off(Strategy::SwapScratch, 32), 7);
        assert_eq!(bs.internal_off(Strategy::SwapOffset, 32), 5);
        assert!(!BootStatus::reset(Strategy::SwapMove).is_reset(Strategy::SwapScratch));
    }

    #[test]
    fn position_follows_entries() {
        let mut flash = SimFlash::new(1, 8, 4096, 4).unwrap();
        let trailer = Trailer::swap(flash.capacity(), 8, 8 * 3, 0);
        assert_eq!(read_position(&trailer, &mut flash, Strategy::SwapScratch), Ok(None));

        let mut bs = BootStatus::reset(Strategy::SwapScratch);
        for (idx, st) in [(1, 1), (1, 2), (1, 3), (2, 1)] {
            bs.idx = idx;
            bs.state = st;
            bs.write(&trailer, &mut flash, Strategy::SwapScratch).unwrap();
        }
        let position = read_position(&trailer, &mut flash, Strategy::SwapScratch);
        assert_eq!(position, Ok(Some((StatusOp::Swap, 2, 2))));

        // An entry past a hole is corruption.
        bs.idx = 3;
        bs.state = 1;
        bs.write(&trailer, &mut flash, Strategy::SwapScratch).unwrap();
        let position = read_position(&trailer, &mut flash, Strategy::SwapScratch);
        assert_eq!(position, Err(Error::BadStatus));
    }

    #[test]
    fn move_position() {
        let mut flash = SimFlash::new(1, 4, 1024, 8).unwrap();
        let trailer = Trailer::swap(flash.capacity(), 4, 8 * 3, 0);
        let mut bs = BootStatus::reset(Strategy::SwapMove);
        bs.write(&trailer, &mut flash, Strategy::SwapMove).unwrap();
        bs.idx = 2;
        bs.write(&trailer, &mut flash, Strategy::SwapMove).unwrap();
        let position = read_position(&trailer, &mut flash, Strategy::SwapMove);
        assert_eq!(position, Ok(Some((StatusOp::Move, 3, 1))));

        bs.op = StatusOp::Swap;
        bs.idx = 1;
        bs.write(&trailer, &mut flash, Strategy::SwapMove).unwrap();
        let position = read_position(&trailer, &mut flash, Strategy::SwapMove);
        assert_eq!(position, Ok(Some((StatusOp::Swap, 1, 2))));
    }
}
