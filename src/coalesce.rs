//! # Read Coalescing
//!
//! Turns the registers that are due in a batch into one contiguous wire read.
//!
//! The policy is one span per due batch per cycle: the span runs from the
//! first due register's base address to the end of the last due register,
//! including any unused words in between. Extra words are cheap next to an
//! extra round trip on a serial line or gateway, and callers rely on the
//! span count being bounded by the number of batches.
//!
//! Batches themselves are formed once, when a device builds its register
//! list, by [`group_registers`]: an address-sorted list is cut wherever the
//! covering span would exceed [`MAX_READ_WORDS`].

use std::ops::Range;

use crate::register::Register;

/// Largest number of registers a single Modbus read (FC03/FC04) may return.
pub const MAX_READ_WORDS: u16 = 125;

/// A contiguous wire-address range `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSpan {
    pub start: u16,
    pub count: u16,
}

impl ReadSpan {
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }

    pub fn covers(&self, reg: &Register) -> bool {
        reg.base >= self.start && reg.end() <= self.end()
    }

    /// Offsets of `reg`'s words within a buffer read for this span.
    pub fn offsets(&self, reg: &Register) -> Range<usize> {
        let from = usize::from(reg.base - self.start);
        from..from + usize::from(reg.word_count())
    }
}

/// Compute the read span for the due registers of one batch.
///
/// `due` holds indices into `regs` in declaration order; it is not reordered.
/// The end is the furthest end among the due registers, which for
/// address-sorted, non-overlapping input is the last one's end.
/// Returns `None` when nothing is due.
pub fn coalesce(regs: &[Register], due: &[usize]) -> Option<ReadSpan> {
    let first = regs.get(*due.first()?)?;
    let end = due
        .iter()
        .filter_map(|&i| regs.get(i))
        .map(Register::end)
        .max()?;
    let count = u16::try_from(end - u32::from(first.base)).ok()?;
    Some(ReadSpan {
        start: first.base,
        count,
    })
}

/// Split an address-sorted register list into batches whose covering span
/// fits in one read.
pub fn group_registers(regs: &[Register]) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut end_addr = 0u32;

    for (i, reg) in regs.iter().enumerate() {
        if i > start {
            let span_start = u32::from(regs[start].base);
            let new_end = end_addr.max(reg.end());
            if new_end - span_start > u32::from(MAX_READ_WORDS) {
                batches.push(start..i);
                start = i;
                end_addr = reg.end();
                continue;
            }
            end_addr = new_end;
        } else {
            end_addr = reg.end();
        }
    }

    if start < regs.len() {
        batches.push(start..regs.len());
    }

    batches
}
