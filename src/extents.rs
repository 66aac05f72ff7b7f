//! Extent lists for `NBD_CMD_BLOCK_STATUS`.
//!
//! Mirrors `nbdkit_extents_new`/`nbdkit_add_extent`/`nbdkit_extents_full`
//! from `server/extents.c`: extents are kept in ascending, non-overlapping,
//! maximally-coalesced order, and a backend builds one up with repeated
//! calls to `add` rather than constructing the final vector directly.

use color_eyre::eyre::{bail, ensure, Result};

use crate::proto::BlockDescriptor;

/// nbdkit caps the number of extents a single reply may carry; we keep the
/// same limit so a pathological backend can't grow this list without bound.
pub const MAX_EXTENTS: usize = 1024 * 1024;

bitflags::bitflags! {
    /// Per-extent status flags (`base:allocation` context semantics).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtentFlags: u32 {
        const HOLE = 1 << 0;
        const ZERO = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub flags: ExtentFlags,
}

/// An ascending, coalesced, non-overlapping list of extents covering part
/// (or all) of a declared range `[start, end)`, built up one `add` call
/// at a time. `end` is a hard bound fixed at construction: adds are
/// truncated or dropped against it, and the list can never describe
/// anything outside it.
#[derive(Debug, Clone)]
pub struct Extents {
    /// Expected offset of the next `add`; out-of-order (gapped) adds
    /// past this are a contract violation.
    next: u64,
    /// Hard upper bound the list was declared to cover; `add` never
    /// produces an entry crossing it.
    limit: u64,
    entries: Vec<Extent>,
}

impl Extents {
    pub fn new(start: u64, end: u64) -> Self {
        Extents {
            next: start,
            limit: end.max(start),
            entries: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[Extent] {
        &self.entries
    }

    /// Range covered by the next call to `add`, i.e. one past the end of
    /// the last extent added (or the list's starting offset if empty).
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Declared upper bound of this list, fixed at construction.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Add one extent, following nbdkit's exact truncation/coalescing
    /// rules:
    ///
    /// - a zero-length extent, or one entirely before `self.next()`, is
    ///   silently ignored;
    /// - an extent that starts before `self.next()` is truncated to start
    ///   there;
    /// - an extent starting at or past `self.limit()` is silently
    ///   ignored; one crossing `self.limit()` is truncated to end there;
    /// - an extent starting strictly past `self.next()` (a gap) is a
    ///   contract violation;
    /// - adjacent extents with identical flags are merged into one;
    /// - the list never grows past `MAX_EXTENTS` entries.
    pub fn add(&mut self, mut offset: u64, mut length: u64, flags: ExtentFlags) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        if offset.checked_add(length).is_none() {
            bail!("extent offset + length overflows u64");
        }
        if offset + length <= self.next {
            // Entirely behind the cursor; ignore.
            return Ok(());
        }
        ensure!(
            offset <= self.next,
            "extent add at {offset} leaves a gap before expected offset {}",
            self.next
        );
        if offset < self.next {
            length -= self.next - offset;
            offset = self.next;
        }
        if offset >= self.limit {
            // Entirely past the declared range; ignore.
            return Ok(());
        }
        if offset + length > self.limit {
            length = self.limit - offset;
        }
        if length == 0 {
            return Ok(());
        }

        if let Some(last) = self.entries.last_mut() {
            if last.offset + last.length == offset && last.flags == flags {
                last.length += length;
                self.next = last.offset + last.length;
                return Ok(());
            }
        }

        ensure!(
            self.entries.len() < MAX_EXTENTS,
            "extent list exceeds {MAX_EXTENTS} entries"
        );
        self.next = offset + length;
        self.entries.push(Extent {
            offset,
            length,
            flags,
        });
        Ok(())
    }

    /// Convert to wire `BlockDescriptor`s. When `req_one` is set (the
    /// client passed `NBD_CMD_FLAG_REQ_ONE` or `NBD_CMD_FLAG_DF` on a
    /// single-extent request), only the first extent is returned, and its
    /// length is clamped to `count` (the request's own length) so a
    /// backend that over-reports past what was asked for can't hand the
    /// client a descriptor longer than its request, matching
    /// `extents_to_block_descriptors` in `server/protocol.c`.
    pub fn to_block_descriptors(&self, req_one: bool, count: u64) -> Vec<BlockDescriptor> {
        if req_one {
            return match self.entries.first() {
                Some(e) => vec![BlockDescriptor {
                    length: e.length.min(count) as u32,
                    status_flags: e.flags.bits(),
                }],
                None => vec![],
            };
        }
        self.entries
            .iter()
            .map(|e| BlockDescriptor {
                length: e.length as u32,
                status_flags: e.flags.bits(),
            })
            .collect()
    }
}

/// Re-query a backend one aligned chunk at a time, for backends (or
/// filters) that can only report status at a fixed granularity. Mirrors
/// `nbdkit_extents_aligned`: each underlying call's result is intersected
/// with `[offset, offset+length)` and ANDed onto the existing flags for
/// that sub-range before being folded into `out`.
pub fn extents_aligned<F>(
    offset: u64,
    length: u64,
    align: u64,
    out: &mut Extents,
    mut query: F,
) -> Result<()>
where
    F: FnMut(u64, u64) -> Result<Extents>,
{
    ensure!(align > 0, "alignment must be nonzero");
    let mut pos = offset;
    let end = offset + length;
    while pos < end {
        let aligned_start = pos - (pos % align);
        let aligned_len = align;
        let chunk = query(aligned_start, aligned_len)?;
        for e in chunk.as_slice() {
            let e_end = e.offset + e.length;
            let lo = e.offset.max(pos);
            let hi = e_end.min(end);
            if lo < hi {
                out.add(lo, hi - lo, e.flags)?;
            }
        }
        pos = aligned_start + aligned_len;
    }
    Ok(())
}

/// Keep calling a backend's `extents` hook (with `REQ_ONE` cleared) until
/// the returned list covers the whole requested range, asserting forward
/// progress each time. Mirrors `nbdkit_extents_full`.
pub fn extents_full<F>(offset: u64, length: u64, mut query: F) -> Result<Extents>
where
    F: FnMut(u64, u64) -> Result<Extents>,
{
    let end = offset + length;
    let mut out = Extents::new(offset, end);
    let mut pos = offset;
    while pos < end {
        let chunk = query(pos, end - pos)?;
        ensure!(
            chunk.next() > pos,
            "extents backend made no forward progress at offset {pos}"
        );
        for e in chunk.as_slice() {
            out.add(e.offset, e.length, e.flags)?;
        }
        pos = out.next().max(pos + 1);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_adjacent_same_flags() {
        let mut e = Extents::new(0, 1024);
        e.add(0, 512, ExtentFlags::empty()).unwrap();
        e.add(512, 512, ExtentFlags::empty()).unwrap();
        assert_eq!(e.len(), 1);
        assert_eq!(e.as_slice()[0].length, 1024);
    }

    #[test]
    fn does_not_coalesce_different_flags() {
        let mut e = Extents::new(0, 1024);
        e.add(0, 512, ExtentFlags::empty()).unwrap();
        e.add(512, 512, ExtentFlags::HOLE).unwrap();
        assert_eq!(e.len(), 2);
    }

    #[test]
    fn truncates_overlap_with_cursor() {
        let mut e = Extents::new(256, 1024);
        e.add(0, 512, ExtentFlags::empty()).unwrap();
        assert_eq!(e.len(), 1);
        assert_eq!(e.as_slice()[0].offset, 256);
        assert_eq!(e.as_slice()[0].length, 256);
    }

    #[test]
    fn ignores_extent_entirely_behind_cursor() {
        let mut e = Extents::new(1024, 2048);
        e.add(0, 512, ExtentFlags::empty()).unwrap();
        assert!(e.is_empty());
    }

    #[test]
    fn rejects_gapped_out_of_order_add() {
        let mut e = Extents::new(0, 1024);
        e.add(0, 256, ExtentFlags::empty()).unwrap();
        assert!(e.add(512, 256, ExtentFlags::empty()).is_err());
    }

    #[test]
    fn truncates_add_crossing_declared_end() {
        let mut e = Extents::new(0, 512);
        e.add(0, 1024, ExtentFlags::empty()).unwrap();
        assert_eq!(e.len(), 1);
        assert_eq!(e.as_slice()[0].length, 512);
    }

    #[test]
    fn ignores_add_entirely_past_declared_end() {
        let mut e = Extents::new(0, 512);
        e.add(0, 512, ExtentFlags::empty()).unwrap();
        e.add(512, 512, ExtentFlags::HOLE).unwrap();
        assert_eq!(e.len(), 1);
    }

    #[test]
    fn req_one_returns_single_descriptor() {
        let mut e = Extents::new(0, 1024);
        e.add(0, 512, ExtentFlags::empty()).unwrap();
        e.add(512, 512, ExtentFlags::HOLE).unwrap();
        assert_eq!(e.to_block_descriptors(true, 1024).len(), 1);
        assert_eq!(e.to_block_descriptors(false, 1024).len(), 2);
    }

    #[test]
    fn req_one_clamps_length_to_requested_count() {
        let mut e = Extents::new(0, 4096);
        e.add(0, 4096, ExtentFlags::empty()).unwrap();
        let d = e.to_block_descriptors(true, 512);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].length, 512);
    }
}
