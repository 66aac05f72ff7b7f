//! A minimal filter, demonstrating the pattern: wrap the next link in the
//! chain, delegate everything, and add behavior around one or two calls.
//! Grounded on nbdkit's filter model (`server/filters.c`): a filter's
//! thread model is the minimum of its own and the next link's.

use std::io;
use std::sync::Arc;

use log::Level;

use crate::backend::Backend;
use crate::concurrency::ThreadModel;
use crate::extents::Extents;

/// Logs every read and write before delegating to the wrapped backend,
/// at `level` (debug by default, overridable with the `loggingfilter.level`
/// debug flag so an operator can turn up the noise on just this filter
/// without changing `RUST_LOG` globally).
pub struct LoggingFilter {
    next: Arc<dyn Backend>,
    level: Level,
}

impl LoggingFilter {
    pub fn new(next: Arc<dyn Backend>) -> Self {
        LoggingFilter {
            next,
            level: Level::Debug,
        }
    }

    pub fn with_level(next: Arc<dyn Backend>, level: Level) -> Self {
        LoggingFilter { next, level }
    }
}

impl Backend for LoggingFilter {
    fn name(&self) -> &str {
        self.next.name()
    }

    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        log::log!(self.level, "read {} bytes at {off}", buf.len());
        self.next.read_at(buf, off)
    }

    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<()> {
        log::log!(self.level, "write {} bytes at {off}", buf.len());
        self.next.write_at(buf, off)
    }

    fn size(&self) -> io::Result<u64> {
        self.next.size()
    }

    fn flush(&self) -> io::Result<()> {
        self.next.flush()
    }

    fn trim(&self, off: u64, len: u64) -> io::Result<()> {
        self.next.trim(off, len)
    }

    fn zero(&self, off: u64, len: u64) -> io::Result<()> {
        self.next.zero(off, len)
    }

    fn extents(&self, off: u64, len: u64, req_one: bool) -> io::Result<Extents> {
        self.next.extents(off, len, req_one)
    }

    fn can_write(&self) -> bool {
        self.next.can_write()
    }

    fn can_trim(&self) -> bool {
        self.next.can_trim()
    }

    fn can_zero(&self) -> bool {
        self.next.can_zero()
    }

    fn can_extents(&self) -> bool {
        self.next.can_extents()
    }

    fn can_multi_conn(&self) -> bool {
        self.next.can_multi_conn()
    }

    fn can_fast_zero(&self) -> bool {
        self.next.can_fast_zero()
    }

    fn can_fua(&self) -> bool {
        self.next.can_fua()
    }

    fn can_flush(&self) -> bool {
        self.next.can_flush()
    }

    fn can_cache(&self) -> bool {
        self.next.can_cache()
    }

    fn is_rotational(&self) -> bool {
        self.next.is_rotational()
    }

    fn thread_model(&self) -> ThreadModel {
        // A filter never relaxes the model the next link declared; here it
        // doesn't tighten it either, so the effective model is whatever
        // the next link requires.
        ThreadModel::Parallel.min(self.next.thread_model())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBlocks;

    #[test]
    fn delegates_size() {
        let inner = Arc::new(MemBlocks::new("t", 4096));
        let filter = LoggingFilter::new(inner);
        assert_eq!(filter.size().unwrap(), 4096);
    }
}
