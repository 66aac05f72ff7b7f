//! The backend chain: a plugin that actually stores bytes, optionally
//! wrapped by filters that each see the same trait object as the server
//! does. Grounded on nbdkit's `struct backend` (`server/internal.h`) and
//! `server/filters.c`, generalized from the teacher's single concrete
//! `Blocks` trait into an object-safe trait every link in the chain
//! implements.

mod filter;
mod plugin;

pub use filter::LoggingFilter;
pub use plugin::{Device, FileBlocks, MemBlocks};

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::concurrency::ThreadModel;
use crate::extents::Extents;

/// One link in the backend chain: a plugin (the innermost link, which
/// actually stores bytes) or a filter (which transforms requests before
/// passing them to the next link). Both are `Backend`; the server talks
/// to the chain only through this trait, never caring which is which.
///
/// All methods default to whatever makes sense for a read-only,
/// non-sparse backend, so a minimal plugin only needs to implement
/// `read_at`, `write_at`, and `size`.
pub trait Backend: Send + Sync {
    /// Human-readable name, used in `NBD_OPT_INFO`'s `NBD_INFO_NAME` and
    /// in log messages.
    fn name(&self) -> &str;

    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()>;

    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<()>;

    fn size(&self) -> io::Result<u64>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Discard the range `[off, off+len)`; permitted to be a no-op.
    fn trim(&self, _off: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// Write zeroes over `[off, off+len)`. The default implementation
    /// synthesizes it from `write_at`, which is correct but slow; a
    /// backend with a faster native path should override this.
    fn zero(&self, off: u64, len: u64) -> io::Result<()> {
        const CHUNK: usize = 64 * 1024;
        let zeroes = vec![0u8; CHUNK.min(len as usize).max(1)];
        let mut remaining = len;
        let mut pos = off;
        while remaining > 0 {
            let n = remaining.min(zeroes.len() as u64) as usize;
            self.write_at(&zeroes[..n], pos)?;
            pos += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Report allocation status for `[off, off+len)`. The default
    /// implementation reports the whole range as allocated, non-hole,
    /// non-zero data, which is always a conservative, correct answer.
    fn extents(&self, off: u64, len: u64, _req_one: bool) -> io::Result<Extents> {
        let mut e = Extents::new(off, off + len);
        e.add(off, len, crate::extents::ExtentFlags::empty())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(e)
    }

    fn can_write(&self) -> bool {
        true
    }

    fn can_trim(&self) -> bool {
        false
    }

    fn can_zero(&self) -> bool {
        true
    }

    fn can_extents(&self) -> bool {
        false
    }

    fn can_multi_conn(&self) -> bool {
        false
    }

    fn can_fast_zero(&self) -> bool {
        false
    }

    /// Whether `NBD_CMD_FLAG_FUA` is honoured on write-shaped commands.
    /// Defaults to `true`: a backend whose `write_at`/`zero`/`trim`
    /// complete synchronously has nothing extra to do for FUA.
    fn can_fua(&self) -> bool {
        true
    }

    /// Whether `NBD_CMD_FLUSH` does anything meaningful. Defaults to
    /// `true`, matching the default no-op `flush` above.
    fn can_flush(&self) -> bool {
        true
    }

    /// Whether `NBD_CMD_CACHE` is implemented as anything beyond "ignore
    /// it"; defaults to `false` since most backends have no separate
    /// cache layer to prime.
    fn can_cache(&self) -> bool {
        false
    }

    fn is_rotational(&self) -> bool {
        false
    }

    /// The name this backend would like to be listed under when a server
    /// is configured with `ExportList::use_default` and no explicit name,
    /// or `None` if it has no opinion. Mirrors the plugin `default_export`
    /// callback behind `backend_default_export`.
    fn default_export_name(&self, _readonly: bool) -> Option<String> {
        None
    }

    /// Declared thread model; the server takes the minimum across the
    /// whole chain (see `crate::concurrency::ThreadModel::min`).
    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }
}

/// Capability bits cached per `Context` so the dispatcher doesn't have to
/// re-probe the backend chain (a virtual call each) on every request.
/// Mirrors nbdkit's per-context `can_*` cache in `struct context`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    bits: u16,
}

const CAN_WRITE: u16 = 1 << 0;
const CAN_TRIM: u16 = 1 << 1;
const CAN_ZERO: u16 = 1 << 2;
const CAN_EXTENTS: u16 = 1 << 3;
const CAN_MULTI_CONN: u16 = 1 << 4;
const CAN_FAST_ZERO: u16 = 1 << 5;
const ROTATIONAL: u16 = 1 << 6;
const CAN_FUA: u16 = 1 << 7;
const CAN_FLUSH: u16 = 1 << 8;
const CAN_CACHE: u16 = 1 << 9;

impl Capabilities {
    pub fn probe(b: &dyn Backend) -> Self {
        let mut bits = 0u16;
        if b.can_write() {
            bits |= CAN_WRITE;
        }
        if b.can_trim() {
            bits |= CAN_TRIM;
        }
        if b.can_zero() {
            bits |= CAN_ZERO;
        }
        if b.can_extents() {
            bits |= CAN_EXTENTS;
        }
        if b.can_multi_conn() {
            bits |= CAN_MULTI_CONN;
        }
        if b.can_fast_zero() {
            bits |= CAN_FAST_ZERO;
        }
        if b.can_fua() {
            bits |= CAN_FUA;
        }
        if b.can_flush() {
            bits |= CAN_FLUSH;
        }
        if b.can_cache() {
            bits |= CAN_CACHE;
        }
        if b.is_rotational() {
            bits |= ROTATIONAL;
        }
        Capabilities { bits }
    }

    pub fn can_write(&self) -> bool {
        self.bits & CAN_WRITE != 0
    }
    pub fn can_trim(&self) -> bool {
        self.bits & CAN_TRIM != 0
    }
    pub fn can_zero(&self) -> bool {
        self.bits & CAN_ZERO != 0
    }
    pub fn can_extents(&self) -> bool {
        self.bits & CAN_EXTENTS != 0
    }
    pub fn can_multi_conn(&self) -> bool {
        self.bits & CAN_MULTI_CONN != 0
    }
    pub fn can_fua(&self) -> bool {
        self.bits & CAN_FUA != 0
    }
    pub fn can_flush(&self) -> bool {
        self.bits & CAN_FLUSH != 0
    }
    pub fn can_cache(&self) -> bool {
        self.bits & CAN_CACHE != 0
    }
    pub fn can_fast_zero(&self) -> bool {
        self.bits & CAN_FAST_ZERO != 0
    }
    pub fn is_rotational(&self) -> bool {
        self.bits & ROTATIONAL != 0
    }
}

/// One backend chain bound to one connection. Owns the capability cache
/// (probed once, at open time) and a coarse open/connected/failed state,
/// matching nbdkit's `HANDLE_OPEN`/`HANDLE_CONNECTED`/`HANDLE_FAILED`
/// bitmask in `struct context`.
pub struct Context {
    backend: Arc<dyn Backend>,
    caps: Capabilities,
    state: AtomicU8,
}

const STATE_OPEN: u8 = 1;
const STATE_CONNECTED: u8 = 2;
const STATE_FAILED: u8 = 4;

impl Context {
    pub fn open(backend: Arc<dyn Backend>) -> Self {
        let caps = Capabilities::probe(backend.as_ref());
        Context {
            backend,
            caps,
            state: AtomicU8::new(STATE_OPEN),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn caps(&self) -> Capabilities {
        self.caps
    }

    pub fn mark_connected(&self) {
        self.state.fetch_or(STATE_CONNECTED, Ordering::SeqCst);
    }

    pub fn mark_failed(&self) {
        self.state.fetch_or(STATE_FAILED, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.state.load(Ordering::SeqCst) & STATE_FAILED != 0
    }
}
