//! Per-thread scratch state.
//!
//! Each worker thread gets a name (for log messages), a last-error slot a
//! backend can set from deep inside a call stack without plumbing a
//! `Result` through every hook, and a growable scratch buffer reused
//! across requests to avoid an allocation per I/O. Mirrors
//! `server/threadlocal.c`'s `pthread_key`-based `struct threadlocal`.

use std::cell::{Cell, RefCell};

thread_local! {
    static NAME: RefCell<String> = const { RefCell::new(String::new()) };
    static INSTANCE_NUM: Cell<usize> = const { Cell::new(0) };
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
    static BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Set this thread's debug name (typically `"conn{n}"`), used as a log
/// prefix.
pub fn set_name(name: impl Into<String>, instance_num: usize) {
    NAME.with(|n| *n.borrow_mut() = name.into());
    INSTANCE_NUM.with(|i| i.set(instance_num));
}

pub fn name() -> String {
    NAME.with(|n| n.borrow().clone())
}

pub fn instance_num() -> usize {
    INSTANCE_NUM.with(|i| i.get())
}

/// Record the last error seen on this thread, for callers that need to
/// surface a backend failure without threading it through every return
/// value (nbdkit plugins use `nbdkit_set_error` the same way).
pub fn set_last_error(msg: impl Into<String>) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg.into()));
}

pub fn take_last_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

/// Borrow this thread's scratch buffer, growing (never shrinking) it to
/// at least `len` bytes first. Only the newly-grown tail is zeroed, not
/// the whole buffer, matching `threadlocal_buffer`'s realloc discipline.
pub fn with_buffer<R>(len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
    BUFFER.with(|b| {
        let mut buf = b.borrow_mut();
        if buf.len() < len {
            buf.resize(len, 0);
        }
        f(&mut buf[..len])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_grows_but_does_not_shrink() {
        with_buffer(16, |b| assert_eq!(b.len(), 16));
        with_buffer(4, |b| assert_eq!(b.len(), 4));
        with_buffer(32, |b| assert_eq!(b.len(), 32));
    }

    #[test]
    fn last_error_round_trips() {
        assert!(take_last_error().is_none());
        set_last_error("boom");
        assert_eq!(take_last_error().as_deref(), Some("boom"));
        assert!(take_last_error().is_none());
    }
}
