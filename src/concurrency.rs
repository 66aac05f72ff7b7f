//! Thread models and the locks that implement them.
//!
//! A backend chain (the single plugin plus whatever filters sit in front
//! of it) declares how much concurrency it can tolerate; the server takes
//! the most conservative declaration across the whole chain and enforces
//! it with a small set of global locks. This is a direct port of
//! `server/locks.c`: the mutexes there are replaced with their
//! `std::sync` equivalents, and "the current connection" is passed
//! explicitly instead of being pulled from thread-local storage.

use std::sync::{Condvar, Mutex, RwLock};

/// How much concurrency a backend chain supports, ordered from most to
/// least restrictive. Numeric order matters: `min` across a chain is a
/// plain integer minimum, exactly as `filter_thread_model` computes it.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum ThreadModel {
    /// Only one connection may be open, and all of its requests run
    /// serialized.
    SerializeConnections = 0,
    /// Multiple connections may be open, but only one request across all
    /// of them runs at a time.
    SerializeAllRequests = 1,
    /// Multiple connections may be open, and each may have many requests
    /// in flight, but only one request per connection runs at a time.
    SerializeRequests = 2,
    /// No serialization; the backend handles its own locking.
    Parallel = 3,
}

impl ThreadModel {
    /// A backend chain's effective model is the minimum (most
    /// restrictive) of its own declaration and the next link's, exactly
    /// as `filter_thread_model` in `server/filters.c` computes it.
    pub fn min(self, other: ThreadModel) -> ThreadModel {
        if (self as u8) <= (other as u8) {
            self
        } else {
            other
        }
    }
}

impl Ord for ThreadModel {
    fn cmp(&self, other: &ThreadModel) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl Eq for ThreadModel {}

/// Global locks implementing a [`ThreadModel`]. One instance is shared by
/// the whole server; each connection additionally owns its own
/// `request_lock` (see `crate::connection::Connection`) for the
/// `SerializeRequests` case.
pub struct Locks {
    model: ThreadModel,
    connection_lock: Mutex<()>,
    all_requests_lock: Mutex<()>,
    unload_prevention_lock: RwLock<()>,
    quit: Mutex<bool>,
    quit_cond: Condvar,
}

/// RAII guard held for the duration of one connection's handshake and
/// transmission phase, when the model requires connections to be
/// serialized.
pub struct ConnectionGuard<'a>(Option<std::sync::MutexGuard<'a, ()>>);

/// RAII guard held for the duration of one request, composed from
/// whichever of the all-requests lock, the per-connection request lock,
/// and the unload-prevention read lock the model requires.
pub struct RequestGuard<'a> {
    _all: Option<std::sync::MutexGuard<'a, ()>>,
    _unload: std::sync::RwLockReadGuard<'a, ()>,
}

impl Locks {
    pub fn new(model: ThreadModel) -> Self {
        log::debug!("using thread model: {model:?}");
        Locks {
            model,
            connection_lock: Mutex::new(()),
            all_requests_lock: Mutex::new(()),
            unload_prevention_lock: RwLock::new(()),
            quit: Mutex::new(false),
            quit_cond: Condvar::new(),
        }
    }

    pub fn model(&self) -> ThreadModel {
        self.model
    }

    pub fn lock_connection(&self) -> ConnectionGuard<'_> {
        if self.model <= ThreadModel::SerializeConnections {
            ConnectionGuard(Some(self.connection_lock.lock().unwrap()))
        } else {
            ConnectionGuard(None)
        }
    }

    /// Acquire the locks required before processing one request. The
    /// per-connection request lock (needed only for `SerializeRequests`)
    /// is the caller's responsibility since it lives on `Connection`, not
    /// here; `lock_request` only covers the locks that are global to the
    /// whole server.
    pub fn lock_request(&self) -> RequestGuard<'_> {
        let all = (self.model <= ThreadModel::SerializeAllRequests)
            .then(|| self.all_requests_lock.lock().unwrap());
        let unload = self.unload_prevention_lock.read().unwrap();
        RequestGuard {
            _all: all,
            _unload: unload,
        }
    }

    /// Block new requests from starting and wait for in-flight ones to
    /// finish, for use around operations that must observe a quiescent
    /// server (e.g. an unload or reconfiguration barrier).
    pub fn lock_unload(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.unload_prevention_lock.write().unwrap()
    }

    pub fn request_quit(&self) {
        *self.quit.lock().unwrap() = true;
        self.quit_cond.notify_all();
    }

    pub fn quit_requested(&self) -> bool {
        *self.quit.lock().unwrap()
    }

    /// Block until `request_quit` is called, or return immediately if it
    /// already was.
    pub fn wait_for_quit(&self) {
        let guard = self.quit.lock().unwrap();
        let _unused = self.quit_cond.wait_while(guard, |q| !*q).unwrap();
    }
}

impl PartialOrd<ThreadModel> for ThreadModel {
    fn partial_cmp(&self, other: &ThreadModel) -> Option<std::cmp::Ordering> {
        Some((*self as u8).cmp(&(*other as u8)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_picks_more_restrictive_model() {
        assert_eq!(
            ThreadModel::Parallel.min(ThreadModel::SerializeRequests),
            ThreadModel::SerializeRequests
        );
    }

    #[test]
    fn quit_wakes_waiter() {
        let locks = std::sync::Arc::new(Locks::new(ThreadModel::Parallel));
        let l2 = locks.clone();
        let handle = std::thread::spawn(move || l2.wait_for_quit());
        locks.request_quit();
        handle.join().unwrap();
        assert!(locks.quit_requested());
    }
}
