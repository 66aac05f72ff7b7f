//! Per-connection state: everything that outlives a single request but
//! is scoped to one client socket. Grounded on `struct connection` in
//! `server/internal.h`.

use std::collections::HashSet;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use crate::backend::Context;

/// Monotonically increasing connection status: a connection only ever
/// moves forward through these states, never back, matching nbdkit's
/// `enum conn_status` ordering (`STATUS_DEAD < STATUS_CLIENT_DONE <
/// STATUS_ACTIVE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Status {
    Dead = 0,
    ClientDone = 1,
    Active = 2,
}

/// Per-connection state shared between the handshake, dispatch, and
/// (in a threaded server) the worker handling this connection's
/// requests. One `Connection` is created per accepted socket and lives
/// until it's torn down.
pub struct Connection {
    /// Serializes requests on this connection alone, used when the
    /// backend chain's thread model is `SerializeRequests`.
    pub request_lock: Mutex<()>,
    /// Held for the duration of "read one request header (plus its write
    /// payload, if any)"; one worker reads at a time.
    pub read_lock: Mutex<()>,
    /// Held for the duration of writing one reply; one worker writes at
    /// a time. Independent of `read_lock` so a worker can be blocked
    /// reading the next request while another finishes writing a reply.
    pub write_lock: Mutex<()>,
    /// Guards `status` transitions and the decision to wake a blocked
    /// reader.
    status_lock: Mutex<Status>,
    /// A clone of the connection's socket, kept only to shut down its
    /// read (and, on the `ACTIVE` → `CLIENT_DONE` step, write) half from
    /// another thread. Stands in for nbdkit's self-pipe: a worker
    /// blocked in `read` on this fd sees the shutdown as EOF and wakes
    /// up to notice the new status.
    wakeup: Mutex<Option<TcpStream>>,
    /// Export name the client asked for with a bare `NBD_OPT_EXPORT_NAME`
    /// before any `NBD_OPT_SET_META_CONTEXT`; used to reject meta
    /// context negotiation against a different export name later in the
    /// same connection (see `finish_newstyle_options`'s mismatch check).
    export_name: Mutex<Option<String>>,
    /// Export name last named in an `NBD_OPT_SET_META_CONTEXT`/
    /// `NBD_OPT_LIST_META_CONTEXT`, tracked separately from
    /// `export_name` since those options can run repeatedly before any
    /// export is actually opened. Used to detect a client naming a
    /// different export than the one it eventually opens with
    /// `NBD_OPT_EXPORT_NAME`/`NBD_OPT_GO`, which invalidates any
    /// contexts negotiated against the earlier name.
    meta_context_export_name: Mutex<Option<String>>,
    pub handshake_complete: AtomicU8,
    pub using_tls: AtomicU8,
    pub structured_replies: AtomicU8,
    meta_contexts: Mutex<HashSet<u32>>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Connection {
            request_lock: Mutex::new(()),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            status_lock: Mutex::new(Status::Active),
            wakeup: Mutex::new(None),
            export_name: Mutex::new(None),
            meta_context_export_name: Mutex::new(None),
            handshake_complete: AtomicU8::new(0),
            using_tls: AtomicU8::new(0),
            structured_replies: AtomicU8::new(0),
            meta_contexts: Mutex::new(HashSet::new()),
        }
    }

    /// Remember a clone of the connection's socket so a later
    /// `advance_status` can shut down its read/write halves to interrupt
    /// a worker blocked in I/O. Must be called once, right after accept,
    /// before any worker starts reading.
    pub fn set_wakeup_socket(&self, stream: &TcpStream) -> std::io::Result<()> {
        *self.wakeup.lock().unwrap() = Some(stream.try_clone()?);
        Ok(())
    }

    pub fn status(&self) -> Status {
        *self.status_lock.lock().unwrap()
    }

    /// Lower the connection's status; a no-op if `new` would move it
    /// upwards. Connections start `Active` and only ever fall towards
    /// `ClientDone`/`Dead` (the monotonicity nbdkit's comment on
    /// `conn_status` documents). The `ACTIVE` → `CLIENT_DONE` step closes
    /// the write side; any step that lands on `Dead` wakes a reader
    /// blocked waiting for the next request.
    pub fn advance_status(&self, new: Status) {
        let mut guard = self.status_lock.lock().unwrap();
        if (new as u8) >= (*guard as u8) {
            return;
        }
        let old = *guard;
        *guard = new;
        drop(guard);

        let wakeup = self.wakeup.lock().unwrap();
        if let Some(stream) = wakeup.as_ref() {
            if old == Status::Active {
                let _ = stream.shutdown(Shutdown::Write);
            }
            if new == Status::Dead {
                let _ = stream.shutdown(Shutdown::Read);
            }
        }
    }

    pub fn set_export_name(&self, name: &str) {
        *self.export_name.lock().unwrap() = Some(name.to_string());
    }

    pub fn export_name(&self) -> Option<String> {
        self.export_name.lock().unwrap().clone()
    }

    /// Record the export name seen in a `SET_META_CONTEXT`/
    /// `LIST_META_CONTEXT` option, rejecting a mismatch against a name
    /// recorded earlier in the same way.
    pub fn meta_context_export_name(&self) -> Option<String> {
        self.meta_context_export_name.lock().unwrap().clone()
    }

    pub fn set_meta_context_export_name(&self, name: &str) {
        *self.meta_context_export_name.lock().unwrap() = Some(name.to_string());
    }

    /// Called once an export is actually opened via `EXPORT_NAME`/`GO`:
    /// if a different name was negotiated earlier through
    /// `SET_META_CONTEXT`, the contexts collected under that name no
    /// longer apply to this export and must be dropped.
    pub fn reconcile_meta_contexts(&self, opened: &str) {
        let mut prior = self.meta_context_export_name.lock().unwrap();
        if prior.as_deref().is_some_and(|p| p != opened) {
            self.meta_contexts.lock().unwrap().clear();
        }
        *prior = Some(opened.to_string());
    }

    pub fn add_meta_context(&self, id: u32) {
        self.meta_contexts.lock().unwrap().insert(id);
    }

    pub fn has_meta_context(&self, id: u32) -> bool {
        self.meta_contexts.lock().unwrap().contains(&id)
    }

    pub fn meta_context_count(&self) -> usize {
        self.meta_contexts.lock().unwrap().len()
    }

    pub fn is_structured_replies(&self) -> bool {
        self.structured_replies.load(Ordering::SeqCst) != 0
    }

    pub fn set_structured_replies(&self, on: bool) {
        self.structured_replies.store(on as u8, Ordering::SeqCst);
    }

    pub fn is_using_tls(&self) -> bool {
        self.using_tls.load(Ordering::SeqCst) != 0
    }

    pub fn set_using_tls(&self, on: bool) {
        self.using_tls.store(on as u8, Ordering::SeqCst);
    }

    /// Wipe state negotiated before a successful `NBD_OPT_STARTTLS`:
    /// `structured_replies`, the cached `base:allocation` meta context,
    /// and the export name remembered from `NBD_OPT_SET_META_CONTEXT`.
    /// Contexts are per-export, and everything negotiated before the
    /// upgrade happened outside the now-encrypted session.
    pub fn reset_after_tls(&self) {
        self.set_structured_replies(false);
        self.meta_contexts.lock().unwrap().clear();
        *self.export_name.lock().unwrap() = None;
        *self.meta_context_export_name.lock().unwrap() = None;
    }
}

/// A connection plus the backend chain context it negotiated during the
/// handshake. Bundled once `NBD_OPT_GO`/`NBD_OPT_EXPORT_NAME` resolves
/// an export, since from that point on every request needs both.
pub struct ActiveConnection {
    pub conn: Connection,
    pub ctx: Context,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_monotonic() {
        let c = Connection::new();
        assert_eq!(c.status(), Status::Active);
        c.advance_status(Status::ClientDone);
        assert_eq!(c.status(), Status::ClientDone);
        // Trying to move back up to Active must be rejected.
        c.advance_status(Status::Active);
        assert_eq!(c.status(), Status::ClientDone);
        c.advance_status(Status::Dead);
        assert_eq!(c.status(), Status::Dead);
    }

    #[test]
    fn meta_context_tracking() {
        let c = Connection::new();
        assert!(!c.has_meta_context(1));
        c.add_meta_context(1);
        assert!(c.has_meta_context(1));
        assert_eq!(c.meta_context_count(), 1);
    }

    #[test]
    fn dropping_to_dead_wakes_blocked_reader() {
        use std::io::Read;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let c = Connection::new();
        c.set_wakeup_socket(&server_side).unwrap();

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            server_side.read(&mut buf)
        });
        // Give the reader a moment to block in `read` before pulling the
        // socket out from under it.
        std::thread::sleep(std::time::Duration::from_millis(50));
        c.advance_status(Status::Dead);
        let result = reader.join().unwrap();
        // A shut-down read returns Ok(0) (EOF), not an error.
        assert_eq!(result.unwrap(), 0);
        drop(client);
    }

    #[test]
    fn reset_after_tls_clears_negotiated_state() {
        let c = Connection::new();
        c.set_structured_replies(true);
        c.add_meta_context(1);
        c.set_export_name("disk");

        c.reset_after_tls();

        assert!(!c.is_structured_replies());
        assert_eq!(c.meta_context_count(), 0);
        assert_eq!(c.export_name(), None);
    }
}
