//! The listener: accepts connections, negotiates protocol version and
//! export, then spawns a worker to serve requests until the client
//! disconnects.
//!
//! Generalizes the teacher's single-threaded accept loop into a worker
//! pool sized by the backend chain's [`ThreadModel`](crate::concurrency::ThreadModel),
//! following `server/connections.c`'s division of labour: the listener
//! thread only accepts and hands off, never touches request data.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::{error, info, warn};

use crate::backend::Context;
use crate::concurrency::{Locks, ThreadModel};
use crate::connection::{Connection, Status};
use crate::dispatch::{handle_request, Handled};
use crate::handshake::{self, ExportResolver, HandshakePolicy};
use crate::proto::{Request, DEFAULT_PORT, MAX_REQUEST_SIZE};
use crate::threadlocal;
use crate::tls::{ReadWrite, TlsProvider};

/// Default size of a connection's worker pool; a more restrictive thread
/// model is enforced with locks rather than by shrinking the pool, so
/// every connection gets the same number of workers regardless of what
/// the backend chain declares.
pub const DEFAULT_WORKERS: usize = 16;

/// Ties together a resolved export list, the negotiated concurrency
/// policy, and (optionally) a TLS provider, then serves connections
/// until told to stop.
pub struct Server<R: ExportResolver + Send + Sync + 'static> {
    resolver: Arc<R>,
    locks: Arc<Locks>,
    tls: Option<Arc<dyn TlsProvider>>,
    tls_required: bool,
    workers: usize,
    next_conn_id: AtomicUsize,
}

impl<R: ExportResolver + Send + Sync + 'static> Server<R> {
    /// Build a server over `resolver`, declaring the backend chain's
    /// thread model up front (in a real chain this would be probed from
    /// the loaded backend; single-export deployments know it statically).
    pub fn new(resolver: R, model: ThreadModel) -> Self {
        Server {
            resolver: Arc::new(resolver),
            locks: Arc::new(Locks::new(model)),
            tls: None,
            tls_required: false,
            workers: DEFAULT_WORKERS,
            next_conn_id: AtomicUsize::new(0),
        }
    }

    /// Install a TLS provider for `NBD_OPT_STARTTLS`. `required` also
    /// gates every other option behind a completed TLS handshake.
    pub fn with_tls(mut self, provider: Arc<dyn TlsProvider>, required: bool) -> Self {
        self.tls = Some(provider);
        self.tls_required = required;
        self
    }

    /// Override the per-connection worker pool size (default
    /// [`DEFAULT_WORKERS`]).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    fn handle_connection(&self, stream: TcpStream, conn_id: usize) -> Result<()> {
        threadlocal::set_name(format!("conn{conn_id}"), conn_id);
        stream.set_nodelay(true)?;
        let _guard = self.locks.lock_connection();

        let conn = Arc::new(Connection::new());
        conn.set_wakeup_socket(&stream)
            .wrap_err("cloning socket for status wakeup")?;
        let mut boxed: Box<dyn ReadWrite> = Box::new(stream);

        let flags = handshake::initial_newstyle(&mut *boxed).wrap_err("initial handshake")?;
        let policy = HandshakePolicy {
            tls: self.tls.as_deref(),
            tls_required: self.tls_required,
        };
        let negotiated = handshake::newstyle_haggle(boxed, flags, self.resolver.as_ref(), &conn, &policy)
            .wrap_err("handshake haggling")?;

        let Some(negotiated) = negotiated else {
            info!("client aborted handshake");
            return Ok(());
        };
        negotiated.ctx.mark_connected();
        info!("handshake finished, serving export {:?}", negotiated.ctx.backend().name());

        self.serve_requests(negotiated.stream, negotiated.ctx, conn)
            .wrap_err("serving requests")
    }

    /// Spawn this connection's worker pool and block until every worker
    /// has exited (the client disconnected, a framing error killed the
    /// connection, or another worker's error dropped its status to
    /// `Dead`, waking everyone else still blocked in `read`).
    fn serve_requests(
        &self,
        stream: Box<dyn ReadWrite>,
        ctx: Context,
        conn: Arc<Connection>,
    ) -> Result<()> {
        let stream = Arc::new(Mutex::new(stream));
        let ctx = Arc::new(ctx);
        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let stream = stream.clone();
            let ctx = ctx.clone();
            let conn = conn.clone();
            let locks = self.locks.clone();
            handles.push(thread::spawn(move || worker_loop(stream, ctx, conn, locks)));
        }
        for h in handles {
            if let Err(e) = h.join() {
                error!("worker thread panicked: {e:?}");
            }
        }
        Ok(())
    }

    /// Bind `addr` and serve connections until the process exits. Each
    /// accepted connection gets its own thread; the backend chain's
    /// [`ThreadModel`] (enforced via `self.locks`) bounds how much of
    /// that concurrency actually reaches the backend, not the listener.
    pub fn start(self, host: &str, port: u16) -> Result<()> {
        let listener = TcpListener::bind((host, port)).wrap_err("binding listener")?;
        info!("listening on {host}:{port}");
        let server = Arc::new(self);
        let mut handles = vec![];
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            let server = server.clone();
            let conn_id = server.next_conn_id.fetch_add(1, Ordering::SeqCst);
            handles.retain(|h: &thread::JoinHandle<()>| !h.is_finished());
            handles.push(thread::spawn(move || {
                if let Err(e) = server.handle_connection(stream, conn_id) {
                    error!("connection {conn_id} failed: {e:?}");
                }
            }));
        }
        for h in handles {
            let _ = h.join();
        }
        Ok(())
    }
}

/// One worker's share of a connection's request loop: read one request
/// under the read lock, run it to completion and write its reply under
/// the write lock, repeat until the client disconnects or the
/// connection's status falls to `Dead`. Multiple workers run this
/// concurrently against the same connection, contending only on
/// `conn`'s locks and the thread model's global locks.
fn worker_loop(
    stream: Arc<Mutex<Box<dyn ReadWrite>>>,
    ctx: Arc<Context>,
    conn: Arc<Connection>,
    locks: Arc<Locks>,
) {
    loop {
        if conn.status() != Status::Active {
            return;
        }

        let req = {
            let _read_guard = conn.read_lock.lock().unwrap();
            if conn.status() != Status::Active {
                return;
            }
            let mut stream = stream.lock().unwrap();
            threadlocal::with_buffer(MAX_REQUEST_SIZE as usize, |buf| {
                Request::get(&mut **stream, buf)
            })
        };
        let req = match req {
            Ok(r) => r,
            Err(e) => {
                // A client that just hangs up looks like an I/O error
                // reading the next request header (or the socket was
                // shut down by another worker noticing `Dead`); treat it
                // as a clean disconnect rather than a hard failure.
                info!("connection closed: {e}");
                conn.advance_status(Status::Dead);
                return;
            }
        };

        // The backend call and the reply it produces are what the
        // thread model serializes, matching `lock_request`/
        // `unlock_request` bracketing `handle_request` in
        // `server/protocol.c`; the write lock on top of that keeps two
        // workers from interleaving their replies on the wire.
        let _all_guard = locks.lock_request();
        let _request_guard = (locks.model() <= ThreadModel::SerializeRequests)
            .then(|| conn.request_lock.lock().unwrap());
        let handled = {
            let _write_guard = conn.write_lock.lock().unwrap();
            let mut stream = stream.lock().unwrap();
            threadlocal::with_buffer(MAX_REQUEST_SIZE as usize, |buf| {
                handle_request(&req, buf, &ctx, &conn, &mut *stream)
            })
        };
        match handled {
            Ok(Handled::Continue) => {}
            Ok(Handled::Disconnect) => {
                conn.advance_status(Status::ClientDone);
                return;
            }
            Err(e) => {
                error!("request handling failed: {e:?}");
                conn.advance_status(Status::Dead);
                return;
            }
        }
    }
}

/// Default port re-exported for convenience (`crate::proto::DEFAULT_PORT`
/// is the canonical constant).
pub const PORT: u16 = DEFAULT_PORT;
