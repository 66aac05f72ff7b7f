//! The `NBD_OPT_STARTTLS` upgrade boundary.
//!
//! The handshake engine only needs to turn a plain stream into an
//! encrypted one partway through a connection; it doesn't care which TLS
//! library does that. `TlsProvider` is that seam. The `tls` feature adds
//! one concrete implementation backed by `rustls`; without the feature,
//! the crate still compiles and `NBD_OPT_STARTTLS` is simply refused
//! with `NBD_REP_ERR_POLICY`.

use std::io::{self, Read, Write};

/// Either side of a stream, upgradeable to TLS in place. Implementations
/// consume the plaintext stream and return a boxed encrypted one so the
/// rest of the server can keep treating the connection as
/// `Read + Write` without knowing TLS happened.
pub trait TlsProvider: Send + Sync {
    fn accept(
        &self,
        stream: Box<dyn ReadWrite>,
    ) -> io::Result<Box<dyn ReadWrite>>;
}

/// Object-safe `Read + Write`, since `TlsProvider::accept` needs to take
/// and return trait objects.
pub trait ReadWrite: Read + Write + Send {}
impl<T: Read + Write + Send> ReadWrite for T {}

#[cfg(feature = "tls")]
pub use rustls_provider::RustlsProvider;

#[cfg(feature = "tls")]
mod rustls_provider {
    use super::{ReadWrite, TlsProvider};
    use std::io::{self, Read, Write};
    use std::sync::Arc;

    use rustls::{ServerConfig, ServerConnection, StreamOwned};
    use rustls_pemfile::{certs, private_key};

    /// TLS 1.2+ server identity loaded from a PEM certificate chain and
    /// private key, the same pair a `--tls-certificates` flag would
    /// point at.
    pub struct RustlsProvider {
        config: Arc<ServerConfig>,
    }

    impl RustlsProvider {
        pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> color_eyre::Result<Self> {
            let cert_chain = certs(&mut io::Cursor::new(cert_pem))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| color_eyre::eyre::eyre!("parsing TLS certificate chain: {e}"))?;
            let key = private_key(&mut io::Cursor::new(key_pem))
                .map_err(|e| color_eyre::eyre::eyre!("parsing TLS private key: {e}"))?
                .ok_or_else(|| color_eyre::eyre::eyre!("no private key found in PEM input"))?;
            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(cert_chain, key)
                .map_err(|e| color_eyre::eyre::eyre!("building TLS server config: {e}"))?;
            Ok(RustlsProvider {
                config: Arc::new(config),
            })
        }
    }

    impl TlsProvider for RustlsProvider {
        fn accept(&self, stream: Box<dyn ReadWrite>) -> io::Result<Box<dyn ReadWrite>> {
            let conn = ServerConnection::new(self.config.clone())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            // `Box<dyn ReadWrite>` is itself `Read + Write` (the stdlib's
            // blanket impls for `Box<R: ?Sized>`), so `StreamOwned` can
            // hold it directly with no extra indirection.
            let mut tls = StreamOwned::new(conn, stream);
            // Force the handshake to complete before handing the stream
            // back, so a caller can start framing NBD requests over it
            // immediately.
            tls.flush()?;
            Ok(Box::new(tls))
        }
    }
}
