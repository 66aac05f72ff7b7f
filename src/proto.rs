//! NBD protocol constants and struct definitions.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description. Layouts and field names follow that document;
//! where nbdkit's C implementation resolves an ambiguity (see
//! `examples/original_source/server/protocol*.c` in the teaching corpus this
//! crate was built from) we follow its choice.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]

use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*, ErrorKind};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;
use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Default TCP port for NBD servers, 10809 per the spec.
pub const DEFAULT_PORT: u16 = 10809;

pub const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub const OLD_VERSION: u64 = 0x0042_0281_8612_53;
pub const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT", doubles as NEW_VERSION
pub const NEW_VERSION: u64 = IHAVEOPT;
pub const REPLY_MAGIC: u64 = 0x3e889045565a9;

// transmission constants
pub const REQUEST_MAGIC: u32 = 0x25609513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// The context id nbdkit (and we) always hand back for `base:allocation`.
/// The spec doesn't mandate a particular value, only that it be stable.
pub const BASE_ALLOCATION_ID: u32 = 1;

/// Maximum number of options the newstyle handshake loop will process
/// before giving up on the client (spec.md §4.2, §8 boundary case).
pub const MAX_NR_OPTIONS: usize = 32;

/// Maximum read/write request size the dispatcher will honour.
pub const MAX_REQUEST_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum length of a UTF-8 string (export name, description, meta
/// context query) accepted anywhere in the protocol.
pub const NBD_MAX_STRING: u32 = 4096;

#[derive(Debug, Clone)]
pub struct ProtocolError(pub String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

bitflags! {
    /// Global handshake flags, sent server -> client.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandshakeFlags: u16 {
        const FIXED_NEWSTYLE = 1 << 0;
        const NO_ZEROES = 1 << 1;
    }

    /// Client handshake flags, sent client -> server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientHandshakeFlags: u32 {
        const C_FIXED_NEWSTYLE = 1 << 0;
        const C_NO_ZEROES = 1 << 1;
    }

    /// Per-export transmission flags (`eflags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransmitFlags: u16 {
        const HAS_FLAGS = 1 << 0;
        const READ_ONLY = 1 << 1;
        const SEND_FLUSH = 1 << 2;
        const SEND_FUA = 1 << 3;
        const ROTATIONAL = 1 << 4;
        const SEND_TRIM = 1 << 5;
        const SEND_WRITE_ZEROES = 1 << 6;
        const SEND_DF = 1 << 7;
        const CAN_MULTI_CONN = 1 << 8;
        const SEND_RESIZE = 1 << 9;
        const SEND_CACHE = 1 << 10;
        const SEND_FAST_ZERO = 1 << 11;
    }

    /// Per-request command flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdFlags: u16 {
        const FUA = 1 << 0;
        const NO_HOLE = 1 << 1;
        /// "don't fragment"
        const DF = 1 << 2;
        const REQ_ONE = 1 << 3;
        const FAST_ZERO = 1 << 4;
    }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    EXPORT_NAME = 1,
    ABORT = 2,
    LIST = 3,
    PEEK_EXPORT = 4,
    STARTTLS = 5,
    INFO = 6,
    GO = 7,
    STRUCTURED_REPLY = 8,
    LIST_META_CONTEXT = 9,
    SET_META_CONTEXT = 10,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum InfoType {
    EXPORT = 0,
    NAME = 1,
    DESCRIPTION = 2,
    BLOCK_SIZE = 3,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyType {
    ACK = 1,
    SERVER = 2,
    INFO = 3,
    META_CONTEXT = 4,
    ERR_UNSUP = (1 << 31) + 1,
    ERR_POLICY = (1 << 31) + 2,
    ERR_INVALID = (1 << 31) + 3,
    ERR_PLATFORM = (1 << 31) + 4,
    ERR_TLS_REQD = (1 << 31) + 5,
    ERR_UNKNOWN = (1 << 31) + 6,
    ERR_SHUTDOWN = (1 << 31) + 7,
    ERR_BLOCK_SIZE_REQD = (1 << 31) + 8,
    ERR_TOO_BIG = (1 << 31) + 9,
}

/// Builder for replying to an option.
#[must_use]
pub struct OptReply {
    opt: OptType,
    reply_type: ReplyType,
    data: Vec<u8>,
}

impl OptReply {
    pub fn ack(opt: OptType) -> Self {
        Self {
            opt,
            reply_type: ReplyType::ACK,
            data: vec![],
        }
    }

    pub fn new(opt: OptType, reply_type: ReplyType, data: Vec<u8>) -> Self {
        Self {
            opt,
            reply_type,
            data,
        }
    }

    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        // S: 64 bits, magic number for replies
        // S: 32 bits, the option this replies to
        // S: 32 bits, reply type
        // S: 32 bits, length of the reply (may be zero)
        // S: any data required by the reply
        stream.write_u64::<BE>(REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.opt.into())?;
        stream.write_u32::<BE>(self.reply_type.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Opt {
    pub typ: OptType,
    pub data: Vec<u8>,
}

impl Opt {
    /// Read one client option. `optlen` is bounded by the largest data
    /// payload the engine will accept for options (distinct from the data
    /// command cap).
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let magic = stream.read_u64::<BE>()?;
        if magic != IHAVEOPT {
            bail!(ProtocolError::new(format!("unexpected option magic {magic}")));
        }
        let option = stream.read_u32::<BE>()?;
        let typ = OptType::try_from(option)
            .map_err(|_| ProtocolError::new(format!("unexpected option {option}")))?;
        let option_len = stream.read_u32::<BE>()?;
        ensure!(
            option_len <= MAX_REQUEST_SIZE,
            ProtocolError::new(format!("option length {option_len} is too large"))
        );
        let mut data = vec![0u8; option_len as usize];
        stream
            .read_exact(&mut data)
            .wrap_err_with(|| format!("reading option {typ:?} of size {option_len}"))?;
        Ok(Self { typ, data })
    }

    pub fn put<IO: Write>(&self, mut stream: IO) -> Result<()> {
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u32::<BE>(self.typ.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

/// Check that a protocol-supplied string fits within `maxlen` bytes and
/// contains no interior NUL. Used for export names and meta context
/// queries (spec.md §4.2 "check_string" in nbdkit parlance).
pub fn check_string(buf: &[u8], maxlen: u32, what: &str) -> Result<()> {
    if buf.len() as u32 > NBD_MAX_STRING || buf.len() as u32 > maxlen {
        bail!(ProtocolError::new(format!("{what} too long")));
    }
    if buf.contains(&0) {
        bail!(ProtocolError::new(format!(
            "{what} may not include NUL bytes"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InfoRequest {
    pub name: String,
    pub typs: Vec<InfoType>,
}

impl InfoRequest {
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let name_len = stream.read_u32::<BE>()?;
        let mut buf = vec![0; name_len as usize];
        stream.read_exact(&mut buf)?;
        check_string(&buf, name_len, "export name")?;
        let name =
            String::from_utf8(buf).wrap_err(ProtocolError::new("invalid UTF-8 in export name"))?;
        let num_requests = stream.read_u16::<BE>()?;
        let mut typs = vec![];
        for _ in 0..num_requests {
            let typ = stream.read_u16::<BE>()?;
            match InfoType::try_from(typ) {
                Ok(typ) => typs.push(typ),
                // Unknown info types are ignored, not fatal (spec.md §4.2).
                Err(_) => warn!("ignoring unknown NBD_INFO_* request {typ}"),
            }
        }
        Ok(InfoRequest { name, typs })
    }
}

/// One `(namespace:id)` query from `LIST_META_CONTEXT`/`SET_META_CONTEXT`.
#[derive(Debug, Clone)]
pub struct MetaContextQuery(pub String);

impl MetaContextQuery {
    pub fn get<IO: Read>(mut stream: IO, budget: u32) -> Result<Self> {
        let len = stream.read_u32::<BE>()?;
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf)?;
        check_string(&buf, budget, "meta context query")?;
        let s = String::from_utf8(buf)
            .wrap_err(ProtocolError::new("invalid UTF-8 in meta context query"))?;
        Ok(MetaContextQuery(s))
    }
}

// -------------------
// Transmission phase
// -------------------

#[derive(IntoPrimitive, TryFromPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u16)]
pub enum Cmd {
    READ = 0,
    WRITE = 1,
    // NBD_CMD_DISC
    DISCONNECT = 2,
    FLUSH = 3,
    TRIM = 4,
    CACHE = 5,
    WRITE_ZEROES = 6,
    BLOCK_STATUS = 7,
    RESIZE = 8,
}

pub struct Request {
    pub flags: CmdFlags,
    pub typ: Cmd,
    pub handle: u64,
    pub offset: u64,
    /// Length field from the wire; used directly for READ, redundant with
    /// `data_len` for WRITE.
    pub len: u32,
    /// Actual number of bytes read into the caller's buffer for WRITE
    /// (bounded by the buffer's capacity, not just `len`).
    pub data_len: usize,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("Request");
        if !self.flags.is_empty() {
            f.field("flags", &self.flags);
        }
        f.field("typ", &self.typ);
        if matches!(
            self.typ,
            Cmd::READ | Cmd::WRITE | Cmd::TRIM | Cmd::CACHE | Cmd::BLOCK_STATUS
        ) {
            f.field("offset", &self.offset);
        }
        if self.len != 0 {
            f.field("len", &self.len);
        }
        f.finish_non_exhaustive()
    }
}

impl Request {
    /// Build a request for the client side (no flags support yet beyond the
    /// defaults the teacher's `Client` needs).
    pub fn new(typ: Cmd, offset: u64, len: u32) -> Self {
        Self {
            flags: CmdFlags::empty(),
            typ,
            handle: rand::random(),
            offset,
            len,
            data_len: 0,
        }
    }

    pub fn put<IO: Write>(&self, data: &[u8], mut stream: IO) -> Result<()> {
        stream.write_u32::<BE>(REQUEST_MAGIC)?;
        stream.write_u16::<BE>(self.flags.bits())?;
        stream.write_u16::<BE>(self.typ.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_u64::<BE>(self.offset)?;
        stream.write_u32::<BE>(self.len)?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

    /// Read a request header (and, for WRITE, its payload into `buf`,
    /// which the caller owns — typically the per-thread scratch buffer).
    pub fn get<IO: Read>(mut stream: IO, buf: &mut [u8]) -> Result<Self> {
        let magic = stream.read_u32::<BE>()?;
        if magic != REQUEST_MAGIC {
            bail!(ProtocolError::new(format!("wrong request magic {magic}")));
        }
        let flags = stream.read_u16::<BE>()?;
        let flags = CmdFlags::from_bits(flags)
            .ok_or_else(|| ProtocolError::new(format!("unexpected command flags {flags}")))?;
        let typ = stream.read_u16::<BE>()?;
        let typ =
            Cmd::try_from(typ).map_err(|_| ProtocolError::new(format!("unexpected command {typ}")))?;
        let handle = stream.read_u64::<BE>()?;
        let offset = stream.read_u64::<BE>()?;
        let len = stream.read_u32::<BE>()?;
        let data_len = if typ == Cmd::WRITE {
            let n = (len as usize).min(buf.len());
            stream
                .read_exact(&mut buf[..n])
                .wrap_err_with(|| format!("parsing write request of length {n}"))?;
            n
        } else {
            0
        };
        Ok(Self {
            flags,
            typ,
            handle,
            offset,
            len,
            data_len,
        })
    }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorType {
    OK = 0,
    EPERM = 1,
    EIO = 5,
    ENOMEM = 12,
    EINVAL = 22,
    ENOSPC = 28,
    EOVERFLOW = 75,
    ENOTSUP = 95,
    ESHUTDOWN = 108,
}

impl ErrorType {
    /// Best-effort mapping from a `std::io::ErrorKind`, used by plugins
    /// that surface an `io::Error` rather than going through the explicit
    /// errno enum in `crate::error`.
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            ErrorKind::PermissionDenied => Self::EPERM,
            ErrorKind::InvalidInput | ErrorKind::UnexpectedEof => Self::EOVERFLOW,
            ErrorKind::OutOfMemory => Self::ENOMEM,
            ErrorKind::Unsupported => Self::ENOTSUP,
            _ => {
                warn!("unexpected error {kind}, mapping to EIO");
                Self::EIO
            }
        }
    }
}

#[derive(Debug)]
#[must_use]
pub struct SimpleReply<'a> {
    pub err: ErrorType,
    pub handle: u64,
    pub data: &'a [u8],
}

impl<'a> SimpleReply<'a> {
    pub fn data(req: &Request, data: &'a [u8]) -> Self {
        SimpleReply {
            err: ErrorType::OK,
            handle: req.handle,
            data,
        }
    }

    pub fn ok(req: &Request) -> Self {
        Self::data(req, &[])
    }

    pub fn err(err: ErrorType, req: &Request) -> Self {
        SimpleReply {
            err,
            handle: req.handle,
            data: &[],
        }
    }

    pub fn put<IO: Write>(self, mut stream: IO) -> Result<()> {
        stream.write_u32::<BE>(SIMPLE_REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.err.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_all(self.data)?;
        Ok(())
    }

    /// Client-side counterpart to `put`: read a simple reply whose data
    /// portion (on success) lands in `buf`.
    pub fn get<IO: Read>(mut stream: IO, buf: &mut [u8]) -> Result<OwnedSimpleReply> {
        let magic = stream.read_u32::<BE>()?;
        if magic != SIMPLE_REPLY_MAGIC {
            bail!(ProtocolError::new(format!("wrong simple reply magic {magic}")));
        }
        let err = stream.read_u32::<BE>()?;
        let err = ErrorType::try_from(err)
            .map_err(|_| ProtocolError::new(format!("unexpected error code {err}")))?;
        let handle = stream.read_u64::<BE>()?;
        if err == ErrorType::OK {
            stream.read_exact(buf)?;
        }
        Ok(OwnedSimpleReply { err, handle })
    }
}

/// Owned variant returned from the client-side reader (no borrowed data
/// buffer, since the caller supplies and owns that separately).
#[derive(Debug)]
pub struct OwnedSimpleReply {
    pub err: ErrorType,
    pub handle: u64,
}

bitflags! {
    /// Flags on a structured reply chunk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StructuredReplyFlags: u16 {
        const DONE = 1 << 0;
    }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ChunkType {
    OFFSET_DATA = 1,
    OFFSET_HOLE = 2,
    BLOCK_STATUS = 5,
    ERROR = 0x8001,
}

/// One structured-reply chunk header; callers stream the payload
/// themselves to avoid an extra buffer copy for the (possibly large)
/// `OFFSET_DATA` case.
pub struct StructuredReplyHeader {
    pub handle: u64,
    pub typ: ChunkType,
    pub done: bool,
    pub length: u32,
}

impl StructuredReplyHeader {
    pub fn put<IO: Write>(&self, mut stream: IO) -> Result<()> {
        let flags = if self.done {
            StructuredReplyFlags::DONE
        } else {
            StructuredReplyFlags::empty()
        };
        stream.write_u32::<BE>(STRUCTURED_REPLY_MAGIC)?;
        stream.write_u16::<BE>(flags.bits())?;
        stream.write_u16::<BE>(self.typ.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_u32::<BE>(self.length)?;
        Ok(())
    }
}

/// A single `BLOCK_STATUS` descriptor, big-endian on the wire.
#[derive(Debug, Clone, Copy)]
pub struct BlockDescriptor {
    pub length: u32,
    pub status_flags: u32,
}

impl BlockDescriptor {
    pub fn put<IO: Write>(&self, mut stream: IO) -> io::Result<()> {
        stream.write_u32::<BE>(self.length)?;
        stream.write_u32::<BE>(self.status_flags)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trips() {
        let req = Request::new(Cmd::WRITE, 4096, 512);
        let mut buf = vec![];
        req.put(&[7u8; 512], &mut buf).unwrap();
        let mut scratch = vec![0u8; 512];
        let parsed = Request::get(Cursor::new(buf), &mut scratch).unwrap();
        assert_eq!(parsed.typ, Cmd::WRITE);
        assert_eq!(parsed.offset, 4096);
        assert_eq!(parsed.data_len, 512);
        assert_eq!(&scratch, &[7u8; 512]);
    }

    #[test]
    fn opt_rejects_bad_magic() {
        let mut buf = vec![];
        buf.write_u64::<BE>(0xdead_beef).unwrap();
        assert!(Opt::get(Cursor::new(buf)).is_err());
    }

    #[test]
    fn check_string_rejects_embedded_nul() {
        assert!(check_string(b"a\0b", 100, "x").is_err());
    }

    #[test]
    fn check_string_rejects_too_long() {
        let s = vec![b'a'; NBD_MAX_STRING as usize + 1];
        assert!(check_string(&s, NBD_MAX_STRING + 10, "x").is_err());
    }
}
