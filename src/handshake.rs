//! Oldstyle and newstyle handshakes.
//!
//! Grounded on `server/protocol-handshake-newstyle.c`'s option loop:
//! `EXPORT_NAME`/`ABORT`/`LIST`/`STARTTLS`/`INFO`/`GO`/`STRUCTURED_REPLY`/
//! `LIST_META_CONTEXT`/`SET_META_CONTEXT`, each validated the way that
//! file validates them (export name checked with `check_export_name`,
//! TLS-required gating enforced before any other option is honoured).

use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use crate::backend::{Backend, Context};
use crate::connection::Connection;
use crate::exports::ExportList;
use crate::proto::*;
use crate::tls::{ReadWrite, TlsProvider};

/// Everything the handshake needs from the server to resolve an export
/// name into a live backend chain.
pub trait ExportResolver {
    fn exports(&self) -> &ExportList;
    fn open(&self, name: &str) -> Option<Arc<dyn Backend>>;

    /// The backend chain's own default export name, used to resolve
    /// `ExportList::use_default` when replying to `NBD_OPT_LIST`. Only
    /// worth overriding when `exports()` was built with `use_default()`
    /// set; the default implementation never gets asked otherwise.
    fn default_export_name(&self, _readonly: bool) -> Option<String> {
        None
    }
}

/// Policy inputs that don't belong to any one export: whether TLS is
/// available/mandatory, and (for the rare client) whether oldstyle is
/// still accepted.
pub struct HandshakePolicy<'a> {
    pub tls: Option<&'a dyn TlsProvider>,
    pub tls_required: bool,
}

/// Outcome of a successful handshake: the stream (possibly now wrapped
/// in TLS), the negotiated handshake flags, and the backend context the
/// client will issue requests against.
pub struct Negotiated {
    pub stream: Box<dyn ReadWrite>,
    pub ctx: Context,
    pub transmit_flags: TransmitFlags,
}

fn transmit_flags(caps: crate::backend::Capabilities, structured_replies: bool) -> TransmitFlags {
    let mut f = TransmitFlags::HAS_FLAGS;
    if !caps.can_write() {
        f |= TransmitFlags::READ_ONLY;
    }
    if caps.can_flush() {
        f |= TransmitFlags::SEND_FLUSH;
    }
    if caps.can_fua() {
        f |= TransmitFlags::SEND_FUA;
    }
    if caps.can_trim() {
        f |= TransmitFlags::SEND_TRIM;
    }
    if caps.can_zero() {
        f |= TransmitFlags::SEND_WRITE_ZEROES;
    }
    if caps.can_fast_zero() {
        f |= TransmitFlags::SEND_FAST_ZERO;
    }
    if caps.can_multi_conn() {
        f |= TransmitFlags::CAN_MULTI_CONN;
    }
    if caps.can_cache() {
        f |= TransmitFlags::SEND_CACHE;
    }
    if caps.is_rotational() {
        f |= TransmitFlags::ROTATIONAL;
    }
    if structured_replies {
        f |= TransmitFlags::SEND_DF;
    }
    f
}

/// Run the oldstyle handshake: a single implicit export, no option
/// negotiation at all. Kept for interoperability with very old clients;
/// new deployments should refuse it (see `HandshakePolicy`).
pub fn oldstyle<IO: Read + Write>(
    mut stream: IO,
    resolver: &impl ExportResolver,
) -> Result<(Context, TransmitFlags)> {
    let export = resolver
        .exports()
        .resolve("")
        .ok_or_else(|| ProtocolError::new("no default export configured"))?;
    let backend = resolver
        .open(&export.name)
        .ok_or_else(|| ProtocolError::new("failed to open default export"))?;
    let ctx = Context::open(backend);
    let flags = transmit_flags(ctx.caps(), false);

    stream.write_u64::<BE>(MAGIC)?;
    stream.write_u64::<BE>(OLD_VERSION)?;
    stream.write_u64::<BE>(ctx.backend().size()?)?;
    stream.write_u16::<BE>(flags.bits())?;
    stream.write_all(&[0u8; 124])?;
    stream.flush()?;
    Ok((ctx, flags))
}

/// Run the fixed-newstyle initial handshake (magic + global flags
/// exchange), returning the flags both sides agreed to.
pub fn initial_newstyle<IO: Read + Write>(mut stream: IO) -> Result<HandshakeFlags> {
    stream.write_u64::<BE>(MAGIC)?;
    stream.write_u64::<BE>(IHAVEOPT)?;
    stream.write_u16::<BE>((HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES).bits())?;
    stream.flush()?;
    let client_flags = stream.read_u32::<BE>()?;
    let client_flags = ClientHandshakeFlags::from_bits(client_flags)
        .ok_or_else(|| ProtocolError::new(format!("unexpected client flags {client_flags}")))?;
    if !client_flags.contains(ClientHandshakeFlags::C_FIXED_NEWSTYLE) {
        bail!(ProtocolError::new("client does not support FIXED_NEWSTYLE"));
    }
    let mut flags = HandshakeFlags::FIXED_NEWSTYLE;
    if client_flags.contains(ClientHandshakeFlags::C_NO_ZEROES) {
        flags |= HandshakeFlags::NO_ZEROES;
    }
    Ok(flags)
}

fn send_export_list<IO: Write>(stream: &mut IO, resolver: &impl ExportResolver) -> Result<()> {
    let exports = resolver.exports();
    let default_name = if exports.is_using_default() {
        resolver.default_export_name(false)
    } else {
        None
    };
    for name in exports.iter_with_default(default_name.as_deref()) {
        let mut buf = vec![];
        buf.write_u32::<BE>(name.len() as u32)?;
        buf.write_all(name.as_bytes())?;
        OptReply::new(OptType::LIST, ReplyType::SERVER, buf).put(&mut *stream)?;
    }
    OptReply::ack(OptType::LIST).put(stream)?;
    Ok(())
}

fn send_export_info<IO: Write>(
    stream: &mut IO,
    ctx: &Context,
    flags: HandshakeFlags,
    structured_replies: bool,
) -> Result<TransmitFlags> {
    let size = ctx.backend().size()?;
    let transmit = transmit_flags(ctx.caps(), structured_replies);
    stream.write_u64::<BE>(size)?;
    stream.write_u16::<BE>(transmit.bits())?;
    if !flags.contains(HandshakeFlags::NO_ZEROES) {
        stream.write_all(&[0u8; 124])?;
    }
    stream.flush()?;
    Ok(transmit)
}

fn info_responses<IO: Write>(
    stream: &mut IO,
    opt_typ: OptType,
    info_req: &InfoRequest,
    ctx: &Context,
    structured_replies: bool,
) -> Result<TransmitFlags> {
    let transmit = transmit_flags(ctx.caps(), structured_replies);
    for typ in info_req.typs.iter().chain([InfoType::EXPORT].iter()) {
        match typ {
            InfoType::EXPORT => {
                let mut buf = vec![];
                buf.write_u16::<BE>(InfoType::EXPORT.into())?;
                buf.write_u64::<BE>(ctx.backend().size()?)?;
                buf.write_u16::<BE>(transmit.bits())?;
                OptReply::new(opt_typ, ReplyType::INFO, buf).put(&mut *stream)?;
            }
            InfoType::BLOCK_SIZE => {
                let mut buf = vec![];
                buf.write_u16::<BE>(InfoType::BLOCK_SIZE.into())?;
                buf.write_u32::<BE>(1)?;
                buf.write_u32::<BE>(4096)?;
                buf.write_u32::<BE>(MAX_REQUEST_SIZE)?;
                OptReply::new(opt_typ, ReplyType::INFO, buf).put(&mut *stream)?;
            }
            InfoType::NAME => {
                let mut buf = vec![];
                buf.write_u16::<BE>(InfoType::NAME.into())?;
                buf.write_all(ctx.backend().name().as_bytes())?;
                OptReply::new(opt_typ, ReplyType::INFO, buf).put(&mut *stream)?;
            }
            InfoType::DESCRIPTION => {
                // No description support; silently skip rather than
                // erroring the whole option (nbdkit does the same for
                // info types it has nothing to say about).
            }
        }
    }
    Ok(transmit)
}

/// Run the newstyle option-negotiation loop. Returns `Ok(None)` if the
/// client aborted, `Ok(Some(..))` once an export is resolved and ready
/// for the transmission phase to begin.
///
/// `stream` is boxed because `NBD_OPT_STARTTLS` may replace it in place
/// partway through the loop.
pub fn newstyle_haggle(
    mut stream: Box<dyn ReadWrite>,
    flags: HandshakeFlags,
    resolver: &impl ExportResolver,
    conn: &Connection,
    policy: &HandshakePolicy,
) -> Result<Option<Negotiated>> {
    let mut options_seen = 0usize;
    loop {
        options_seen += 1;
        if options_seen > MAX_NR_OPTIONS {
            bail!(ProtocolError::new("client sent too many options"));
        }
        let opt = Opt::get(&mut stream)?;

        if policy.tls_required
            && !conn.is_using_tls()
            && opt.typ != OptType::STARTTLS
            && opt.typ != OptType::ABORT
        {
            OptReply::new(opt.typ, ReplyType::ERR_TLS_REQD, vec![]).put(&mut stream)?;
            continue;
        }

        match opt.typ {
            OptType::EXPORT_NAME => {
                check_string(&opt.data, NBD_MAX_STRING, "export name")?;
                let name = String::from_utf8(opt.data)
                    .wrap_err(ProtocolError::new("non-UTF8 export name"))?;
                let export = resolver
                    .exports()
                    .resolve(&name)
                    .ok_or_else(|| ProtocolError::new(format!("unknown export {name:?}")))?;
                let backend = resolver.open(&export.name).ok_or_else(|| {
                    ProtocolError::new(format!("failed to open export {name:?}"))
                })?;
                let ctx = Context::open(backend);
                let transmit_flags = send_export_info(&mut stream, &ctx, flags, conn.is_structured_replies())?;
                conn.reconcile_meta_contexts(&export.name);
                conn.set_export_name(&export.name);
                return Ok(Some(Negotiated {
                    stream,
                    ctx,
                    transmit_flags,
                }));
            }
            OptType::LIST => {
                if !opt.data.is_empty() {
                    OptReply::new(opt.typ, ReplyType::ERR_INVALID, vec![]).put(&mut stream)?;
                    continue;
                }
                send_export_list(&mut stream, resolver)?;
            }
            OptType::ABORT => {
                OptReply::ack(opt.typ).put(&mut stream)?;
                return Ok(None);
            }
            OptType::STARTTLS => {
                let Some(provider) = policy.tls else {
                    OptReply::new(opt.typ, ReplyType::ERR_POLICY, vec![]).put(&mut stream)?;
                    continue;
                };
                if conn.is_using_tls() {
                    OptReply::new(opt.typ, ReplyType::ERR_INVALID, vec![]).put(&mut stream)?;
                    continue;
                }
                OptReply::ack(opt.typ).put(&mut stream)?;
                stream = provider.accept(stream)?;
                conn.set_using_tls(true);
                // Contexts negotiated before the upgrade are per-export
                // state from an unauthenticated phase of the connection;
                // wipe it out rather than let it survive into the
                // encrypted session.
                conn.reset_after_tls();
            }
            OptType::STRUCTURED_REPLY => {
                if conn.is_structured_replies() {
                    OptReply::new(opt.typ, ReplyType::ERR_INVALID, vec![]).put(&mut stream)?;
                    continue;
                }
                conn.set_structured_replies(true);
                OptReply::ack(opt.typ).put(&mut stream)?;
            }
            OptType::LIST_META_CONTEXT | OptType::SET_META_CONTEXT => {
                if !conn.is_structured_replies() {
                    OptReply::new(opt.typ, ReplyType::ERR_INVALID, vec![]).put(&mut stream)?;
                    continue;
                }
                let export_name_len = {
                    let mut r = &opt.data[..];
                    r.read_u32::<BE>()?
                };
                let mut r = &opt.data[4..];
                let mut name_buf = vec![0u8; export_name_len as usize];
                r.read_exact(&mut name_buf)?;
                check_string(&name_buf, NBD_MAX_STRING, "export name")?;
                let name = String::from_utf8(name_buf)
                    .wrap_err(ProtocolError::new("non-UTF8 export name"))?;
                if let Some(prior) = conn.meta_context_export_name() {
                    if prior != name {
                        OptReply::new(opt.typ, ReplyType::ERR_INVALID, vec![]).put(&mut stream)?;
                        continue;
                    }
                } else {
                    conn.set_meta_context_export_name(&name);
                }
                let num_queries = r.read_u32::<BE>()?;
                for _ in 0..num_queries {
                    let q = MetaContextQuery::get(&mut r, NBD_MAX_STRING)?;
                    if q.0 == "base:allocation" {
                        if opt.typ == OptType::SET_META_CONTEXT {
                            conn.add_meta_context(BASE_ALLOCATION_ID);
                        }
                        let mut reply = vec![];
                        reply.write_u32::<BE>(BASE_ALLOCATION_ID)?;
                        reply.write_all(b"base:allocation")?;
                        OptReply::new(opt.typ, ReplyType::META_CONTEXT, reply).put(&mut stream)?;
                    }
                }
                OptReply::ack(opt.typ).put(&mut stream)?;
            }
            OptType::INFO | OptType::GO => {
                let info_req = InfoRequest::get(&opt.data[..])?;
                let export = resolver.exports().resolve(&info_req.name);
                let export = match export {
                    Some(e) => e,
                    None => {
                        // spec.md §4.2 INFO/GO row: open failure replies
                        // NBD_REP_ERR_UNKNOWN, not ERR_INVALID.
                        OptReply::new(opt.typ, ReplyType::ERR_UNKNOWN, vec![]).put(&mut stream)?;
                        continue;
                    }
                };
                let backend = resolver.open(&export.name);
                let backend = match backend {
                    Some(b) => b,
                    None => {
                        OptReply::new(opt.typ, ReplyType::ERR_UNKNOWN, vec![]).put(&mut stream)?;
                        continue;
                    }
                };
                let ctx = Context::open(backend);
                let transmit_flags = info_responses(&mut stream, opt.typ, &info_req, &ctx, conn.is_structured_replies())?;
                if opt.typ == OptType::GO {
                    OptReply::ack(opt.typ).put(&mut stream)?;
                    conn.reconcile_meta_contexts(&export.name);
                    conn.set_export_name(&export.name);
                    return Ok(Some(Negotiated {
                        stream,
                        ctx,
                        transmit_flags,
                    }));
                } else {
                    OptReply::ack(opt.typ).put(&mut stream)?;
                }
            }
            OptType::PEEK_EXPORT => {
                OptReply::new(opt.typ, ReplyType::ERR_UNSUP, vec![]).put(&mut stream)?;
            }
        }
    }
}

/// The trivial resolver used by single-export deployments (`nbd serve
/// <file>`), kept separate from `ExportResolver` so test code can provide
/// a fake multi-export version without touching the server.
pub struct SingleExport {
    exports: ExportList,
    backend: Arc<dyn Backend>,
}

impl SingleExport {
    pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>) -> Result<Self> {
        let mut exports = ExportList::new();
        exports.add(name, None)?;
        Ok(SingleExport { exports, backend })
    }
}

impl ExportResolver for SingleExport {
    fn exports(&self) -> &ExportList {
        &self.exports
    }

    fn open(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.exports
            .resolve(name)
            .map(|_| self.backend.clone())
    }
}
