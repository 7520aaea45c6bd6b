//! DNS listeners and the per-message request pipeline.
//!
//! UDP serves NOTIFY and authoritative SOA; TCP serves UPDATE, AXFR and
//! authoritative queries (optionally NOTIFY); TLS is TCP plus
//! mutual-TLS-by-public-key. A connection handles one message at a time:
//! read, process, respond, repeat. Concurrency comes from connections and
//! datagrams, not from pipelining within one connection.

mod auth;
mod axfr;
mod notify;
mod update;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use domain::base::iana::{Class, Opcode, OptRcode, Rcode, Rtype};
use domain::base::iana::ExtendedErrorCode;
use domain::base::message::Message;
use domain::base::message_builder::{
    AdditionalBuilder, AnswerBuilder, MessageBuilder, StreamTarget,
};
use domain::base::opt::ExtendedError;
use domain::rdata::tsig::Time48;
use domain::tsig::{Key, ServerSequence};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use stratus_common::name::clean_abs_name;
use stratus_common::types::Credential;
use stratus_common::{Error, Result};
use stratus_dns::tsig::{credential_key, peek_tsig, SingleKeyStore};

use crate::metrics;
use crate::store::StoreError;
use crate::sync::spawn_zone_notify;
use crate::App;

/// I/O deadline per read or write on a connection.
const IO_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for the TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Which operations a listener serves.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerOps {
    pub notify: bool,
    pub updates: bool,
    pub xfr: bool,
    pub auth: bool,
}

/// One response message, in stream framing (the UDP path uses the
/// datagram slice of the same target).
pub(crate) type Frame = StreamTarget<Vec<u8>>;

/// The outcome of handling one request message.
pub(crate) struct Reply {
    pub frames: Vec<Frame>,
    /// Zone to send NOTIFY for, after the response has been written.
    pub notify_zone: Option<String>,
    /// Drop the connection after responding.
    pub close: bool,
    pub kind: &'static str,
    pub rcode: String,
}

static CONN_ID: LazyLock<AtomicU64> = LazyLock::new(|| {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    AtomicU64::new(millis)
});

fn next_cid() -> u64 {
    CONN_ID.fetch_add(1, Ordering::Relaxed)
}

fn rcode_label(rcode: Rcode) -> String {
    rcode.to_string().to_ascii_lowercase()
}

/// A header-only message, stand-in while the real request is borrowed for
/// TSIG processing.
fn empty_message() -> Message<Vec<u8>> {
    Message::from_octets(vec![0u8; 12]).expect("a bare header is a valid message")
}

/// Per-request context handed to the operation handlers.
pub(crate) struct ReqCtx {
    pub app: Arc<App>,
    pub cid: u64,
    /// The request, with a verified TSIG record already stripped.
    pub msg: Message<Vec<u8>>,
    pub edns: bool,
    /// Verified TSIG state: response signer plus the credential.
    pub tsig: Option<(ServerSequence<Arc<Key>>, Credential)>,
    /// Verified TLS client credential of the connection.
    pub cred_tls: Option<Credential>,
    pub qname: String,
    pub qtype: Rtype,
    pub kind: &'static str,
}

impl ReqCtx {
    /// Starts an authoritative answer to the request.
    pub fn answer_builder(
        &self,
        rcode: Rcode,
    ) -> Result<AnswerBuilder<StreamTarget<Vec<u8>>>> {
        let mut builder = MessageBuilder::new_stream_vec()
            .start_answer(&self.msg, rcode)
            .map_err(|e| Error::invariant(format!("building answer: {e}")))?;
        builder.header_mut().set_aa(true);
        builder.header_mut().set_ad(false);
        Ok(builder)
    }

    /// Completes one response message: appends the OPT record (when the
    /// request carried EDNS0) with an optional extended error, then the
    /// TSIG signature.
    pub fn finish(
        &mut self,
        mut builder: AdditionalBuilder<StreamTarget<Vec<u8>>>,
        opt_rcode: Option<OptRcode>,
        ede: Option<(ExtendedErrorCode, String)>,
    ) -> Result<Frame> {
        if self.edns {
            builder
                .opt(|opt| {
                    // 1232 is recommended since the dns flag day.
                    opt.set_udp_payload_size(1232);
                    if let Some(rcode) = opt_rcode {
                        opt.set_rcode(rcode);
                    }
                    if let Some((code, text)) = &ede {
                        if let Ok(option) = ExtendedError::<Vec<u8>>::new(
                            *code,
                            Some(domain::dep::octseq::str::Str::from_string(text.clone())),
                        ) {
                            opt.push(&option)?;
                        }
                    }
                    Ok(())
                })
                .map_err(|e| Error::invariant(format!("adding opt: {e}")))?;
        }
        if let Some((seq, _)) = &mut self.tsig {
            seq.answer(&mut builder, Time48::now())
                .map_err(|e| Error::invariant(format!("signing response: {e}")))?;
        }
        Ok(builder.finish())
    }

    /// One-frame reply with the given rcode and extended error.
    pub fn error_reply(
        &mut self,
        rcode: Rcode,
        code: ExtendedErrorCode,
        text: impl Into<String>,
    ) -> Reply {
        let text = text.into();
        debug!(cid = self.cid, %rcode, msg = %text, "error response");
        let frame = self
            .answer_builder(rcode)
            .map(|b| b.additional())
            .and_then(|b| self.finish(b, None, Some((code, text))));
        match frame {
            Ok(frame) => self.reply(vec![frame], rcode_label(rcode)),
            // Can't even build a response; drop the connection.
            Err(_) => self.drop_reply(),
        }
    }

    pub fn servfail(&mut self, text: impl Into<String>) -> Reply {
        self.error_reply(Rcode::ServFail, ExtendedErrorCode::Other, text)
    }

    /// Maps engine errors to the DNS failure taxonomy.
    pub fn failure_reply(&mut self, err: Error) -> Reply {
        match err {
            Error::NotFound(_) => self.error_reply(
                Rcode::NotAuth,
                ExtendedErrorCode::NotAuthoritative,
                "unknown zone",
            ),
            Error::Permission(m) => {
                self.error_reply(Rcode::Refused, ExtendedErrorCode::Prohibited, m)
            }
            Error::Provider(m) | Error::Transient(m) => self.error_reply(
                Rcode::ServFail,
                ExtendedErrorCode::NetworkError,
                m,
            ),
            other => self.servfail(other.to_string()),
        }
    }

    pub fn reply(&self, frames: Vec<Frame>, rcode: String) -> Reply {
        Reply {
            frames,
            notify_zone: None,
            close: false,
            kind: self.kind,
            rcode,
        }
    }

    pub fn drop_reply(&self) -> Reply {
        Reply {
            frames: Vec::new(),
            notify_zone: None,
            close: true,
            kind: self.kind,
            rcode: "other".to_string(),
        }
    }
}

/// Handles one request message. `None` means no response at all (the
/// message was unparseable or a misdirected response over UDP).
pub(crate) async fn handle_message(
    app: Arc<App>,
    cid: u64,
    buf: Vec<u8>,
    ops: ListenerOps,
    cred_tls: Option<Credential>,
    is_udp: bool,
) -> Option<Reply> {
    let mut msg = match Message::from_octets(buf) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(cid, err = %e, "parsing dns message, dropping connection");
            return None;
        }
    };

    let header = msg.header();
    let edns = msg.opt().is_some();
    let mut ctx = ReqCtx {
        app,
        cid,
        // Placeholder; replaced below once TSIG processing settles.
        msg: empty_message(),
        edns,
        tsig: None,
        cred_tls,
        qname: String::new(),
        qtype: Rtype::Any,
        kind: "n/a",
    };

    if header.qr() {
        if is_udp {
            // Not responding to a potentially misdirected response.
            return None;
        }
        ctx.msg = msg;
        let mut reply =
            ctx.error_reply(Rcode::FormErr, ExtendedErrorCode::Other, "only dns requests allowed");
        reply.close = true;
        return Some(reply);
    }
    if header.rcode() != Rcode::NoError {
        ctx.msg = msg;
        return Some(ctx.error_reply(
            Rcode::FormErr,
            ExtendedErrorCode::Other,
            "rcode must be zero",
        ));
    }
    if header.tc() {
        ctx.msg = msg;
        return Some(ctx.error_reply(
            Rcode::FormErr,
            ExtendedErrorCode::Other,
            "do not ask truncated questions",
        ));
    }

    // EDNS0 only; future versions get BADVERS.
    if let Some(opt) = msg.opt() {
        if opt.version() != 0 {
            let version = opt.version();
            ctx.msg = msg;
            let frame = ctx
                .answer_builder(Rcode::NoError)
                .map(|b| b.additional())
                .and_then(|b| {
                    ctx.finish(
                        b,
                        Some(OptRcode::BadVers),
                        Some((
                            ExtendedErrorCode::Other,
                            format!("edns version {version} not supported (only edns0)"),
                        )),
                    )
                });
            return Some(match frame {
                Ok(frame) => ctx.reply(vec![frame], "badvers".to_string()),
                Err(_) => ctx.drop_reply(),
            });
        }
    }

    // TSIG: must be the last additional record, must reference a known
    // key, and must verify. Authorization comes later, per zone.
    let peek = match peek_tsig(&msg) {
        Ok(peek) => peek,
        Err(_) => {
            ctx.msg = msg;
            return Some(ctx.error_reply(
                Rcode::FormErr,
                ExtendedErrorCode::Other,
                "tsig must be last extra record",
            ));
        }
    };
    if let Some(peek) = peek {
        let key_name = peek.key_name.clone();
        let cred = match ctx
            .app
            .store
            .read_async(move |tx| match tx.credential_by_name(&key_name) {
                Ok(c) if c.kind == stratus_common::types::CredentialKind::Tsig => {
                    Ok(Some(c))
                }
                Ok(_) => Ok(None),
                Err(StoreError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            })
            .await
        {
            Ok(cred) => cred,
            Err(e) => {
                ctx.msg = msg;
                return Some(ctx.servfail(format!("checking tsig: {e}")));
            }
        };
        let key = match (&cred, peek.algorithm) {
            (Some(cred), Some(algorithm)) => {
                match credential_key(cred, algorithm) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        ctx.msg = msg;
                        return Some(ctx.servfail(format!("loading tsig key: {e}")));
                    }
                }
            }
            _ => None,
        };
        match ServerSequence::request(&SingleKeyStore(key), &mut msg, Time48::now())
        {
            Ok(Some(seq)) => {
                let cred = cred.expect("key implies credential");
                debug!(cid, key = %cred.name, "request tsig verified");
                ctx.tsig = Some((seq, cred));
            }
            Ok(None) => {}
            Err(err) => {
                // BADKEY/BADSIG answers are unsigned; BADTIME is signed
                // with the server's current time. All are NOTAUTH.
                info!(cid, tsig_error = %err.error(), "tsig verification failed");
                let frame = err
                    .build_message(&msg, MessageBuilder::new_stream_vec())
                    .map(|b| b.finish());
                ctx.msg = msg;
                return Some(match frame {
                    Ok(frame) => {
                        ctx.reply(vec![frame], rcode_label(Rcode::NotAuth))
                    }
                    Err(_) => ctx.drop_reply(),
                });
            }
        }
    }

    ctx.msg = msg;

    if ctx.msg.header_counts().qdcount() != 1 {
        let n = ctx.msg.header_counts().qdcount();
        return Some(ctx.error_reply(
            Rcode::FormErr,
            ExtendedErrorCode::Other,
            format!("request must have 1 question, not {n}"),
        ));
    }
    let question = match ctx.msg.first_question() {
        Some(q) => q,
        None => {
            return Some(ctx.error_reply(
                Rcode::FormErr,
                ExtendedErrorCode::Other,
                "request must have 1 question",
            ));
        }
    };
    let qclass = question.qclass();
    let qtype = question.qtype();
    let qname = stratus_dns::record::abs_string(&question.qname());
    ctx.qtype = qtype;
    ctx.qname = match clean_abs_name(&qname) {
        Ok(name) => name,
        Err(e) => {
            return Some(ctx.error_reply(
                Rcode::FormErr,
                ExtendedErrorCode::Other,
                e.to_string(),
            ));
        }
    };

    let opcode = ctx.msg.header().opcode();

    // CHAOS is allowed through for the version query only.
    let class_ok = qclass == Class::In
        || (qclass == Class::Ch && ops.auth && opcode == Opcode::Query);
    if !class_ok {
        return Some(ctx.error_reply(
            Rcode::Refused,
            ExtendedErrorCode::Other,
            "only class inet allowed",
        ));
    }

    let reply = if ops.notify && opcode == Opcode::Notify {
        ctx.kind = "notify";
        notify::handle(&mut ctx).await
    } else if ops.updates && opcode == Opcode::Update {
        ctx.kind = "update";
        update::handle(&mut ctx).await
    } else if ops.xfr && opcode == Opcode::Query && qtype == Rtype::Axfr {
        ctx.kind = "axfr";
        axfr::handle(&mut ctx).await
    } else if ops.auth && opcode == Opcode::Query {
        // Authoritative SOA, for AXFR clients checking freshness.
        ctx.kind = "authoritative";
        auth::handle(&mut ctx, qclass).await
    } else {
        ctx.kind = "other";
        ctx.error_reply(
            Rcode::NotImp,
            ExtendedErrorCode::NotSupported,
            "request not implemented",
        )
    };
    Some(reply)
}

/// Checks that the caller presented at least one credential and that every
/// presented credential is linked to the zone. Runs without regard to
/// whether the zone itself exists: an unlinked or absent credential is a
/// permission failure (REFUSED), never an authority one.
pub(crate) fn verify_zone_credentials(
    links: &[stratus_common::types::ZoneCredential],
    cred_tls: Option<&Credential>,
    cred_tsig: Option<&Credential>,
) -> Result<()> {
    if cred_tls.is_none() && cred_tsig.is_none() {
        return Err(Error::permission(
            "tls public key and/or tsig authentication required",
        ));
    }
    if let Some(cred) = cred_tls {
        if !links.iter().any(|l| l.credential_id == cred.id) {
            return Err(Error::permission(
                "tls public key not authorized for this zone",
            ));
        }
    }
    if let Some(cred) = cred_tsig {
        if !links.iter().any(|l| l.credential_id == cred.id) {
            return Err(Error::permission("tsig key not authorized for this zone"));
        }
    }
    Ok(())
}

/// Authorizes the request for its question zone and loads the zone with
/// its provider config, in one read transaction.
///
/// Credentials are verified first: credential links can only exist for
/// zones that exist, so any request without a usable credential fails
/// with a permission error (REFUSED) whether or not the zone is known.
/// Only after that does a missing zone surface as not-found (NOTAUTH).
pub(crate) async fn authorized_zone(
    ctx: &ReqCtx,
) -> Result<(stratus_common::types::Zone, stratus_common::types::ProviderConfig)>
{
    let qname = ctx.qname.clone();
    let cred_tls = ctx.cred_tls.clone();
    let cred_tsig = ctx.tsig.as_ref().map(|(_, c)| c.clone());
    let loaded = ctx
        .app
        .store
        .read_async(move |tx| {
            let links = tx.zone_credentials(&qname)?;
            if let Err(e) = verify_zone_credentials(
                &links,
                cred_tls.as_ref(),
                cred_tsig.as_ref(),
            ) {
                return Ok(Err(e));
            }
            tx.zone_and_config(&qname).map(Ok)
        })
        .await;
    match loaded {
        Ok(Ok(found)) => Ok(found),
        Ok(Err(permission)) => Err(permission),
        Err(e) => Err(e.into()),
    }
}

/// Serves one accepted stream connection: read a message, handle it,
/// write the response(s), repeat. NOTIFY fan-out happens only after the
/// response bytes are on the wire, so a notified peer never races a
/// not-yet-committed change.
async fn run_conn<S>(
    app: Arc<App>,
    mut stream: S,
    cid: u64,
    ops: ListenerOps,
    cred_tls: Option<Credential>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut len = [0u8; 2];
        match timeout(IO_TIMEOUT, stream.read_exact(&mut len)).await {
            Ok(Ok(_)) => {}
            _ => return,
        }
        let size = usize::from(u16::from_be_bytes(len));
        let mut buf = vec![0u8; size];
        match timeout(IO_TIMEOUT, stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => {}
            _ => return,
        }

        let reply = match handle_message(
            app.clone(),
            cid,
            buf,
            ops,
            cred_tls.clone(),
            false,
        )
        .await
        {
            Some(reply) => reply,
            None => return,
        };
        metrics::DNS_REQUESTS
            .with_label_values(&[reply.kind, &reply.rcode])
            .inc();

        for frame in &reply.frames {
            let res =
                timeout(IO_TIMEOUT, stream.write_all(frame.as_stream_slice()))
                    .await;
            match res {
                Ok(Ok(_)) => {}
                _ => {
                    debug!(cid, "writing dns response failed, dropping connection");
                    return;
                }
            }
        }
        if let Some(zone) = reply.notify_zone {
            spawn_zone_notify(app.clone(), zone);
        }
        if reply.close {
            return;
        }
    }
}

/// Accept loop for a plain TCP listener.
pub async fn serve_tcp(app: Arc<App>, listener: TcpListener, ops: ListenerOps) {
    let mut shutdown = app.shutdown.clone();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    info!(err = %e, "accepting tcp dns connection");
                    continue;
                }
            },
        };
        let cid = next_cid();
        debug!(cid, remote = %peer, "new dns connection");
        let app = app.clone();
        crate::spawn_guarded("serving dns connection", async move {
            run_conn(app, stream, cid, ops, None).await;
            debug!(cid, "dns connection closed");
        });
    }
}

/// Accept loop for a TLS ("dot") listener with optional client certs.
///
/// A presented client certificate must match a stored tlspubkey credential
/// by its SPKI SHA-256 or the connection is dropped; the matched
/// credential authenticates UPDATE/AXFR on this connection.
pub async fn serve_tls(
    app: Arc<App>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ops: ListenerOps,
) {
    let mut shutdown = app.shutdown.clone();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    info!(err = %e, "accepting tls dns connection");
                    continue;
                }
            },
        };
        let cid = next_cid();
        debug!(cid, remote = %peer, "new dns-over-tls connection");
        let app = app.clone();
        let acceptor = acceptor.clone();
        crate::spawn_guarded("serving dns-over-tls connection", async move {
            let tls_stream = match timeout(
                TLS_HANDSHAKE_TIMEOUT,
                acceptor.accept(stream),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    info!(cid, err = %e, "tls handshake");
                    return;
                }
                Err(_) => {
                    info!(cid, "tls handshake timed out");
                    return;
                }
            };

            let cred_tls = match crate::tls::client_credential(
                &app,
                tls_stream.get_ref().1,
            )
            .await
            {
                Ok(cred) => cred,
                Err(e) => {
                    info!(cid, err = %e, "client certificate, closing connection");
                    return;
                }
            };
            if let Some(cred) = &cred_tls {
                debug!(cid, credential = %cred.name, "tls client authenticated");
            }

            run_conn(app, tls_stream, cid, ops, cred_tls).await;
            debug!(cid, "dns connection closed");
        });
    }
}

/// Receive loop for a UDP socket; each datagram is handled on its own
/// worker.
pub async fn serve_udp(app: Arc<App>, socket: UdpSocket, ops: ListenerOps) {
    let socket = Arc::new(socket);
    let mut shutdown = app.shutdown.clone();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, peer) = tokio::select! {
            _ = shutdown.changed() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    info!(err = %e, "reading udp dns packet");
                    continue;
                }
            },
        };
        let dgram = buf[..n].to_vec();
        let cid = next_cid();
        debug!(cid, remote = %peer, "new udp dns request");
        let app = app.clone();
        let socket = socket.clone();
        crate::spawn_guarded("serving udp dns request", async move {
            let Some(reply) =
                handle_message(app.clone(), cid, dgram, ops, None, true).await
            else {
                return;
            };
            metrics::DNS_REQUESTS
                .with_label_values(&[reply.kind, &reply.rcode])
                .inc();
            if let Some(frame) = reply.frames.first() {
                if let Err(e) = socket.send_to(frame.as_dgram_slice(), peer).await
                {
                    debug!(cid, err = %e, "writing udp dns response");
                    return;
                }
            }
            if let Some(zone) = reply.notify_zone {
                spawn_zone_notify(app, zone);
            }
        });
    }
}

