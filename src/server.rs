use anyhow::{anyhow, bail, Context, Result};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore,
};
use std::{
    fs::File,
    future::Future,
    io::BufReader as StdBufReader,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::engine::{ConnectionId, Engine, Envelope, Origin, Scheduler};
use crate::protocol::{Request, Response};

/// Accepts mutually-authenticated TLS connections until `shutdown` resolves.
///
/// ## Protocol
/// - One JSON request per `\n`-terminated line: `{"cmd": "...", "args": {...}}`
/// - One JSON response per line, in request order on each connection;
///   the `dump` follow-up notice arrives whenever its export finishes
/// - A line that is not a JSON request object gets
///   `{"status":"error","message":"Malformed JSON"}` and the connection
///   stays open
///
/// ## Connection Lifecycle
/// 1. Accept TCP, complete the TLS handshake (client certificate required)
/// 2. Assign a connection id and spawn a session task
/// 3. Frame lines, submit each request to the scheduler
/// 4. On EOF, wait for outstanding responses, then drop the cursor
///
/// ## Arguments
/// * `engine` - Shared engine, used to tear down per-connection state
/// * `scheduler` - The single command scheduler every session submits to
/// * `acceptor` - TLS acceptor from [`tls_acceptor`]
/// * `addr` - Bind address (e.g., "0.0.0.0:9999")
/// * `shutdown` - Resolves when the listener should stop accepting
pub async fn serve(
    engine: Arc<Engine>,
    scheduler: Arc<Scheduler>,
    acceptor: TlsAcceptor,
    addr: &str,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, policy = ?scheduler.policy(), "listening");

    let next_id = AtomicU64::new(1);
    tokio::pin!(shutdown);
    loop {
        let (socket, peer) = tokio::select! {
            _ = &mut shutdown => {
                info!("listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let acceptor = acceptor.clone();
        let engine = engine.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(socket).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%peer, error = %e, "tls handshake failed");
                    return;
                }
            };
            info!(%peer, conn = id, "client connected");
            handle_session(stream, id, &engine, &scheduler).await;
            info!(%peer, conn = id, "client disconnected");
        });
    }
}

/// What the writer sends next, in request order.
enum Outgoing {
    /// A submitted command whose response may not exist yet.
    Pending(oneshot::Receiver<Response>),
    /// A response produced without the scheduler (malformed input).
    Ready(Response),
}

/// Runs one client session over any ordered byte stream.
///
/// Responses are written by a dedicated writer task, so slow commands never
/// block reading the next request. The writer answers requests strictly in
/// the order they were read, whatever order the scheduler completes them in;
/// out-of-band notices (the `dump` follow-up) are written whenever no
/// in-order response is ready. Partial lines are buffered until their
/// terminator arrives; a trailing partial line at EOF is discarded. Once the
/// peer closes, the session waits until every command it submitted has
/// answered before releasing its cursor.
pub async fn handle_session<S>(stream: S, id: ConnectionId, engine: &Engine, scheduler: &Scheduler)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (ordered, ordered_rx) = mpsc::unbounded_channel::<Outgoing>();
    let (notices, notices_rx) = mpsc::unbounded_channel::<Response>();
    let writer = tokio::spawn(write_responses(write_half, ordered_rx, notices_rx, id));

    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) if line.last() != Some(&b'\n') => {
                debug!(conn = id, bytes = line.len(), "discarding unterminated line at eof");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(conn = id, error = %e, "read failed");
                break;
            }
        }

        let body = trim_line(&line);
        if body.is_empty() {
            continue;
        }
        let next = match Request::decode(body) {
            Ok(request) => {
                let envelope = Envelope::new(&request, Origin::new(id, notices.clone()));
                Outgoing::Pending(scheduler.submit(envelope))
            }
            Err(e) => {
                debug!(conn = id, error = %e, "malformed request");
                Outgoing::Ready(Response::malformed())
            }
        };
        if ordered.send(next).is_err() {
            break;
        }
    }

    drop(ordered);
    drop(notices);
    if let Err(e) = writer.await {
        warn!(conn = id, error = %e, "response writer failed");
    }
    engine.release_connection(id);
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end.max(start)]
}

/// Drains both queues onto the socket, in-order responses first. After the
/// first write error everything else is consumed and discarded so in-flight
/// commands still complete.
async fn write_responses<W>(
    mut w: W,
    mut ordered: mpsc::UnboundedReceiver<Outgoing>,
    mut notices: mpsc::UnboundedReceiver<Response>,
    id: ConnectionId,
) where
    W: AsyncWrite + Unpin,
{
    let mut open = true;
    loop {
        let response = tokio::select! {
            biased;
            Some(next) = ordered.recv() => match next {
                Outgoing::Ready(response) => response,
                Outgoing::Pending(rx) => match rx.await {
                    Ok(response) => response,
                    Err(_) => {
                        warn!(conn = id, "command dropped without a response");
                        continue;
                    }
                },
            },
            Some(notice) = notices.recv() => notice,
            else => break,
        };
        if !open {
            continue;
        }
        let line = response.encode();
        if let Err(e) = async {
            w.write_all(&line).await?;
            w.flush().await
        }
        .await
        {
            debug!(conn = id, error = %e, "connection no longer writable, dropping responses");
            open = false;
        }
    }
    if open {
        let _ = w.shutdown().await;
    }
}

/// Builds the TLS acceptor from PEM files.
///
/// Client certificates are mandatory and must chain to the configured CA;
/// a client without one never reaches the command scheduler.
pub fn tls_acceptor(config: &ServerConfig) -> Result<TlsAcceptor> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in load_certs(&config.ca_path)? {
        roots.add(cert).context("adding CA certificate")?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .context("building client certificate verifier")?;

    let tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&config.cert_path)?, load_key(&config.key_path)?)
        .context("loading server certificate")?;
    Ok(TlsAcceptor::from(Arc::new(tls)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut StdBufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading certificates from {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    rustls_pemfile::private_key(&mut StdBufReader::new(file))
        .with_context(|| format!("reading private key from {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}
