//! Request/reply transport over TCP
//!
//! Frames are length-prefixed and carry length-prefixed parts: requests are
//! three parts (client id, request id, payload), replies two (request id,
//! payload). The client keeps a pending map keyed by request id; replies
//! can arrive out of order and requests are retried on timeout.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::wire::rand_id;
use crate::DistError;

pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Upper bound on one frame, caps allocation on corrupt length prefixes.
const MAX_FRAME: usize = 1 << 30;

/// Reconnect/expiry tick while disconnected with work queued.
const RECONNECT_TICK: Duration = Duration::from_millis(200);

fn strip_scheme(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}

// ============================================================================
// FRAMING
// ============================================================================

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    parts: &[&[u8]],
) -> io::Result<()> {
    let total: usize = 1 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(4 + total);
    buf.put_u32_le(total as u32);
    buf.put_u8(parts.len() as u8);
    for part in parts {
        buf.put_u32_le(part.len() as u32);
        buf.put_slice(part);
    }
    writer.write_all(&buf).await
}

/// Read one frame; `None` on clean end of stream.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<Vec<Vec<u8>>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let total = u32::from_le_bytes(len_buf) as usize;
    if total == 0 || total > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length {total}"),
        ));
    }
    let mut body = vec![0u8; total];
    reader.read_exact(&mut body).await?;

    let nparts = body[0] as usize;
    let mut parts = Vec::with_capacity(nparts);
    let mut offset = 1;
    for _ in 0..nparts {
        if offset + 4 > body.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame part"));
        }
        let len =
            u32::from_le_bytes([body[offset], body[offset + 1], body[offset + 2], body[offset + 3]])
                as usize;
        offset += 4;
        if offset + len > body.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame part"));
        }
        parts.push(body[offset..offset + len].to_vec());
        offset += len;
    }
    if offset != body.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "trailing bytes in frame",
        ));
    }
    Ok(Some(parts))
}

// ============================================================================
// SERVER
// ============================================================================

/// Handler for one request payload; `None` drops the message without reply.
pub type ServerCallback = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Listening side of the request/reply pair. One task per connection.
pub struct ReqRepServer {
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl ReqRepServer {
    /// Bind to `endpoint` (`host:port` or `tcp://host:port`), or to an
    /// ephemeral port on all interfaces when `None`.
    pub async fn bind(endpoint: Option<&str>, callback: ServerCallback) -> Result<Self, DistError> {
        let addr = endpoint.map_or("0.0.0.0:0", strip_scheme);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("reqrep server bound to tcp://{}", local_addr);

        let accept = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                while connections.try_join_next().is_some() {}
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let callback = Arc::clone(&callback);
                        connections.spawn(handle_connection(stream, callback));
                    }
                    Err(e) => tracing::warn!("reqrep server accept failed: {}", e),
                }
            }
        });

        Ok(Self { local_addr, accept })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }
}

impl Drop for ReqRepServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn handle_connection(mut stream: TcpStream, callback: ServerCallback) {
    loop {
        let parts = match read_frame(&mut stream).await {
            Ok(Some(parts)) => parts,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("reqrep server read error: {}", e);
                return;
            }
        };
        if parts.len() != 3 {
            tracing::warn!(
                "reqrep server got invalid request ({} parts instead of 3)",
                parts.len()
            );
            continue;
        }
        match callback(&parts[2]) {
            Some(reply) => {
                if let Err(e) = write_frame(&mut stream, &[&parts[1], &reply]).await {
                    tracing::warn!("reqrep server failed sending reply: {}", e);
                    return;
                }
            }
            None => tracing::warn!("reqrep server: reply was not sent in callback"),
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

struct QueueItem {
    msg: Vec<u8>,
    done: oneshot::Sender<Result<Vec<u8>, DistError>>,
    retries: u32,
}

struct Pending {
    item: QueueItem,
    sent: Instant,
}

/// Requesting side: submits framed requests, matches replies by request id,
/// retries on timeout, round-robins over endpoints on connect failure.
pub struct ReqRepClient {
    tx: mpsc::UnboundedSender<QueueItem>,
    reply_timeout_ms: Arc<AtomicU64>,
    max_retries: Arc<AtomicU32>,
}

impl ReqRepClient {
    /// Must be called from within a tokio runtime.
    pub fn new(max_concurrent_requests: usize, endpoints: Vec<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let reply_timeout_ms = Arc::new(AtomicU64::new(DEFAULT_REPLY_TIMEOUT_MS));
        let max_retries = Arc::new(AtomicU32::new(DEFAULT_MAX_RETRIES));
        tokio::spawn(run_client(
            rx,
            endpoints,
            Arc::clone(&reply_timeout_ms),
            Arc::clone(&max_retries),
            max_concurrent_requests,
        ));
        Self {
            tx,
            reply_timeout_ms,
            max_retries,
        }
    }

    /// Send one request and wait for its reply (or retry exhaustion).
    pub async fn request(&self, msg: Vec<u8>) -> Result<Vec<u8>, DistError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(QueueItem {
                msg,
                done,
                retries: 0,
            })
            .map_err(|_| DistError::Terminated)?;
        rx.await.map_err(|_| DistError::Terminated)?
    }

    pub fn set_reply_timeout_ms(&self, timeout: u64) {
        self.reply_timeout_ms.store(timeout, Ordering::Relaxed);
    }

    pub fn set_max_retries(&self, count: u32) {
        self.max_retries.store(count, Ordering::Relaxed);
    }
}

enum Event {
    NewItem(Option<QueueItem>),
    Read(io::Result<Option<Vec<Vec<u8>>>>),
    Tick,
}

async fn run_client(
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    endpoints: Vec<String>,
    reply_timeout_ms: Arc<AtomicU64>,
    max_retries: Arc<AtomicU32>,
    max_concurrent: usize,
) {
    let client_id = rand_id(8);
    let mut endpoint_idx = 0usize;
    let mut stream: Option<TcpStream> = None;
    let mut queue: VecDeque<QueueItem> = VecDeque::new();
    let mut pending: HashMap<String, Pending> = HashMap::new();

    if endpoints.is_empty() {
        tracing::warn!("no endpoints set for reqrep client, requests will stall");
    }

    loop {
        // (Re)connect when there is work to move.
        if stream.is_none()
            && !endpoints.is_empty()
            && !(queue.is_empty() && pending.is_empty())
        {
            let endpoint = &endpoints[endpoint_idx % endpoints.len()];
            endpoint_idx += 1;
            match tokio::time::timeout(
                Duration::from_secs(5),
                TcpStream::connect(strip_scheme(endpoint)),
            )
            .await
            {
                Ok(Ok(s)) => {
                    tracing::info!("reqrep client connected to {}", endpoint);
                    stream = Some(s);
                }
                Ok(Err(e)) => {
                    tracing::warn!("reqrep client cannot connect to {}: {}", endpoint, e)
                }
                Err(_) => tracing::warn!("reqrep client connect to {} timed out", endpoint),
            }
        }

        // Send while the in-flight cap allows.
        while stream.is_some() && pending.len() < max_concurrent && !queue.is_empty() {
            let item = queue.pop_front().unwrap();
            // Each attempt gets a fresh request id.
            let id = rand_id(8);
            let writer = stream.as_mut().unwrap();
            match write_frame(writer, &[client_id.as_bytes(), id.as_bytes(), &item.msg]).await {
                Ok(()) => {
                    pending.insert(
                        id,
                        Pending {
                            item,
                            sent: Instant::now(),
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!("reqrep client error sending data: {}", e);
                    queue.push_front(item);
                    stream = None;
                    break;
                }
            }
        }

        // Earliest deadline: oldest in-flight request, or a reconnect tick.
        let timeout = Duration::from_millis(reply_timeout_ms.load(Ordering::Relaxed));
        let mut deadline: Option<Instant> = pending.values().map(|p| p.sent + timeout).min();
        if stream.is_none() && !(queue.is_empty() && pending.is_empty()) {
            let tick = Instant::now() + RECONNECT_TICK;
            deadline = Some(deadline.map_or(tick, |d| d.min(tick)));
        }

        let event = tokio::select! {
            item = rx.recv() => Event::NewItem(item),
            frame = async {
                match stream.as_mut() {
                    Some(s) => read_frame(s).await,
                    None => std::future::pending().await,
                }
            } => Event::Read(frame),
            _ = async { tokio::time::sleep_until(deadline.unwrap().into()).await },
                if deadline.is_some() => Event::Tick,
        };

        match event {
            Event::NewItem(Some(item)) => queue.push_back(item),
            Event::NewItem(None) => return,
            Event::Read(Ok(Some(parts))) if parts.len() == 2 => {
                let id = String::from_utf8_lossy(&parts[0]).into_owned();
                match pending.remove(&id) {
                    Some(p) => {
                        let _ = p.item.done.send(Ok(parts[1].clone()));
                    }
                    None => {
                        tracing::warn!("reqrep client has no request with id '{}', ignoring", id)
                    }
                }
            }
            Event::Read(Ok(Some(parts))) => tracing::warn!(
                "reqrep client got invalid reply ({} parts instead of 2)",
                parts.len()
            ),
            Event::Read(Ok(None)) => {
                tracing::warn!("reqrep client connection closed by server");
                stream = None;
            }
            Event::Read(Err(e)) => {
                tracing::warn!("reqrep client read error: {}", e);
                stream = None;
            }
            Event::Tick => {}
        }

        // Requeue expired requests, fail them past the retry budget.
        let now = Instant::now();
        let retries_allowed = max_retries.load(Ordering::Relaxed);
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.sent + timeout <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            let mut p = pending.remove(&id).unwrap();
            if p.item.retries < retries_allowed {
                p.item.retries += 1;
                tracing::warn!(
                    "reqrep client timeout {} for request '{}'",
                    p.item.retries,
                    id
                );
                queue.push_back(p.item);
            } else {
                let _ = p.item.done.send(Err(DistError::MaxRetries));
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
