//! Inbound connections.
//!
//! [`SstListener`] accepts raw sockets, reads either a native header or an
//! HTTP WebSocket upgrade from each, and groups sockets by connection UUID.
//! Once all sockets of a connection have arrived the replies are written and
//! the application is offered stream 1.
//!
//! # Handshakes
//!
//! | First bytes | Handshake | Framing |
//! |-------------|-----------|---------|
//! | `SSTTCP` | 24-byte native header, echoed back | Native |
//! | `GET ` with `Sec-WebSocket-Version` | RFC6455 | WebSocket |
//! | `GET ` without a version | hixie-76, 8 key bytes follow the head | Zero-delimited |
//!
//! Sets that are still incomplete after the handshake timeout are dropped,
//! closing their sockets.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs, lookup_host};
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionUuid, StreamId};
use crate::options::SstOptions;
use crate::protocol::frame::FramingStyle;
use crate::protocol::handshake::{
    HIXIE_KEY3_LEN, NATIVE_HEADER_LEN, NativeHeader, UpgradeRequest, find_header_end, is_http,
};
use crate::stream::SubstreamCallback;
use crate::transport::connect::tuned_socket;
use crate::transport::connection::{MultiplexedConnection, Role, SocketParts};

// ============================================================================
// Constants
// ============================================================================

/// Accept poll interval, bounding how long shutdown takes to be noticed.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pending connection backlog of the listening socket.
const LISTEN_BACKLOG: u32 = 1024;

/// Bytes that distinguish an HTTP request from a native header.
const SNIFF_LEN: usize = 4;

/// Read size while collecting an HTTP request head.
const HEAD_READ_CHUNK: usize = 512;

// ============================================================================
// SstListener
// ============================================================================

/// Accepts multiplexed connections on one address.
///
/// `on_stream` receives stream 1 of every new connection and, later, every
/// stream the peer opens on it. Returning `None` declines the stream.
pub struct SstListener {
    local_addr: SocketAddr,
    options: SstOptions,
    shutdown: AtomicBool,
    registry: Arc<HandshakeRegistry>,
    on_stream: SubstreamCallback,
}

/// Binds a listener; see [`SstListener::bind`].
///
/// # Errors
///
/// - [`Error::Config`] if `options` are invalid
/// - [`Error::Io`] if binding fails
pub async fn listen(
    addr: impl ToSocketAddrs,
    options: SstOptions,
    on_stream: SubstreamCallback,
) -> Result<Arc<SstListener>> {
    SstListener::bind(addr, options, on_stream).await
}

impl SstListener {
    /// Binds `addr` and starts accepting.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `options` are invalid
    /// - [`Error::Io`] if binding fails
    pub async fn bind(
        addr: impl ToSocketAddrs,
        options: SstOptions,
        on_stream: SubstreamCallback,
    ) -> Result<Arc<Self>> {
        options.validate()?;

        let listener = bind_listener(addr, &options).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "Listener bound");

        let this = Arc::new(Self {
            local_addr,
            options,
            shutdown: AtomicBool::new(false),
            registry: Arc::new(HandshakeRegistry::default()),
            on_stream,
        });

        let accepting = Arc::clone(&this);
        tokio::spawn(async move {
            accepting.accept_loop(listener).await;
        });

        info!(%local_addr, "Listener started");
        Ok(this)
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections with sockets still missing.
    #[inline]
    #[must_use]
    pub fn pending_handshakes(&self) -> usize {
        self.registry.len()
    }

    /// Stops accepting and drops incomplete socket sets.
    ///
    /// Established connections are not affected.
    pub fn shutdown(&self) {
        info!(local_addr = %self.local_addr, "Listener shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
        let dropped = self.registry.clear();
        if dropped > 0 {
            debug!(dropped, "Dropped partial socket sets");
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("Accept loop shutting down");
                break;
            }

            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let listener = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = listener.handle_socket(stream, addr).await {
                            warn!(error = %e, ?addr, "Socket handshake failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    async fn handle_socket(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        trace!(?addr, "New TCP connection");
        stream.set_nodelay(self.options.no_delay)?;

        let limit = self.options.handshake_timeout();
        let accepted = timeout(limit, read_handshake(&mut stream, self.options.max_websocket_header))
            .await
            .map_err(|_| Error::handshake_timeout(limit.as_millis() as u64))??;

        debug!(
            ?addr,
            uuid = %accepted.uuid,
            sockets = accepted.sockets,
            style = ?accepted.style,
            "Socket handshake parsed"
        );

        let uuid = accepted.uuid;
        let style = accepted.style;
        let member = HalfOpen {
            stream,
            reply: accepted.reply,
            leftover: accepted.leftover,
        };

        if let Some(members) = self.registry.add(uuid, accepted.sockets, style, member, limit)? {
            self.complete(uuid, style, members).await?;
        }
        Ok(())
    }

    /// Replies on every socket and hands the connection to the application.
    async fn complete(
        &self,
        uuid: ConnectionUuid,
        style: FramingStyle,
        mut members: Vec<HalfOpen>,
    ) -> Result<()> {
        for member in &mut members {
            member.stream.write_all(&member.reply).await?;
        }

        let options = self.options.clone().with_parallel_sockets(members.len());
        let connection = MultiplexedConnection::new(
            uuid,
            Role::Acceptor,
            style,
            options,
            Handle::current(),
            Some(Arc::clone(&self.on_stream)),
        );

        connection.reserve_substream(StreamId::INITIAL);
        connection.accept_substream(StreamId::INITIAL, None);

        let parts = members
            .into_iter()
            .map(|member| SocketParts::from_tcp(member.stream, member.leftover))
            .collect();
        if !connection.establish(parts) {
            debug!(%uuid, "Connection declined by application");
        }
        Ok(())
    }
}

impl Drop for SstListener {
    fn drop(&mut self) {
        self.registry.clear();
    }
}

impl std::fmt::Debug for SstListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstListener")
            .field("local_addr", &self.local_addr)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .field("pending_handshakes", &self.registry.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Handshake Parsing
// ============================================================================

/// Outcome of one socket's handshake.
struct Accepted {
    uuid: ConnectionUuid,
    sockets: usize,
    style: FramingStyle,
    reply: Vec<u8>,
    leftover: Vec<u8>,
}

async fn read_handshake(stream: &mut TcpStream, max_header: usize) -> Result<Accepted> {
    let mut buf = vec![0u8; SNIFF_LEN];
    stream.read_exact(&mut buf).await?;

    if !is_http(&buf) {
        buf.resize(NATIVE_HEADER_LEN, 0);
        stream.read_exact(&mut buf[SNIFF_LEN..]).await?;
        let header = NativeHeader::parse(&buf)?;
        return Ok(Accepted {
            uuid: header.uuid,
            sockets: header.sockets,
            style: FramingStyle::Native,
            reply: buf,
            leftover: Vec::new(),
        });
    }

    let head_len = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() >= max_header {
            return Err(Error::handshake(format!(
                "Upgrade request exceeds {max_header} bytes"
            )));
        }
        let mut chunk = [0u8; HEAD_READ_CHUNK];
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(Error::disconnected("Socket closed during upgrade request"));
        }
        buf.extend_from_slice(&chunk[..read]);
    };

    let request = UpgradeRequest::parse(&buf[..head_len])?;
    let mut rest = buf.split_off(head_len);

    let mut key3 = [0u8; HIXIE_KEY3_LEN];
    if request.expects_key3() {
        let have = rest.len();
        if have < HIXIE_KEY3_LEN {
            rest.resize(HIXIE_KEY3_LEN, 0);
            stream.read_exact(&mut rest[have..]).await?;
        }
        key3.copy_from_slice(&rest[..HIXIE_KEY3_LEN]);
        rest.drain(..HIXIE_KEY3_LEN);
    }

    Ok(Accepted {
        uuid: request.uuid,
        sockets: request.sockets,
        style: request.framing_style(),
        reply: request.response(&key3)?,
        leftover: rest,
    })
}

// ============================================================================
// HandshakeRegistry
// ============================================================================

/// A socket waiting for the rest of its connection.
struct HalfOpen {
    stream: TcpStream,
    reply: Vec<u8>,
    leftover: Vec<u8>,
}

struct PartialSet {
    expected: usize,
    style: FramingStyle,
    members: Vec<HalfOpen>,
    generation: u64,
}

/// Incomplete socket sets of one listener, keyed by connection UUID.
#[derive(Default)]
struct HandshakeRegistry {
    pending: Mutex<FxHashMap<ConnectionUuid, PartialSet>>,
    next_generation: AtomicU64,
}

impl HandshakeRegistry {
    /// Adds a socket; returns the full set once `expected` sockets arrived.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the socket disagrees with the set on
    /// socket count or framing; the whole set is dropped.
    fn add(
        self: &Arc<Self>,
        uuid: ConnectionUuid,
        expected: usize,
        style: FramingStyle,
        member: HalfOpen,
        limit: Duration,
    ) -> Result<Option<Vec<HalfOpen>>> {
        let mut pending = self.pending.lock();

        if let Some(set) = pending.get_mut(&uuid) {
            if set.expected != expected || set.style != style {
                let (had, style_seen) = (set.expected, set.style);
                pending.remove(&uuid);
                return Err(Error::handshake(format!(
                    "Socket of {uuid} announces {expected} sockets ({style:?}), set expects {had} ({style_seen:?})"
                )));
            }
            set.members.push(member);
            trace!(%uuid, have = set.members.len(), expected, "Socket joined partial set");
            if set.members.len() < set.expected {
                return Ok(None);
            }
            return Ok(pending.remove(&uuid).map(|set| set.members));
        }

        if expected == 1 {
            return Ok(Some(vec![member]));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        pending.insert(
            uuid,
            PartialSet {
                expected,
                style,
                members: vec![member],
                generation,
            },
        );
        drop(pending);

        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep(limit).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(uuid, generation);
            }
        });

        Ok(None)
    }

    fn expire(&self, uuid: ConnectionUuid, generation: u64) {
        let mut pending = self.pending.lock();
        if !pending
            .get(&uuid)
            .is_some_and(|set| set.generation == generation)
        {
            return;
        }
        if let Some(set) = pending.remove(&uuid) {
            warn!(
                %uuid,
                received = set.members.len(),
                expected = set.expected,
                "Handshake timed out, dropping partial socket set"
            );
        }
    }

    fn clear(&self) -> usize {
        let drained: Vec<PartialSet> = self.pending.lock().drain().map(|(_, set)| set).collect();
        drained.len()
    }

    fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

// ============================================================================
// Binding
// ============================================================================

/// Binds the first usable address of `addr`. Accepted sockets inherit the
/// kernel buffer sizes set on the listening socket.
async fn bind_listener(addr: impl ToSocketAddrs, options: &SstOptions) -> Result<TcpListener> {
    let mut last_error = None;

    for addr in lookup_host(addr).await? {
        let bound = tuned_socket(
            addr,
            options.kernel_send_buffer_size,
            options.kernel_receive_buffer_size,
        )
        .and_then(|socket| {
            #[cfg(unix)]
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(LISTEN_BACKLOG)
        });

        match bound {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                trace!(%addr, error = %e, "Bind failed, trying next address");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.map_or_else(
        || Error::config("Listen address resolved to nothing"),
        Error::from,
    ))
}

// ============================================================================
// Tests
// ============================================================================
