//! Outbound connections.
//!
//! [`connect`] returns the first stream immediately. Sends made before the
//! sockets are up are buffered; the stream's status callback reports
//! `Connected` or `ConnectionFailed` once the background handshake ends.
//!
//! # Handshake
//!
//! The target is resolved once. Each of the N sockets then connects,
//! trying the resolved addresses in order, sends the native header and reads
//! the peer's header back. Every reply must match the first one byte for
//! byte. The first failing socket fails the whole connection, exactly once,
//! and the other sockets are dropped.

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionUuid, StreamId};
use crate::options::SstOptions;
use crate::protocol::frame::FramingStyle;
use crate::protocol::handshake::{NATIVE_HEADER_LEN, NativeHeader};
use crate::stream::{ConnectionStatus, LogicalStream, StreamCallbacks, SubstreamCallback};
use crate::transport::connection::{MultiplexedConnection, Role, SocketParts};

// ============================================================================
// Dialer
// ============================================================================

/// Name resolution and TCP dialing used by [`connect_with`].
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Resolves `target` (`host:port`) to candidate addresses.
    async fn resolve(&self, target: &str) -> Result<Vec<SocketAddr>>;

    /// Opens the TCP socket for `slot`.
    async fn connect(&self, slot: usize, addr: SocketAddr) -> Result<TcpStream>;
}

/// [`Dialer`] backed by the tokio resolver and [`TcpSocket`].
///
/// Kernel buffer sizes of 0 keep the OS defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDialer {
    kernel_send_buffer_size: u32,
    kernel_receive_buffer_size: u32,
}

impl TokioDialer {
    /// Creates a dialer with the OS default socket buffers.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kernel_send_buffer_size: 0,
            kernel_receive_buffer_size: 0,
        }
    }

    /// Creates a dialer applying the kernel buffer sizes of `options`.
    #[inline]
    #[must_use]
    pub const fn from_options(options: &SstOptions) -> Self {
        Self {
            kernel_send_buffer_size: options.kernel_send_buffer_size,
            kernel_receive_buffer_size: options.kernel_receive_buffer_size,
        }
    }
}

#[async_trait]
impl Dialer for TokioDialer {
    async fn resolve(&self, target: &str) -> Result<Vec<SocketAddr>> {
        Ok(lookup_host(target).await?.collect())
    }

    async fn connect(&self, _slot: usize, addr: SocketAddr) -> Result<TcpStream> {
        let socket = tuned_socket(
            addr,
            self.kernel_send_buffer_size,
            self.kernel_receive_buffer_size,
        )?;
        Ok(socket.connect(addr).await?)
    }
}

/// Creates an unbound socket for `addr`'s family with `SO_SNDBUF` and
/// `SO_RCVBUF` set. A size of 0 leaves that buffer alone.
pub(crate) fn tuned_socket(
    addr: SocketAddr,
    send_buffer: u32,
    receive_buffer: u32,
) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if send_buffer > 0 {
        socket.set_send_buffer_size(send_buffer)?;
    }
    if receive_buffer > 0 {
        socket.set_recv_buffer_size(receive_buffer)?;
    }
    Ok(socket)
}

// ============================================================================
// Connect
// ============================================================================

/// Opens a multiplexed connection to `target` and returns its first stream.
///
/// # Arguments
///
/// * `target` - `host:port` to dial
/// * `options` - Socket count, buffer sizes and timeouts
/// * `substream` - Called for streams the peer opens, `None` to decline them
/// * `callbacks` - Callbacks of the returned stream
///
/// # Errors
///
/// - [`Error::Config`] if `options` are invalid or no tokio runtime is running
pub fn connect(
    target: &str,
    options: SstOptions,
    substream: Option<SubstreamCallback>,
    callbacks: StreamCallbacks,
) -> Result<LogicalStream> {
    let dialer = Arc::new(TokioDialer::from_options(&options));
    connect_with(dialer, target, options, substream, callbacks)
}

/// Like [`connect`], dialing through `dialer`.
///
/// # Errors
///
/// - [`Error::Config`] if `options` are invalid or no tokio runtime is running
pub fn connect_with(
    dialer: Arc<dyn Dialer>,
    target: &str,
    options: SstOptions,
    substream: Option<SubstreamCallback>,
    callbacks: StreamCallbacks,
) -> Result<LogicalStream> {
    options.validate()?;
    let runtime = Handle::try_current()
        .map_err(|e| Error::config(format!("No tokio runtime available: {e}")))?;

    let uuid = ConnectionUuid::generate();
    let connection = MultiplexedConnection::new(
        uuid,
        Role::Connector,
        FramingStyle::Native,
        options.clone(),
        runtime.clone(),
        substream,
    );
    connection.register(StreamId::INITIAL, callbacks);
    let stream = LogicalStream::new(StreamId::INITIAL, Arc::clone(&connection));

    debug!(%uuid, target, sockets = options.parallel_sockets, "Connecting");

    let task = runtime.spawn(establish(
        dialer,
        target.to_string(),
        options,
        uuid,
        Arc::downgrade(&connection),
    ));
    connection.track_task(task);

    Ok(stream)
}

// ============================================================================
// Establishment
// ============================================================================

async fn establish(
    dialer: Arc<dyn Dialer>,
    target: String,
    options: SstOptions,
    uuid: ConnectionUuid,
    connection: Weak<MultiplexedConnection>,
) {
    let sockets = options.parallel_sockets;

    let header = match NativeHeader::new(sockets, uuid).encode() {
        Ok(header) => header,
        Err(e) => return fail(&connection, &e),
    };

    let addresses = match dialer.resolve(&target).await {
        Ok(addresses) if !addresses.is_empty() => Arc::new(addresses),
        Ok(_) => {
            return fail(
                &connection,
                &Error::connection(format!("{target} resolved to no addresses")),
            );
        }
        Err(e) => return fail(&connection, &e),
    };
    trace!(%uuid, addresses = addresses.len(), "Resolved target");

    let mut slots = JoinSet::new();
    for slot in 0..sockets {
        let dialer = Arc::clone(&dialer);
        let addresses = Arc::clone(&addresses);
        let no_delay = options.no_delay;
        let limit = options.handshake_timeout();
        slots.spawn(async move {
            let result = open_slot(dialer.as_ref(), slot, &addresses, &header, no_delay, limit).await;
            (slot, result)
        });
    }

    let mut opened: Vec<Option<TcpStream>> = (0..sockets).map(|_| None).collect();
    let mut first_reply: Option<[u8; NATIVE_HEADER_LEN]> = None;

    while let Some(joined) = slots.join_next().await {
        let (slot, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => return fail(&connection, &Error::connection(format!("Socket task failed: {e}"))),
        };

        let checked = result.and_then(|(stream, reply)| match first_reply {
            None => {
                first_reply = Some(reply);
                Ok(stream)
            }
            Some(first) if first == reply => Ok(stream),
            Some(_) => Err(Error::connection_failed(
                slot,
                "Peer header differs from the first socket's",
            )),
        });

        match checked {
            Ok(stream) => {
                trace!(%uuid, slot, "Socket handshake complete");
                opened[slot] = Some(stream);
            }
            Err(e) => {
                warn!(%uuid, slot, error = %e, "Socket failed, abandoning connection");
                slots.abort_all();
                return fail(&connection, &e);
            }
        }
    }

    let parts: Vec<SocketParts> = opened
        .into_iter()
        .flatten()
        .map(|stream| SocketParts::from_tcp(stream, Vec::new()))
        .collect();

    match connection.upgrade() {
        Some(connection) => {
            connection.establish(parts);
        }
        None => debug!(%uuid, "Connection dropped during handshake"),
    }
}

/// Connects one socket and exchanges headers.
async fn open_slot(
    dialer: &dyn Dialer,
    slot: usize,
    addresses: &[SocketAddr],
    header: &[u8; NATIVE_HEADER_LEN],
    no_delay: bool,
    limit: Duration,
) -> Result<(TcpStream, [u8; NATIVE_HEADER_LEN])> {
    let mut last_error = None;

    for &addr in addresses {
        match dialer.connect(slot, addr).await {
            Ok(stream) => {
                trace!(slot, %addr, "Socket connected");
                stream.set_nodelay(no_delay)?;
                return exchange_header(stream, header, limit)
                    .await
                    .map_err(|e| Error::connection_failed(slot, e.to_string()));
            }
            Err(e) => {
                debug!(slot, %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(Error::connection_failed(
        slot,
        last_error.map_or_else(|| "No address to try".to_string(), |e| e.to_string()),
    ))
}

async fn exchange_header(
    mut stream: TcpStream,
    header: &[u8; NATIVE_HEADER_LEN],
    limit: Duration,
) -> Result<(TcpStream, [u8; NATIVE_HEADER_LEN])> {
    let exchange = async {
        stream.write_all(header).await?;
        let mut reply = [0u8; NATIVE_HEADER_LEN];
        stream.read_exact(&mut reply).await?;
        Ok::<_, Error>(reply)
    };

    let reply = timeout(limit, exchange)
        .await
        .map_err(|_| Error::handshake_timeout(limit.as_millis() as u64))??;
    NativeHeader::parse(&reply)?;

    Ok((stream, reply))
}

fn fail(connection: &Weak<MultiplexedConnection>, error: &Error) {
    if let Some(connection) = connection.upgrade() {
        connection.fail(ConnectionStatus::ConnectionFailed, &error.to_string());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    use crate::stream::Reliability;

    type Statuses = Arc<Mutex<Vec<ConnectionStatus>>>;

    fn recording(statuses: &Statuses) -> StreamCallbacks {
        let statuses = Arc::clone(statuses);
        StreamCallbacks::new().on_status(move |status, _| statuses.lock().push(status))
    }

    /// Accepts sockets and echoes each native header, optionally tampering
    /// with the reply of every socket after the first.
    async fn echo_server(tamper: bool) -> (SocketAddr, Arc<Mutex<Vec<TcpStream>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&accepted);

        tokio::spawn(async move {
            let mut count = 0;
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut header = [0u8; NATIVE_HEADER_LEN];
                if socket.read_exact(&mut header).await.is_err() {
                    continue;
                }
                if tamper && count > 0 {
                    header[NATIVE_HEADER_LEN - 1] ^= 0xFF;
                }
                count += 1;
                if socket.write_all(&header).await.is_ok() {
                    store.lock().push(socket);
                }
            }
        });

        (addr, accepted)
    }

    struct FlakyDialer {
        failing_slot: usize,
    }

    #[async_trait]
    impl Dialer for FlakyDialer {
        async fn resolve(&self, target: &str) -> Result<Vec<SocketAddr>> {
            TokioDialer::new().resolve(target).await
        }

        async fn connect(&self, slot: usize, addr: SocketAddr) -> Result<TcpStream> {
            if slot == self.failing_slot {
                sleep(Duration::from_millis(50)).await;
                return Err(Error::connection("Refused by test dialer"));
            }
            TokioDialer::new().connect(slot, addr).await
        }
    }

    struct NoAddresses;

    #[async_trait]
    impl Dialer for NoAddresses {
        async fn resolve(&self, _target: &str) -> Result<Vec<SocketAddr>> {
            Err(Error::connection("Name not known"))
        }

        async fn connect(&self, _slot: usize, _addr: SocketAddr) -> Result<TcpStream> {
            unreachable!("nothing resolved")
        }
    }

    #[tokio::test]
    async fn test_connects_all_sockets() {
        let (addr, accepted) = echo_server(false).await;
        let statuses: Statuses = Arc::default();
        let options = SstOptions::new().with_parallel_sockets(3);

        let stream = connect(&addr.to_string(), options, None, recording(&statuses))
            .expect("connect");
        assert!(stream.send(b"queued", Reliability::ReliableOrdered));

        for _ in 0..200 {
            if !statuses.lock().is_empty() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(*statuses.lock(), vec![ConnectionStatus::Connected]);
        assert_eq!(accepted.lock().len(), 3);
        assert_eq!(stream.remote_endpoint(), Some(addr));
    }

    #[tokio::test]
    async fn test_failed_slot_fails_connection_once() {
        let (addr, accepted) = echo_server(false).await;
        let statuses: Statuses = Arc::default();
        let options = SstOptions::new().with_parallel_sockets(2);

        let stream = connect_with(
            Arc::new(FlakyDialer { failing_slot: 1 }),
            &addr.to_string(),
            options,
            None,
            recording(&statuses),
        )
        .expect("connect");

        sleep(Duration::from_millis(200)).await;
        assert_eq!(*statuses.lock(), vec![ConnectionStatus::ConnectionFailed]);
        assert!(!stream.send(b"late", Reliability::ReliableOrdered));

        // The socket that did connect is released: the server sees EOF.
        let socket = accepted.lock().pop();
        if let Some(mut socket) = socket {
            let mut rest = Vec::new();
            timeout(Duration::from_secs(2), socket.read_to_end(&mut rest))
                .await
                .expect("released socket")
                .expect("read");
            assert!(rest.is_empty());
        }
    }

    #[tokio::test]
    async fn test_resolution_failure_reported() {
        let statuses: Statuses = Arc::default();
        let _stream = connect_with(
            Arc::new(NoAddresses),
            "nowhere.invalid:1",
            SstOptions::new(),
            None,
            recording(&statuses),
        )
        .expect("connect");

        sleep(Duration::from_millis(50)).await;
        assert_eq!(*statuses.lock(), vec![ConnectionStatus::ConnectionFailed]);
    }

    #[tokio::test]
    async fn test_mismatched_headers_fail_connection() {
        let (addr, _accepted) = echo_server(true).await;
        let statuses: Statuses = Arc::default();
        let options = SstOptions::new().with_parallel_sockets(2);

        let _stream = connect(&addr.to_string(), options, None, recording(&statuses))
            .expect("connect");

        sleep(Duration::from_millis(200)).await;
        assert_eq!(*statuses.lock(), vec![ConnectionStatus::ConnectionFailed]);
    }

    #[test]
    fn test_connect_requires_runtime() {
        let result = connect("127.0.0.1:1", SstOptions::new(), None, StreamCallbacks::new());
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let options = SstOptions::new().with_parallel_sockets(0);
        let result = connect("127.0.0.1:1", options, None, StreamCallbacks::new());
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_tuned_socket_sets_kernel_buffers() {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let socket = tuned_socket(addr, 65_536, 131_072).expect("socket");

        // Linux reports double the requested size, others at least it.
        assert!(socket.send_buffer_size().expect("sndbuf") >= 65_536);
        assert!(socket.recv_buffer_size().expect("rcvbuf") >= 131_072);
    }

    #[tokio::test]
    async fn test_tokio_dialer_applies_options() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let options = SstOptions::new().with_kernel_buffer_sizes(0, 131_072);
        let dialer = TokioDialer::from_options(&options);

        let stream = dialer.connect(0, addr).await.expect("connect");
        let socket = TcpSocket::from_std_stream(stream.into_std().expect("std stream"));
        assert!(socket.recv_buffer_size().expect("rcvbuf") >= 131_072);
    }
}
