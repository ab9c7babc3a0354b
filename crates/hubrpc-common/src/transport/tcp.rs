use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::Message;
use crate::transport::codec::{FrameCodec, MAX_FRAME_SIZE};
use crate::transport::connection::{
    next_connection_id, Connection, ConnectionEvents, ConnectionId, ConnectionRef,
};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// A TCP connection driven by a reader task and a writer task.
///
/// Outbound frames go through an unbounded channel to the writer task, so
/// [`send`](Connection::send) never blocks the caller. The reader task
/// frames inbound bytes with [`FrameCodec`] and hands each message to the
/// [`ConnectionEvents`] sink in arrival order.
///
/// The connection is torn down on:
/// - peer EOF or a read/write error
/// - a frame that fails to decode
/// - a declared frame, or an undecodable buffered prefix, larger than
///   [`MAX_FRAME_SIZE`]
/// - an explicit [`shutdown`](Connection::shutdown)
#[derive(Debug)]
pub struct TcpConnection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Bytes>,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
}

impl TcpConnection {
    /// Takes ownership of `stream` and starts its reader and writer tasks.
    ///
    /// `events.on_connected` runs on the reader task before the first read.
    pub fn spawn(stream: TcpStream, events: Arc<dyn ConnectionEvents>) -> ConnectionRef {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let conn = Arc::new(TcpConnection {
            id: next_connection_id(),
            peer,
            outbound,
            connected: AtomicBool::new(true),
            closed,
        });

        tokio::spawn(write_loop(conn.clone(), writer, outbound_rx));
        tokio::spawn(read_loop(conn.clone(), reader, events));

        conn
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: &Message) -> Result<()> {
        if !self.connected() {
            return Err(RpcError::ConnectionClosed);
        }
        let frame = FrameCodec::encode(message)?;
        self.outbound
            .send(frame)
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn shutdown(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(conn = self.id, "shutting down connection");
            self.closed.send_replace(true);
        }
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

async fn read_loop(conn: Arc<TcpConnection>, mut reader: OwnedReadHalf, events: Arc<dyn ConnectionEvents>) {
    let conn_ref: ConnectionRef = conn.clone();
    events.on_connected(&conn_ref);

    let mut closed = conn.closed.subscribe();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

    'read: loop {
        if *closed.borrow() {
            break;
        }

        tokio::select! {
            _ = closed.changed() => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(conn = conn.id, "peer closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(conn = conn.id, error = %map_io_error(e, "reading frame"), "read failed");
                    break;
                }
            }
        }

        loop {
            if let Some(frame_len) = FrameCodec::declared_frame_len(&buf) {
                if frame_len > MAX_FRAME_SIZE {
                    error!(conn = conn.id, frame_len, max = MAX_FRAME_SIZE, "declared frame too large");
                    break 'read;
                }
            }
            if !FrameCodec::can_decode(&buf) {
                if buf.len() > MAX_FRAME_SIZE {
                    error!(conn = conn.id, buffered = buf.len(), "read buffer exceeded limit");
                    break 'read;
                }
                break;
            }

            match FrameCodec::decode(&mut buf) {
                Ok(message) => events.on_message(&conn_ref, message),
                Err(e) => {
                    error!(conn = conn.id, error = %e, "failed to decode frame");
                    break 'read;
                }
            }

            if !conn.connected() {
                break 'read;
            }
        }
    }

    conn.shutdown();
    events.on_closed(&conn_ref);
}

async fn write_loop(
    conn: Arc<TcpConnection>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut closed = conn.closed.subscribe();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        warn!(conn = conn.id, error = %map_io_error(e, "writing frame"), "write failed");
                        conn.shutdown();
                        break;
                    }
                }
                None => break,
            },
            _ = closed.changed() => {
                // Flush frames queued before the shutdown.
                while let Ok(frame) = outbound.try_recv() {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(conn = conn.id, error = %e, "error shutting down writer");
    }
}

/// Map IO errors to connection-level errors.
fn map_io_error(err: std::io::Error, context: &str) -> RpcError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe => {
            RpcError::Connection(format!("{}: Connection lost", context))
        }
        _ => RpcError::Io(err),
    }
}

/// Outbound TCP connector.
pub struct TcpTransport;

impl TcpTransport {
    /// Connects to a remote endpoint and starts its connection tasks.
    ///
    /// This method resolves the address (which may resolve to multiple
    /// addresses) and attempts to connect to each until one succeeds.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to connect to (e.g., "127.0.0.1:8080")
    /// * `events` - Sink for messages arriving on the connection
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be resolved or every resolved
    /// address refuses the connection.
    pub async fn connect(addr: &str, events: Arc<dyn ConnectionEvents>) -> Result<ConnectionRef> {
        let socket_addrs = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match TcpStream::connect(socket_addr).await {
                Ok(stream) => {
                    debug!(%socket_addr, "connected");
                    return Ok(TcpConnection::spawn(stream, events));
                }
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }

        Err(RpcError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }
}
