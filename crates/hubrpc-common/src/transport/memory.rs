use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::Message;
use crate::sync::lock;
use crate::transport::codec::FrameCodec;
use crate::transport::connection::{next_connection_id, Connection, ConnectionId};

/// In-process connection that records everything sent through it.
///
/// Each message is run through [`FrameCodec::encode`] and decoded back
/// before being stored, so what an observer sees is exactly what a peer
/// would receive. Used to drive managers without sockets.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    connected: AtomicBool,
    sent: Mutex<Vec<Message>>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            id: next_connection_id(),
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Removes and returns everything sent so far.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: &Message) -> Result<()> {
        if !self.connected() {
            return Err(RpcError::ConnectionClosed);
        }
        let mut frame = bytes::BytesMut::from(&FrameCodec::encode(message)?[..]);
        let delivered = FrameCodec::decode(&mut frame)?;
        lock(&self.sent).push(delivered);
        Ok(())
    }

    fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
