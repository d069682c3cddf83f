//! TCP transport for delivering cluster messages to members.
//!
//! [`TcpTransport`] keeps one pooled connection per `host:port` target and
//! writes messages as length-prefixed postcard frames. The receive side is
//! [`TcpTransport::serve`], which reads frames off accepted connections and
//! hands them to a message handler.

use std::collections::HashMap;
use std::sync::Arc;

use berth_types::ClusterMember;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::message::ClusterMessage;

/// Maximum frame size: 16 MB. Facade payloads are small control messages,
/// but replayed state-sync messages can carry serialized context.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Pooled TCP transport for inter-member messages.
pub struct TcpTransport {
    /// Cached connections keyed by `host:port`.
    ///
    /// The outer `Mutex` (not `RwLock`) prevents the TOCTOU race where
    /// concurrent callers all see "no cached connection" and each dial the
    /// same member, overwriting each other in the cache. Writes to one
    /// member are serialized by the per-connection inner lock.
    connections: Mutex<HashMap<String, Arc<Mutex<TcpStream>>>>,
}

impl TcpTransport {
    /// Create an empty transport. Connections are dialed lazily.
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Get or establish a pooled connection to `target`.
    ///
    /// Holds the pool lock across the dial so concurrent callers cannot
    /// create duplicate connections to the same member.
    async fn get_connection(&self, target: &str) -> Result<Arc<Mutex<TcpStream>>, NetError> {
        let mut pool = self.connections.lock().await;

        if let Some(conn) = pool.get(target) {
            return Ok(conn.clone());
        }

        debug!(%target, "connecting to member");
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| NetError::Connect(format!("{target}: {e}")))?;

        let conn = Arc::new(Mutex::new(stream));
        pool.insert(target.to_string(), conn.clone());
        Ok(conn)
    }

    /// Drop a pooled connection (after detecting it is dead).
    async fn remove_connection(&self, target: &str) {
        let mut pool = self.connections.lock().await;
        pool.remove(target);
    }

    /// Write a single length-prefixed postcard frame to `stream`.
    ///
    /// The frame is a 4-byte big-endian length followed by the
    /// postcard-encoded message.
    pub async fn write_frame(
        stream: &mut TcpStream,
        message: &ClusterMessage,
    ) -> Result<(), NetError> {
        let payload =
            postcard::to_allocvec(message).map_err(|e| NetError::Serialization(e.to_string()))?;

        stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read a single length-prefixed postcard frame from `stream`.
    pub async fn read_frame(stream: &mut TcpStream) -> Result<ClusterMessage, NetError> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(NetError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        postcard::from_bytes(&payload).map_err(|e| NetError::Serialization(e.to_string()))
    }

    /// Accept connections on `listener` and dispatch inbound messages to
    /// `handler`. Runs until the listener fails.
    pub async fn serve<F, Fut>(listener: TcpListener, handler: F)
    where
        F: Fn(ClusterMessage) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        loop {
            match listener.accept().await {
                Ok((mut stream, peer)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        loop {
                            match Self::read_frame(&mut stream).await {
                                Ok(msg) => handler(msg).await,
                                Err(NetError::Io(e))
                                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                                {
                                    debug!(%peer, "connection closed");
                                    break;
                                }
                                Err(e) => {
                                    warn!(%peer, "failed to decode frame: {e}");
                                    break;
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    break;
                }
            }
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl crate::Transport for TcpTransport {
    async fn send_to(&self, member: &ClusterMember, msg: &ClusterMessage) -> Result<(), NetError> {
        let target = member.socket_address();
        let conn = self.get_connection(&target).await?;

        let mut stream = conn.lock().await;
        match Self::write_frame(&mut stream, msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A failed write poisons the pooled stream; the next send
                // re-dials.
                drop(stream);
                self.remove_connection(&target).await;
                Err(e)
            }
        }
    }
}
