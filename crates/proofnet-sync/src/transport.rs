//! Stream transports.
//!
//! A transport opens byte streams to socket addresses. The protocol runs the
//! same over TCP and over the in-memory network used in tests; only the
//! dialing differs.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use proofnet_core::NodeId;

use crate::connection::{BoxedStream, Connection};
use crate::deferred::ClosestNode;
use crate::error::{Result, SyncError};
use crate::salutation::Splicer;

/// Opens streams to peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `addr`.
    async fn connect(&self, addr: SocketAddr) -> Result<BoxedStream>;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: SocketAddr) -> Result<BoxedStream> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Splices connections to the node the routes say is closest to the
/// target.
pub struct RouteSplicer {
    transport: Arc<dyn Transport>,
    routes: Arc<dyn ClosestNode>,
}

impl RouteSplicer {
    pub fn new(transport: Arc<dyn Transport>, routes: Arc<dyn ClosestNode>) -> Self {
        Self { transport, routes }
    }
}

#[async_trait]
impl Splicer for RouteSplicer {
    async fn splice(&self, target: NodeId, salutation: Bytes, conn: Connection) -> Result<()> {
        let closest = self.routes.closest(&target).await;
        let address = match closest.address {
            Some(address) if closest.node == target => address,
            _ => {
                return Err(SyncError::Internal(format!("no route to {target} for splicing")));
            }
        };
        let conn_id = conn.id();
        let upstream = self.transport.connect(address).await?;
        let (mut up_read, mut up_write) = tokio::io::split(upstream);
        let (mut reader, mut writer, buffered) = conn.into_raw()?;

        up_write.write_all(&salutation).await?;
        up_write.write_all(&buffered).await?;

        let outbound = async {
            let n = tokio::io::copy(&mut reader, &mut up_write).await;
            finish(&mut up_write).await;
            n
        };
        let inbound = async {
            let n = tokio::io::copy(&mut up_read, &mut writer).await;
            finish(&mut writer).await;
            n
        };
        let (sent, received) = tokio::join!(outbound, inbound);
        tracing::debug!(
            conn = %conn_id,
            target = %target,
            sent = sent.as_ref().ok().copied(),
            received = received.as_ref().ok().copied(),
            "splice finished"
        );
        sent?;
        received?;
        Ok(())
    }
}

async fn finish<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W) {
    let _ = writer.shutdown().await;
}

/// In-memory network of duplex streams, addressed by socket address.
pub mod memory {
    use super::*;
    use std::collections::HashMap;

    use tokio::sync::{mpsc, RwLock};

    const DUPLEX_BUFFER: usize = 64 * 1024;

    type Incoming = (BoxedStream, SocketAddr);

    /// Shared registry of listening addresses.
    #[derive(Default)]
    pub struct MemoryNetwork {
        listeners: RwLock<HashMap<SocketAddr, mpsc::Sender<Incoming>>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Start listening on `addr`. Replaces any earlier listener.
        pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> MemoryListener {
            let (tx, rx) = mpsc::channel(64);
            self.listeners.write().await.insert(addr, tx);
            MemoryListener {
                addr,
                network: Arc::clone(self),
                incoming: rx,
            }
        }

        /// A transport that dials from `local`.
        pub fn transport(self: &Arc<Self>, local: SocketAddr) -> MemoryTransport {
            MemoryTransport {
                local,
                network: Arc::clone(self),
            }
        }
    }

    /// Accepts connections made to one address.
    pub struct MemoryListener {
        addr: SocketAddr,
        network: Arc<MemoryNetwork>,
        incoming: mpsc::Receiver<Incoming>,
    }

    impl MemoryListener {
        pub fn local_addr(&self) -> SocketAddr {
            self.addr
        }

        /// Next incoming stream and the dialer's address.
        pub async fn accept(&mut self) -> Option<Incoming> {
            self.incoming.recv().await
        }

        /// Stop listening.
        pub async fn close(self) {
            self.network.listeners.write().await.remove(&self.addr);
        }
    }

    /// Dials through a [`MemoryNetwork`].
    #[derive(Clone)]
    pub struct MemoryTransport {
        local: SocketAddr,
        network: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn connect(&self, addr: SocketAddr) -> Result<BoxedStream> {
            let listener = self
                .network
                .listeners
                .read()
                .await
                .get(&addr)
                .cloned()
                .ok_or_else(|| {
                    SyncError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        format!("nothing listens on {addr}"),
                    ))
                })?;
            let (near, far) = tokio::io::duplex(DUPLEX_BUFFER);
            listener.send((Box::new(far), self.local)).await.map_err(|_| {
                SyncError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("listener on {addr} is gone"),
                ))
            })?;
            Ok(Box::new(near))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use tokio::io::AsyncReadExt;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_memory_connect_and_accept() {
        let network = MemoryNetwork::new();
        let mut listener = network.listen(addr(7000)).await;
        let transport = network.transport(addr(9000));

        let mut dialed = transport.connect(addr(7000)).await.unwrap();
        let (mut accepted, from) = listener.accept().await.unwrap();
        assert_eq!(from, addr(9000));

        dialed.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_connect_refused_without_listener() {
        let network = MemoryNetwork::new();
        let transport = network.transport(addr(9000));
        let err = match transport.connect(addr(7000)).await {
            Err(e) => e,
            Ok(_) => panic!("connected to nothing"),
        };
        assert!(err.is_stream());

        let listener = network.listen(addr(7000)).await;
        listener.close().await;
        assert!(transport.connect(addr(7000)).await.is_err());
    }
}
