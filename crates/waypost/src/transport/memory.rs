//! In-process connector with a scriptable peer.
//!
//! Every accepted connection gets a [`MemoryPeer`] that records the frames the
//! client wrote and can push frames, close frames or a dropped connection
//! back at it.
//!
//! ```ignore
//! let connector = MemoryConnector::new();
//! let transport = TransportManager::builder(config)
//!     .connector(Arc::new(connector.clone()))
//!     .build();
//!
//! transport.connect(Some("ws://collector")).await?;
//! let peer = connector.last_peer().unwrap();
//! peer.inject_text(r#"{"type":"command","data":{"name":"flush"}}"#);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::connector::{CloseInfo, Connection, Connector, Inbound};
use super::message::WireMessage;
use super::TransportError;

/// How the connector answers the next `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    #[default]
    Accept,
    Refuse,
    /// Never answer; the caller's timeout decides.
    Hang,
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Mutex<ConnectorState>>,
}

#[derive(Default)]
struct ConnectorState {
    mode: ConnectMode,
    fail_writes: bool,
    attempts: Vec<String>,
    peers: Vec<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&self, mode: ConnectMode) {
        self.inner.lock().mode = mode;
    }

    /// Make writes fail on every connection, current and future.
    pub fn fail_writes(&self, fail: bool) {
        let mut state = self.inner.lock();
        state.fail_writes = fail;
        for peer in &state.peers {
            peer.fail_writes(fail);
        }
    }

    /// URLs of every connect call, accepted or not.
    pub fn attempts(&self) -> Vec<String> {
        self.inner.lock().attempts.clone()
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn peer(&self, index: usize) -> Option<MemoryPeer> {
        self.inner.lock().peers.get(index).cloned()
    }

    pub fn last_peer(&self) -> Option<MemoryPeer> {
        self.inner.lock().peers.last().cloned()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        let (mode, fail_writes) = {
            let mut state = self.inner.lock();
            state.attempts.push(url.to_string());
            (state.mode, state.fail_writes)
        };

        match mode {
            ConnectMode::Refuse => Err(TransportError::ConnectFailed(format!(
                "connection to {} refused",
                url
            ))),
            ConnectMode::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::ConnectFailed("unreachable".into()))
            }
            ConnectMode::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                let peer = MemoryPeer {
                    url: url.to_string(),
                    to_client: Arc::new(Mutex::new(Some(tx))),
                    shared: Arc::new(PeerShared {
                        fail_writes: AtomicBool::new(fail_writes),
                        ..PeerShared::default()
                    }),
                };
                self.inner.lock().peers.push(peer.clone());
                Ok(Box::new(MemoryConnection {
                    from_peer: rx,
                    shared: peer.shared.clone(),
                }))
            }
        }
    }
}

#[derive(Default)]
struct PeerShared {
    received: Mutex<Vec<String>>,
    closed_by_client: Mutex<Option<CloseInfo>>,
    fail_writes: AtomicBool,
}

/// Server side of one memory connection.
#[derive(Clone)]
pub struct MemoryPeer {
    url: String,
    to_client: Arc<Mutex<Option<mpsc::UnboundedSender<Inbound>>>>,
    shared: Arc<PeerShared>,
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Raw text frames written by the client.
    pub fn frames(&self) -> Vec<String> {
        self.shared.received.lock().clone()
    }

    /// Frames written by the client that parse as wire messages.
    pub fn messages(&self) -> Vec<WireMessage> {
        self.frames()
            .iter()
            .filter_map(|f| WireMessage::decode(f).ok())
            .collect()
    }

    pub fn inject_text(&self, text: impl Into<String>) -> bool {
        self.push(Inbound::Text(text.into()))
    }

    pub fn inject(&self, message: &WireMessage) -> bool {
        match message.encode() {
            Ok(text) => self.inject_text(text),
            Err(_) => false,
        }
    }

    /// Send a close frame.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.push(Inbound::Close(Some(CloseInfo::new(code, reason))))
    }

    /// Vanish without a close frame.
    pub fn drop_connection(&self) {
        self.to_client.lock().take();
    }

    /// Make the client's writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Close frame the client sent, if it closed this link.
    pub fn closed_by_client(&self) -> Option<CloseInfo> {
        self.shared.closed_by_client.lock().clone()
    }

    fn push(&self, inbound: Inbound) -> bool {
        match self.to_client.lock().as_ref() {
            Some(tx) => tx.send(inbound).is_ok(),
            None => false,
        }
    }
}

struct MemoryConnection {
    from_peer: mpsc::UnboundedReceiver<Inbound>,
    shared: Arc<PeerShared>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.shared.closed_by_client.lock().is_some() {
            return Err(TransportError::Closed("link already closed".into()));
        }
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("peer refused write".into()));
        }
        self.shared.received.lock().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        self.from_peer.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        *self.shared.closed_by_client.lock() = Some(CloseInfo::new(code, reason));
        self.from_peer.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepted_connection_round_trip() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect("mem://a").await.unwrap();
        let peer = connector.last_peer().unwrap();

        conn.send_text("hello".into()).await.unwrap();
        assert_eq!(peer.frames(), vec!["hello".to_string()]);

        peer.inject_text("world");
        assert_eq!(conn.recv().await.unwrap().unwrap(), Inbound::Text("world".into()));

        peer.drop_connection();
        assert!(conn.recv().await.is_none());
    }

    #[tokio::test]
    async fn refused_connections_are_counted() {
        let connector = MemoryConnector::new();
        connector.set_mode(ConnectMode::Refuse);
        assert!(connector.connect("mem://a").await.is_err());
        assert_eq!(connector.attempts(), vec!["mem://a".to_string()]);
        assert_eq!(connector.connection_count(), 0);
    }

    #[tokio::test]
    async fn client_close_is_recorded() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect("mem://a").await.unwrap();
        conn.close(1000, "bye").await.unwrap();

        let peer = connector.last_peer().unwrap();
        assert_eq!(peer.closed_by_client(), Some(CloseInfo::new(1000, "bye")));
        assert!(conn.send_text("late".into()).await.is_err());
    }
}
