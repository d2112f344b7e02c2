//! Transport layer abstraction.
//!
//! The channel adapter drives a [`ChannelTransport`]: it opens the
//! connection, pulls server pushes with `recv`, and sends acknowledged
//! requests. Reconnection and heartbeat live in the adapter, not here.

use crate::error::SyncResult;
use crate::protocol::{Ack, ClientMessage, ServerMessage};
use async_trait::async_trait;

/// Something that happened on the underlying connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A server push.
    Message(ServerMessage),
    /// The connection dropped.
    Closed(String),
}

/// A persistent, ordered, at-least-once JSON message connection.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Opens the connection.
    async fn open(&self, endpoint: &str, credential: &str) -> SyncResult<()>;

    /// Closes the connection. Closing a closed transport is a no-op.
    async fn close(&self);

    /// Sends a request and waits for its acknowledgement.
    async fn request(&self, message: ClientMessage) -> SyncResult<Ack>;

    /// Receives the next connection event.
    /// Returns `None` if the transport is shutting down.
    ///
    /// Must be cancel-safe: the adapter polls it inside `select!`.
    async fn recv(&self) -> Option<TransportEvent>;
}

/// A scripted in-memory transport for testing.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Produces the acknowledgement for a request. May push server messages.
    pub type Responder = Arc<dyn Fn(&ClientMessage, &MockPusher) -> SyncResult<Ack> + Send + Sync>;

    /// Injects server pushes into a [`MockTransport`].
    #[derive(Clone)]
    pub struct MockPusher {
        tx: mpsc::UnboundedSender<TransportEvent>,
    }

    impl MockPusher {
        /// Queues a server push.
        pub fn push(&self, message: ServerMessage) {
            let _ = self.tx.send(TransportEvent::Message(message));
        }
    }

    struct MockState {
        open: bool,
        reachable: bool,
        fail_next_opens: u32,
        open_calls: u32,
        sent: Vec<ClientMessage>,
        responder: Responder,
        request_delay: Option<Duration>,
    }

    struct MockShared {
        state: Mutex<MockState>,
        inbound_tx: mpsc::UnboundedSender<TransportEvent>,
        inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    }

    /// A mock transport. Clones share the same connection.
    #[derive(Clone)]
    pub struct MockTransport {
        shared: Arc<MockShared>,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockTransport {
        /// Creates a reachable transport that acknowledges every request with
        /// `{ success: true }`.
        pub fn new() -> Self {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            Self {
                shared: Arc::new(MockShared {
                    state: Mutex::new(MockState {
                        open: false,
                        reachable: true,
                        fail_next_opens: 0,
                        open_calls: 0,
                        sent: Vec::new(),
                        responder: Arc::new(|_, _| Ok(Ack::ok(None))),
                        request_delay: None,
                    }),
                    inbound_tx,
                    inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                }),
            }
        }

        /// Replaces the request responder.
        pub fn respond_with<F>(&self, responder: F)
        where
            F: Fn(&ClientMessage, &MockPusher) -> SyncResult<Ack> + Send + Sync + 'static,
        {
            self.shared.state.lock().responder = Arc::new(responder);
        }

        /// Delays every acknowledgement.
        pub fn set_request_delay(&self, delay: Option<Duration>) {
            self.shared.state.lock().request_delay = delay;
        }

        /// While unreachable, every `open` fails.
        pub fn set_reachable(&self, reachable: bool) {
            self.shared.state.lock().reachable = reachable;
        }

        /// Makes the next `count` opens fail.
        pub fn fail_next_opens(&self, count: u32) {
            self.shared.state.lock().fail_next_opens = count;
        }

        /// Drops the live connection, as a network loss would.
        pub fn drop_connection(&self, reason: impl Into<String>) {
            self.shared.state.lock().open = false;
            let _ = self.shared.inbound_tx.send(TransportEvent::Closed(reason.into()));
        }

        /// A handle for pushing server messages.
        pub fn pusher(&self) -> MockPusher {
            MockPusher {
                tx: self.shared.inbound_tx.clone(),
            }
        }

        /// Queues a server push.
        pub fn push(&self, message: ServerMessage) {
            self.pusher().push(message);
        }

        pub fn is_open(&self) -> bool {
            self.shared.state.lock().open
        }

        pub fn open_calls(&self) -> u32 {
            self.shared.state.lock().open_calls
        }

        /// Every request delivered while open, oldest first.
        pub fn sent(&self) -> Vec<ClientMessage> {
            self.shared.state.lock().sent.clone()
        }

        /// Event names of [`MockTransport::sent`], heartbeats excluded.
        pub fn sent_events(&self) -> Vec<&'static str> {
            self.shared
                .state
                .lock()
                .sent
                .iter()
                .filter(|m| !matches!(m, ClientMessage::Ping(_)))
                .map(ClientMessage::event_name)
                .collect()
        }

        pub fn clear_sent(&self) {
            self.shared.state.lock().sent.clear();
        }
    }

    #[async_trait]
    impl ChannelTransport for MockTransport {
        async fn open(&self, _endpoint: &str, _credential: &str) -> SyncResult<()> {
            let mut state = self.shared.state.lock();
            state.open_calls += 1;
            if state.fail_next_opens > 0 {
                state.fail_next_opens -= 1;
                return Err(SyncError::Transport("connection refused".into()));
            }
            if !state.reachable {
                return Err(SyncError::Transport("endpoint unreachable".into()));
            }
            state.open = true;
            // Nothing queued while closed survives into the new connection.
            if let Ok(mut rx) = self.shared.inbound_rx.try_lock() {
                while rx.try_recv().is_ok() {}
            }
            Ok(())
        }

        async fn close(&self) {
            self.shared.state.lock().open = false;
        }

        async fn request(&self, message: ClientMessage) -> SyncResult<Ack> {
            let (responder, delay) = {
                let mut state = self.shared.state.lock();
                if !state.open {
                    return Err(SyncError::NotConnected);
                }
                state.sent.push(message.clone());
                (state.responder.clone(), state.request_delay)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            responder(&message, &self.pusher())
        }

        async fn recv(&self) -> Option<TransportEvent> {
            self.shared.inbound_rx.lock().await.recv().await
        }
    }
}
