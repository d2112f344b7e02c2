//! Channel adapter: connection lifecycle over a [`ChannelTransport`].
//!
//! Owns connect, disconnect, bounded reconnection with a fixed delay and the
//! heartbeat. Everything above it sees a status, a stream of
//! [`ChannelEvent`]s, and an acknowledged `send`.
//!
//! Exhausting the reconnect ceiling leaves the adapter in
//! [`ChannelStatus::Exhausted`]; it stays there until `connect` is called again.

use crate::config::ChannelConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{Ack, ClientMessage, ServerMessage};
use crate::state::ChannelStatus;
use crate::transport::{ChannelTransport, TransportEvent};
use parking_lot::Mutex;
use relosync_types::Timestamp;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection events delivered to listeners registered with [`ChannelAdapter::on_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Connected or reconnected.
    Connected,
    /// The live connection was lost.
    Disconnected { reason: String },
    /// One reconnection attempt failed.
    ReconnectFailed { attempt: u32, reason: String },
    /// Reconnection gave up.
    Exhausted { attempts: u32 },
    /// A server push.
    Message(ServerMessage),
}

struct Shared {
    status: watch::Sender<ChannelStatus>,
    attempts: AtomicU32,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl Shared {
    fn set_status(&self, status: ChannelStatus) {
        self.status.send_replace(status);
    }

    fn emit(&self, event: ChannelEvent) {
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

/// Owns the persistent connection to the server.
pub struct ChannelAdapter {
    transport: Arc<dyn ChannelTransport>,
    config: ChannelConfig,
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelAdapter {
    pub fn new(transport: Arc<dyn ChannelTransport>, config: ChannelConfig) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Disconnected);
        Self {
            transport,
            config,
            shared: Arc::new(Shared {
                status,
                attempts: AtomicU32::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Registers a listener for connection events.
    pub fn on_event(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.listeners.lock().push(tx);
        rx
    }

    /// Connects to `endpoint`.
    ///
    /// Idempotent: while connected, connecting or reconnecting this only logs
    /// a warning. A failed first attempt hands over to the reconnect loop.
    /// Never fails; the returned status says where the connection stands.
    pub async fn connect(&self, endpoint: &str, credential: &str) -> ChannelStatus {
        let current = self.status();
        if self.driver_running() || current == ChannelStatus::Connecting {
            warn!("connect called while {}; ignoring", current);
            return current;
        }

        info!("Connecting to {}", endpoint);
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_status(ChannelStatus::Connecting);

        let connected = match self.transport.open(endpoint, credential).await {
            Ok(()) => {
                info!("Connected to {}", endpoint);
                self.shared.set_status(ChannelStatus::Connected);
                self.shared.emit(ChannelEvent::Connected);
                true
            }
            Err(e) => {
                warn!("Initial connection to {} failed: {}", endpoint, e);
                self.shared.set_status(ChannelStatus::Disconnected);
                self.shared.emit(ChannelEvent::Disconnected {
                    reason: e.to_string(),
                });
                false
            }
        };

        let driver = Driver {
            transport: self.transport.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            endpoint: endpoint.to_string(),
            credential: credential.to_string(),
        };
        *self.driver.lock() = Some(tokio::spawn(driver.run(connected)));
        self.status()
    }

    /// Closes the connection and stops reconnecting.
    pub async fn disconnect(&self) {
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.abort();
        }
        self.transport.close().await;
        self.shared.attempts.store(0, Ordering::SeqCst);
        let previous = self.shared.status.send_replace(ChannelStatus::Disconnected);
        if previous == ChannelStatus::Connected {
            info!("Disconnected by client");
            self.shared.emit(ChannelEvent::Disconnected {
                reason: "closed by client".into(),
            });
        }
    }

    /// Sends a request with the configured acknowledgement timeout.
    pub async fn send(&self, message: ClientMessage) -> SyncResult<Ack> {
        self.send_with_timeout(message, self.config.request_timeout).await
    }

    /// Sends a request and waits up to `timeout` for its acknowledgement.
    ///
    /// Fails with [`SyncError::NotConnected`] when offline; nothing is
    /// buffered, the caller decides whether to queue.
    pub async fn send_with_timeout(&self, message: ClientMessage, timeout: Duration) -> SyncResult<Ack> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let event = message.event_name();
        debug!("Sending {}", event);
        match tokio::time::timeout(timeout, self.transport.request(message)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} not acknowledged within {:?}", event, timeout);
                Err(SyncError::Timeout(timeout))
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ChannelStatus::Connected
    }

    pub fn status(&self) -> ChannelStatus {
        *self.shared.status.borrow()
    }

    /// Watches status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status.subscribe()
    }

    /// Failed reconnection attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    fn driver_running(&self) -> bool {
        self.driver
            .lock()
            .as_ref()
            .is_some_and(|driver| !driver.is_finished())
    }
}

impl Drop for ChannelAdapter {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

/// Background task: pumps a live connection, reconnects after loss.
struct Driver {
    transport: Arc<dyn ChannelTransport>,
    config: ChannelConfig,
    shared: Arc<Shared>,
    endpoint: String,
    credential: String,
}

impl Driver {
    async fn run(self, mut connected: bool) {
        loop {
            if connected {
                let reason = self.pump().await;
                warn!("Connection lost: {}", reason);
                self.transport.close().await;
                self.shared.set_status(ChannelStatus::Disconnected);
                self.shared.emit(ChannelEvent::Disconnected { reason });
            }
            connected = self.reconnect().await;
            if !connected {
                return;
            }
        }
    }

    /// Forwards pushes until the connection drops. Returns the reason.
    async fn pump(&self) -> String {
        loop {
            let heartbeat = async {
                match self.config.heartbeat_interval {
                    Some(interval) => tokio::time::sleep(interval).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = self.transport.recv() => match event {
                    Some(TransportEvent::Message(message)) => {
                        debug!("Received {}", message.event_name());
                        self.shared.emit(ChannelEvent::Message(message));
                    }
                    Some(TransportEvent::Closed(reason)) => return reason,
                    None => return "transport shut down".to_string(),
                },
                () = heartbeat => {
                    let ping = ClientMessage::Ping(Timestamp::now().as_millis().unsigned_abs());
                    match tokio::time::timeout(self.config.request_timeout, self.transport.request(ping)).await {
                        Ok(Ok(_)) => debug!("Heartbeat acknowledged"),
                        Ok(Err(e)) => return format!("heartbeat failed: {e}"),
                        Err(_) => return "heartbeat timed out".to_string(),
                    }
                }
            }
        }
    }

    /// Retries with a fixed delay up to the ceiling. Returns whether it reconnected.
    async fn reconnect(&self) -> bool {
        let ceiling = self.config.max_reconnect_attempts;
        for attempt in 1..=ceiling {
            tokio::time::sleep(self.config.reconnect_delay).await;
            self.shared.set_status(ChannelStatus::Connecting);
            match self.transport.open(&self.endpoint, &self.credential).await {
                Ok(()) => {
                    info!("Reconnected to {} after {} attempt(s)", self.endpoint, attempt);
                    self.shared.attempts.store(0, Ordering::SeqCst);
                    self.shared.set_status(ChannelStatus::Connected);
                    self.shared.emit(ChannelEvent::Connected);
                    return true;
                }
                Err(e) => {
                    warn!("Reconnect attempt {}/{} failed: {}", attempt, ceiling, e);
                    self.shared.attempts.store(attempt, Ordering::SeqCst);
                    self.shared.set_status(ChannelStatus::Disconnected);
                    self.shared.emit(ChannelEvent::ReconnectFailed {
                        attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
        warn!("Giving up on {} after {} reconnect attempts", self.endpoint, ceiling);
        self.shared.set_status(ChannelStatus::Exhausted);
        self.shared.emit(ChannelEvent::Exhausted { attempts: ceiling });
        false
    }
}
