//! Connection manager: owns the one live link per authenticated session.
//!
//! Subscribers receive [`ConnectionEvent`]s from a channel that belongs to
//! the manager rather than to an individual link, so a reconnect never
//! doubles up delivery.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::protocol::{ClientCommand, ServerEvent};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{config::ClientSettings, error::ClientError, transport::Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    fn new(state: ConnectionState, last_error: Option<String>) -> Self {
        Self { state, last_error }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    ConnectError { attempt: u32, message: String },
    GaveUp { attempts: u32 },
    Server(ServerEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            max_attempts: settings.reconnect_attempts.max(1),
            initial_delay: settings.reconnect_delay,
            max_delay: settings.reconnect_delay_max.max(settings.reconnect_delay),
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }
}

struct Shared {
    generation: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ConnectionEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientCommand>>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn publish(&self, generation: u64, status: ConnectionStatus) -> bool {
        let _guard = self.outbound.lock().await;
        if !self.is_current(generation) {
            return false;
        }
        self.status.send_replace(status);
        true
    }

    async fn attach(&self, generation: u64, commands: mpsc::UnboundedSender<ClientCommand>) -> bool {
        let mut outbound = self.outbound.lock().await;
        if !self.is_current(generation) {
            return false;
        }
        *outbound = Some(commands);
        self.status
            .send_replace(ConnectionStatus::new(ConnectionState::Connected, None));
        let _ = self.events.send(ConnectionEvent::Connected);
        true
    }

    async fn detach(&self, generation: u64, reason: &str) -> bool {
        let mut outbound = self.outbound.lock().await;
        if !self.is_current(generation) {
            return false;
        }
        outbound.take();
        self.status.send_replace(ConnectionStatus::new(
            ConnectionState::Connecting,
            Some(reason.to_string()),
        ));
        let _ = self.events.send(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
        true
    }
}

struct Supervisor {
    credential: String,
    handle: JoinHandle<()>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    enabled: bool,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::new(ConnectionState::Disconnected, None));
        let (events, _) = broadcast::channel(1024);
        Self {
            connector,
            policy,
            enabled: true,
            shared: Arc::new(Shared {
                generation: AtomicU64::new(0),
                status,
                events,
                outbound: Mutex::new(None),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn from_settings(connector: Arc<dyn Connector>, settings: &ClientSettings) -> Self {
        let mut manager = Self::new(connector, ReconnectPolicy::from_settings(settings));
        manager.enabled = settings.realtime_enabled;
        manager
    }

    /// A manager that never dials out; every send takes the REST path.
    pub fn disabled(connector: Arc<dyn Connector>) -> Self {
        let mut manager = Self::new(connector, ReconnectPolicy::default());
        manager.enabled = false;
        manager
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status.borrow().is_connected()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.status.borrow().last_error.clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Starts (or keeps) a connection for `credential`. The same credential
    /// on a live or retrying connection is a no-op; a different one replaces
    /// the current connection.
    pub async fn connect(&self, credential: &str) {
        if !self.enabled || credential.is_empty() {
            debug!("connection: realtime disabled or no credential, staying offline");
            return;
        }

        let mut supervisor = self.supervisor.lock().await;
        if let Some(current) = supervisor.as_ref() {
            if current.credential == credential && !current.handle.is_finished() {
                return;
            }
        }
        if let Some(previous) = supervisor.take() {
            previous.handle.abort();
        }

        let generation = {
            let mut outbound = self.shared.outbound.lock().await;
            outbound.take();
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.shared
                .status
                .send_replace(ConnectionStatus::new(ConnectionState::Connecting, None));
            generation
        };

        let handle = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            self.policy,
            credential.to_string(),
            generation,
        ));
        *supervisor = Some(Supervisor {
            credential: credential.to_string(),
            handle,
        });
    }

    /// Restarts a connection that gave up, keeping the current credential.
    pub async fn reconnect(&self) {
        let credential = {
            let mut supervisor = self.supervisor.lock().await;
            match supervisor.take() {
                Some(current) => {
                    current.handle.abort();
                    current.credential
                }
                None => return,
            }
        };
        self.connect(&credential).await;
    }

    pub async fn disconnect(&self) {
        if let Some(previous) = self.supervisor.lock().await.take() {
            previous.handle.abort();
        }
        let mut outbound = self.shared.outbound.lock().await;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let was_connected = outbound.take().is_some();
        let previous = self
            .shared
            .status
            .send_replace(ConnectionStatus::new(ConnectionState::Disconnected, None));
        if was_connected || previous.state != ConnectionState::Disconnected {
            info!("connection: disconnected");
            let _ = self.shared.events.send(ConnectionEvent::Disconnected {
                reason: "client disconnect".into(),
            });
        }
    }

    /// Queues a command on the live link. Returns `false` without side
    /// effects when not connected.
    pub async fn emit(&self, command: ClientCommand) -> bool {
        let outbound = self.shared.outbound.lock().await;
        let Some(commands) = outbound.as_ref() else {
            return false;
        };
        if !self.shared.status.borrow().is_connected() {
            return false;
        }
        let name = command.name();
        if commands.send(command).is_err() {
            debug!(command = name, "connection: link closed before emit");
            return false;
        }
        true
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.handle.abort();
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    credential: String,
    generation: u64,
) {
    loop {
        let mut failures = 0u32;
        let link = loop {
            match connector.connect(&credential).await {
                Ok(link) => break link,
                Err(err) => {
                    failures += 1;
                    let message = err.to_string();
                    warn!(attempt = failures, max = policy.max_attempts, "connection: attempt failed: {message}");
                    if !shared.is_current(generation) {
                        return;
                    }
                    let _ = shared.events.send(ConnectionEvent::ConnectError {
                        attempt: failures,
                        message: message.clone(),
                    });
                    if failures >= policy.max_attempts {
                        let exhausted = ClientError::ConnectionExhausted {
                            attempts: failures,
                            last_error: message,
                        };
                        if shared
                            .publish(
                                generation,
                                ConnectionStatus::new(
                                    ConnectionState::Error,
                                    Some(exhausted.to_string()),
                                ),
                            )
                            .await
                        {
                            warn!(attempts = failures, "connection: giving up");
                            let _ = shared
                                .events
                                .send(ConnectionEvent::GaveUp { attempts: failures });
                        }
                        return;
                    }
                    if !shared
                        .publish(
                            generation,
                            ConnectionStatus::new(ConnectionState::Connecting, Some(message)),
                        )
                        .await
                    {
                        return;
                    }
                    tokio::time::sleep(policy.delay_after(failures)).await;
                }
            }
        };

        let crate::transport::Link {
            commands,
            mut events,
        } = link;
        if !shared.attach(generation, commands).await {
            return;
        }
        info!(attempts = failures + 1, "connection: established");

        while let Some(event) = events.recv().await {
            if !shared.is_current(generation) {
                return;
            }
            let _ = shared.events.send(ConnectionEvent::Server(event));
        }

        if !shared.detach(generation, "transport closed").await {
            return;
        }
        info!("connection: link dropped, reconnecting");
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
