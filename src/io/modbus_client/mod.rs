// src/io/modbus_client/mod.rs
//
// Modbus client (master): owns one transport connection and its state
// machine, and drives reads, polling, writes and scans over it.
//
// State machine:
//   Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
// plus the auto-reconnect loop Connected -> (link lost) -> Connecting -> ...
// A link counts as lost when a request fails on a closed connection or when
// the transport's close signal fires, which covers an idle client.
//
// `ModbusClient` is a cheap handle; clones share the same session. Long
// running work (poll loop, reconnect timer, stability timer) runs on spawned
// tasks that hold a clone and check their flags after every await.

mod config;
#[cfg(test)]
mod mock;
mod reader;
mod scanner;
mod writer;

pub use config::{
    split_range, ConnectionConfig, MappingEntry, RegisterConfig, RegisterMapping, RtuParams,
    TcpParams, TransportKind,
};
pub use reader::{RegisterData, Transaction};
pub use scanner::{ProbeOutcome, RegisterScanParams, ScanUnitIdResult, UnitIdScanParams};
pub use writer::{WriteParams, WriteValue};

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::events::{emit_message, BackendEvent, MessageVariant, SharedEmitter};
use crate::io::transport::{default_factory, ModbusTransport, TransportFactory, DEFAULT_TIMEOUT};
use crate::io::ModbusError;
pub(crate) use crate::io::lock;

/// Transport slot shared between in-flight operations. The outer Arc is
/// swapped out when a hung transport has to be abandoned.
type SharedTransport = Arc<tokio::sync::Mutex<Box<dyn ModbusTransport>>>;

// ============================================================================
// State
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Snapshot of the client published on every change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientState {
    pub connect_state: ConnectState,
    pub polling: bool,
    pub scanning_unit_id: bool,
    pub scanning_registers: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            connect_state: ConnectState::Disconnected,
            polling: false,
            scanning_unit_id: false,
            scanning_registers: false,
        }
    }
}

impl ClientState {
    pub fn scanning(&self) -> bool {
        self.scanning_unit_id || self.scanning_registers
    }
}

/// Auto-reconnect and disconnect timing.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Wait before each reconnect attempt
    pub delay: Duration,
    /// Consecutive lost links and failed re-opens at which auto-reconnect gives up
    pub max_attempts: u32,
    /// A connection open this long resets the attempt counter
    pub stable_period: Duration,
    /// Close deadline before the transport is abandoned
    pub disconnect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: 5,
            stable_period: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

struct ClientInner {
    emitter: SharedEmitter,
    factory: TransportFactory,
    policy: ReconnectPolicy,
    transport: Mutex<SharedTransport>,
    state: Mutex<ClientState>,
    connection: Mutex<ConnectionConfig>,
    registers: Mutex<RegisterConfig>,
    mapping: Mutex<RegisterMapping>,

    deliberate_disconnect: AtomicBool,
    auto_reconnect: AtomicBool,
    reconnect_pending: AtomicBool,
    reconnect_count: AtomicU32,
    /// Bumped by explicit connect/disconnect; stale reconnect timers check it
    session: AtomicU64,
    /// Bumped whenever the link opens or is lost; stability timers check it
    epoch: AtomicU64,

    stop_unit_scan: AtomicBool,
    stop_register_scan: AtomicBool,
    poll_wake: Notify,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a Modbus client session.
#[derive(Clone)]
pub struct ModbusClient {
    inner: Arc<ClientInner>,
}

impl ModbusClient {
    /// Client using tokio-modbus transports and the default reconnect policy.
    pub fn new(emitter: SharedEmitter) -> Self {
        Self::with_transport(emitter, default_factory(), ReconnectPolicy::default())
    }

    pub fn with_transport(
        emitter: SharedEmitter,
        factory: TransportFactory,
        policy: ReconnectPolicy,
    ) -> Self {
        let config = ConnectionConfig::default();
        let transport: SharedTransport = Arc::new(tokio::sync::Mutex::new(factory(&config)));
        Self {
            inner: Arc::new(ClientInner {
                emitter,
                factory,
                policy,
                transport: Mutex::new(transport),
                state: Mutex::new(ClientState::default()),
                connection: Mutex::new(config),
                registers: Mutex::new(RegisterConfig::default()),
                mapping: Mutex::new(RegisterMapping::default()),
                deliberate_disconnect: AtomicBool::new(false),
                auto_reconnect: AtomicBool::new(true),
                reconnect_pending: AtomicBool::new(false),
                reconnect_count: AtomicU32::new(0),
                session: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                stop_unit_scan: AtomicBool::new(false),
                stop_register_scan: AtomicBool::new(false),
                poll_wake: Notify::new(),
                poll_task: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn connection_config(&self) -> ConnectionConfig {
        lock(&self.inner.connection).clone()
    }

    /// Takes effect on the next connect; the unit id applies to the next request.
    pub fn set_connection_config(&self, config: ConnectionConfig) {
        *lock(&self.inner.connection) = config;
    }

    pub fn register_config(&self) -> RegisterConfig {
        lock(&self.inner.registers).clone()
    }

    pub fn set_register_config(&self, config: RegisterConfig) {
        *lock(&self.inner.registers) = config;
    }

    pub fn mapping(&self) -> RegisterMapping {
        lock(&self.inner.mapping).clone()
    }

    pub fn set_mapping(&self, mapping: RegisterMapping) {
        *lock(&self.inner.mapping) = mapping;
    }

    pub fn state(&self) -> ClientState {
        lock(&self.inner.state).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connect_state == ConnectState::Connected
    }

    /// Lost links and failed re-opens counted since the last stable connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_count.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------------

    fn transport(&self) -> SharedTransport {
        lock(&self.inner.transport).clone()
    }

    pub(crate) fn emit(&self, event: BackendEvent) {
        self.inner.emitter.emit(event);
    }

    pub(crate) fn message(&self, variant: MessageVariant, message: impl Into<String>) {
        emit_message(self.inner.emitter.as_ref(), variant, "ModbusClient", message);
    }

    /// Apply `f` to the state and publish the result if anything changed.
    pub(crate) fn update_state(&self, f: impl FnOnce(&mut ClientState)) {
        let (before, after) = {
            let mut state = lock(&self.inner.state);
            let before = state.clone();
            f(&mut state);
            (before, state.clone())
        };
        if before == after {
            return;
        }
        if before.connect_state != after.connect_state {
            tlog!(
                "[ModbusClient] {:?} -> {:?}",
                before.connect_state,
                after.connect_state
            );
        }
        self.emit(BackendEvent::ClientState(after));
    }

    fn set_connect_state(&self, connect_state: ConnectState) {
        self.update_state(|s| s.connect_state = connect_state);
    }

    fn session_current(&self, session: u64) -> bool {
        self.inner.session.load(Ordering::SeqCst) == session
            && !self.inner.deliberate_disconnect.load(Ordering::SeqCst)
    }

    /// Open a fresh transport for the current config and install it, unless
    /// `session` went stale while it was opening. A stale link is closed
    /// again and `Ok(false)` returned.
    async fn open_transport(&self, session: u64) -> Result<bool, ModbusError> {
        let config = self.connection_config();
        let mut fresh = (self.inner.factory)(&config);
        fresh.set_unit_id(config.unit_id);
        fresh.set_timeout(DEFAULT_TIMEOUT);
        fresh.set_capture(true);
        fresh.open().await?;
        let close_signal = fresh.take_close_signal();

        // Checked under the slot lock; disconnect bumps the session before
        // it takes the slot, so it either sees this transport or we see it.
        let stale = {
            let mut slot = lock(&self.inner.transport);
            if self.session_current(session) {
                *slot = Arc::new(tokio::sync::Mutex::new(fresh));
                None
            } else {
                Some(fresh)
            }
        };
        if let Some(mut stale) = stale {
            tlog!("[ModbusClient] Session changed while opening, closing the new link");
            if let Err(e) = stale.close().await {
                tlog!("[ModbusClient] Closing stale link failed: {}", e);
            }
            return Ok(false);
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(signal) = close_signal {
            self.watch_close(signal, epoch);
        }
        Ok(true)
    }

    /// Report a peer close of the link installed at `epoch`.
    fn watch_close(&self, signal: oneshot::Receiver<String>, epoch: u64) {
        let client = self.clone();
        tokio::spawn(async move {
            // A dropped sender means the link was closed locally
            let Ok(reason) = signal.await else {
                return;
            };
            if client.inner.epoch.load(Ordering::SeqCst) == epoch {
                client.on_connection_lost(&reason);
            }
        });
    }

    // ------------------------------------------------------------------------
    // Connect / Disconnect
    // ------------------------------------------------------------------------

    /// Open the configured transport. A failed connect does not enter the
    /// reconnect loop.
    pub async fn connect(&self) -> Result<(), ModbusError> {
        let transport = self.transport();
        if transport.lock().await.is_open() {
            self.message(MessageVariant::Warning, "Already connected");
            self.set_connect_state(ConnectState::Connected);
            return Ok(());
        }

        let inner = &self.inner;
        let session = inner.session.fetch_add(1, Ordering::SeqCst) + 1;
        inner.deliberate_disconnect.store(false, Ordering::SeqCst);
        inner.auto_reconnect.store(true, Ordering::SeqCst);
        inner.reconnect_pending.store(false, Ordering::SeqCst);
        inner.reconnect_count.store(0, Ordering::SeqCst);
        self.set_connect_state(ConnectState::Connecting);

        let target = self.connection_config().describe();
        match self.open_transport(session).await {
            Ok(false) => {
                self.message(
                    MessageVariant::Warning,
                    format!("Connect to {} cancelled by disconnect", target),
                );
                Err(ModbusError::ConnectionClosed("connect cancelled".into()))
            }
            Ok(true) => {
                self.message(MessageVariant::Success, format!("Connected to {}", target));
                self.set_connect_state(ConnectState::Connected);
                self.watch_stability();
                Ok(())
            }
            Err(e) => {
                self.message(
                    MessageVariant::Error,
                    format!("Failed to connect to {}: {}", target, e),
                );
                self.set_connect_state(ConnectState::Disconnected);
                Err(e)
            }
        }
    }

    /// Deliberately close the connection. Never fails; problems are reported
    /// as notifications and the client always settles in Disconnected.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.deliberate_disconnect.store(true, Ordering::SeqCst);
        inner.session.fetch_add(1, Ordering::SeqCst);
        inner.reconnect_pending.store(false, Ordering::SeqCst);
        self.set_connect_state(ConnectState::Disconnecting);
        self.stop_polling();

        let transport = self.transport();
        let close = async move {
            let mut transport = transport.lock().await;
            if !transport.is_open() {
                return Ok(false);
            }
            transport.close().await.map(|_| true)
        };

        match tokio::time::timeout(inner.policy.disconnect_timeout, close).await {
            Ok(Ok(true)) => self.message(MessageVariant::Success, "Disconnected"),
            Ok(Ok(false)) => self.message(MessageVariant::Warning, "Already disconnected"),
            Ok(Err(e)) => self.message(MessageVariant::Error, format!("Disconnect failed: {}", e)),
            Err(_) => {
                let fresh = (inner.factory)(&self.connection_config());
                *lock(&inner.transport) = Arc::new(tokio::sync::Mutex::new(fresh));
                self.message(
                    MessageVariant::Warning,
                    "Disconnect timeout, connection destroyed",
                );
            }
        }
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.set_connect_state(ConnectState::Disconnected);
    }

    // ------------------------------------------------------------------------
    // Auto-reconnect
    // ------------------------------------------------------------------------

    /// Inspect a transport error; a lost link on an open connection starts
    /// the reconnect loop.
    pub(crate) fn handle_transport_error(&self, err: &ModbusError) {
        if err.is_connection_lost() {
            self.on_connection_lost(&err.to_string());
        }
    }

    fn on_connection_lost(&self, reason: &str) {
        let inner = &self.inner;
        if inner.deliberate_disconnect.load(Ordering::SeqCst) {
            return;
        }
        // Only a previously open connection reconnects
        if self.state().connect_state != ConnectState::Connected {
            return;
        }
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        tlog!("[ModbusClient] Connection lost: {}", reason);

        if !inner.auto_reconnect.load(Ordering::SeqCst) {
            self.message(MessageVariant::Error, "Connection closed unexpectedly");
            self.set_connect_state(ConnectState::Disconnected);
            return;
        }
        self.schedule_reconnect();
    }

    /// Count one lost link or failed re-open and schedule the next attempt.
    /// Reaching the cap gives up instead.
    fn schedule_reconnect(&self) {
        let inner = &self.inner;
        if inner.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let count = inner.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= inner.policy.max_attempts {
            inner.reconnect_pending.store(false, Ordering::SeqCst);
            inner.auto_reconnect.store(false, Ordering::SeqCst);
            self.message(
                MessageVariant::Error,
                format!(
                    "Too many consecutive reconnects ({}), giving up",
                    inner.policy.max_attempts
                ),
            );
            self.set_connect_state(ConnectState::Disconnected);
            return;
        }

        self.set_connect_state(ConnectState::Connecting);
        self.message(
            MessageVariant::Warning,
            format!(
                "Connection lost, reconnecting in {}s (attempt {}/{})",
                inner.policy.delay.as_secs_f64(),
                count,
                inner.policy.max_attempts
            ),
        );

        let session = inner.session.load(Ordering::SeqCst);
        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(client.inner.policy.delay).await;
            let inner = &client.inner;
            if !client.session_current(session) {
                return;
            }
            inner.reconnect_pending.store(false, Ordering::SeqCst);

            match client.open_transport(session).await {
                Ok(true) => {
                    client.message(MessageVariant::Success, "Reconnected");
                    client.set_connect_state(ConnectState::Connected);
                    client.watch_stability();
                }
                // Disconnected meanwhile; the fresh link was closed again
                Ok(false) => {}
                Err(e) => {
                    tlog!("[ModbusClient] Reconnect attempt failed: {}", e);
                    if client.session_current(session) {
                        client.schedule_reconnect();
                    }
                }
            }
        });
    }

    /// Reset the reconnect counter once the current link has stayed up.
    fn watch_stability(&self) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(client.inner.policy.stable_period).await;
            let inner = &client.inner;
            if inner.epoch.load(Ordering::SeqCst) == epoch && client.is_connected() {
                if inner.reconnect_count.swap(0, Ordering::SeqCst) > 0 {
                    tlog!("[ModbusClient] Connection stable, reconnect counter reset");
                }
            }
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::mock::{mock_factory, MockDevice};
    use super::*;
    use crate::events::{ChannelEmitter, EventEmitter};
    use crate::io::RegisterType;

    pub(super) fn client_with(device: &Arc<Mutex<MockDevice>>) -> ModbusClient {
        ModbusClient::with_transport(
            Arc::new(crate::events::NullEmitter),
            mock_factory(device.clone()),
            ReconnectPolicy::default(),
        )
    }

    fn messages(rx: &mut tokio::sync::mpsc::UnboundedReceiver<BackendEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BackendEvent::BackendMessage(m) = event {
                out.push(m.message);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_disconnect() {
        let device = MockDevice::shared();
        let (emitter, mut rx) = ChannelEmitter::new();
        let client = ModbusClient::with_transport(
            emitter as Arc<dyn EventEmitter>,
            mock_factory(device.clone()),
            ReconnectPolicy::default(),
        );

        assert_eq!(client.state().connect_state, ConnectState::Disconnected);
        client.connect().await.unwrap();
        assert!(client.is_connected());

        // Second connect is a warning, not an error
        client.connect().await.unwrap();
        assert!(client.is_connected());

        client.disconnect().await;
        assert_eq!(client.state().connect_state, ConnectState::Disconnected);

        let msgs = messages(&mut rx);
        assert!(msgs.iter().any(|m| m.starts_with("Connected to")));
        assert!(msgs.iter().any(|m| m == "Already connected"));
        assert!(msgs.iter().any(|m| m == "Disconnected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_does_not_reconnect() {
        let device = MockDevice::shared();
        lock(&device).fail_open = true;
        let client = client_with(&device);

        assert!(client.connect().await.is_err());
        assert_eq!(client.state().connect_state, ConnectState::Disconnected);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(lock(&device).open_attempts, 1);
        assert_eq!(client.state().connect_state, ConnectState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_when_already_closed_warns() {
        let device = MockDevice::shared();
        let (emitter, mut rx) = ChannelEmitter::new();
        let client = ModbusClient::with_transport(
            emitter as Arc<dyn EventEmitter>,
            mock_factory(device),
            ReconnectPolicy::default(),
        );
        client.disconnect().await;
        assert_eq!(client.state().connect_state, ConnectState::Disconnected);
        assert!(messages(&mut rx).iter().any(|m| m == "Already disconnected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_timeout_replaces_transport() {
        let device = MockDevice::shared();
        let (emitter, mut rx) = ChannelEmitter::new();
        let client = ModbusClient::with_transport(
            emitter as Arc<dyn EventEmitter>,
            mock_factory(device.clone()),
            ReconnectPolicy::default(),
        );
        client.connect().await.unwrap();
        lock(&device).hang_close = true;

        client.disconnect().await;
        assert_eq!(client.state().connect_state, ConnectState::Disconnected);
        let msgs = messages(&mut rx);
        assert!(msgs.iter().any(|m| m.contains("Disconnect timeout")));
        assert!(!msgs.iter().any(|m| m.starts_with("Disconnect failed")));

        // The replacement transport is closed and usable for a new connect
        lock(&device).hang_close = false;
        client.connect().await.unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_link_loss() {
        let device = MockDevice::shared();
        let client = client_with(&device);
        client.connect().await.unwrap();

        lock(&device).link_up = false;
        assert!(client.read(0, 1, RegisterType::HoldingRegisters).await.is_err());
        assert_eq!(client.state().connect_state, ConnectState::Connecting);
        assert_eq!(client.reconnect_attempts(), 1);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(client.is_connected());

        // Stable for 10s resets the counter
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(client.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_cap() {
        let device = MockDevice::shared();
        let (emitter, mut rx) = ChannelEmitter::new();
        let client = ModbusClient::with_transport(
            emitter as Arc<dyn EventEmitter>,
            mock_factory(device.clone()),
            ReconnectPolicy::default(),
        );
        client.connect().await.unwrap();

        {
            let mut d = lock(&device);
            d.link_up = false;
            d.fail_open = true;
        }
        let _ = client.read(0, 1, RegisterType::HoldingRegisters).await;

        // The lost link and four failed re-opens reach the cap of five
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(lock(&device).open_attempts, 1 + 4);
        assert_eq!(client.state().connect_state, ConnectState::Disconnected);

        let msgs = messages(&mut rx);
        assert!(msgs.iter().any(|m| m.starts_with("Too many consecutive reconnects")));
        // One notice per scheduled attempt, no duplicates
        assert_eq!(
            msgs.iter().filter(|m| m.starts_with("Connection lost")).count(),
            4
        );

        // Nothing else is attempted afterwards
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(lock(&device).open_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifth_lost_link_gives_up() {
        let device = MockDevice::shared();
        let client = client_with(&device);
        client.connect().await.unwrap();

        for close in 1..=5u32 {
            lock(&device).link_up = false;
            let _ = client.read(0, 1, RegisterType::HoldingRegisters).await;
            tokio::time::sleep(Duration::from_millis(3100)).await;
            if close < 5 {
                assert!(client.is_connected(), "close {} should reconnect", close);
                assert_eq!(client.reconnect_attempts(), close);
            }
        }

        assert_eq!(client.state().connect_state, ConnectState::Disconnected);
        assert_eq!(lock(&device).open_attempts, 1 + 4);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(lock(&device).open_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peer_close_starts_reconnect() {
        let device = MockDevice::shared();
        let (emitter, mut rx) = ChannelEmitter::new();
        let client = ModbusClient::with_transport(
            emitter as Arc<dyn EventEmitter>,
            mock_factory(device.clone()),
            ReconnectPolicy::default(),
        );
        client.connect().await.unwrap();

        // No request in flight: only the close signal can notice this
        lock(&device).peer_close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state().connect_state, ConnectState::Connecting);
        assert!(messages(&mut rx).iter().any(|m| m.starts_with("Connection lost")));

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(client.is_connected());
        assert_eq!(lock(&device).open_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_reopening_closes_fresh_link() {
        let device = MockDevice::shared();
        let client = client_with(&device);
        client.connect().await.unwrap();

        lock(&device).open_delay = Duration::from_millis(500);
        lock(&device).link_up = false;
        let _ = client.read(0, 1, RegisterType::HoldingRegisters).await;

        // Reconnect timer fired at 3s; its open is still in flight
        tokio::time::sleep(Duration::from_millis(3100)).await;
        client.disconnect().await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(lock(&device).open_attempts, 2);
        assert_eq!(client.state().connect_state, ConnectState::Disconnected);
        assert!(!client.transport().lock().await.is_open());

        // A fresh connect really opens instead of reporting "Already connected"
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(lock(&device).open_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliberate_disconnect_cancels_pending_reconnect() {
        let device = MockDevice::shared();
        let client = client_with(&device);
        client.connect().await.unwrap();

        lock(&device).link_up = false;
        let _ = client.read(0, 1, RegisterType::HoldingRegisters).await;
        assert_eq!(client.state().connect_state, ConnectState::Connecting);

        client.disconnect().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(lock(&device).open_attempts, 1);
        assert_eq!(client.state().connect_state, ConnectState::Disconnected);
    }
}
